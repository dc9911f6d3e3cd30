pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod observability;
pub mod server;
pub mod signals;

pub use logging::{init_server_tracing, init_tracing};
