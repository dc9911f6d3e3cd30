use std::future::Future;
use std::sync::Arc;

use crate::config::StreamingConfig;
use crate::error::AppError;
use crate::observability::{Hub, StoreError};

pub mod health;
pub mod logs_api;
pub mod metrics_api;
pub mod metrics_handler;
pub mod sse;
pub mod ws;

/// Shared state for the API routes
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub streaming: StreamingConfig,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, streaming: StreamingConfig) -> Self {
        Self { hub, streaming }
    }

    /// Run a history query under `historical_timeout`
    pub async fn bounded_query<T, F>(&self, query: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.streaming.historical_timeout();
        match tokio::time::timeout(timeout, query).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "History query timed out");
                Err(AppError::Timeout(format!(
                    "history query exceeded {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}
