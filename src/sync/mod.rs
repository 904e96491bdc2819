//! The synchronization engine.
//!
//! Discovery pushes tracker issues to the platform as tags; posting turns the
//! platform's posted time into tracker work logs. The [`Reconciler`] drives
//! both through one cycle state machine and owns cursor advancement.

pub mod discovery;
pub mod posting;
pub mod reconciler;
pub mod retry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::providers::{Platform, Tracker};
use crate::store::IdentityStore;

pub use reconciler::Reconciler;

/// Everything a pipeline needs for one item: both systems, the store, settings.
pub struct SyncContext {
    pub tracker: Arc<dyn Tracker>,
    pub platform: Arc<dyn Platform>,
    pub store: IdentityStore,
    pub config: AppConfig,
    shutdown: watch::Receiver<bool>,
}

impl SyncContext {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        platform: Arc<dyn Platform>,
        store: IdentityStore,
        config: AppConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            tracker,
            platform,
            store,
            config,
            shutdown,
        }
    }

    /// True once shutdown has been requested. Checked between items.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run an external call under the configured call timeout.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        with_timeout(self.config.call_timeout(), fut).await
    }
}

/// Elapsed timeouts surface as [`ApiError::Timeout`], which is retryable.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    }
}

#[cfg(test)]
pub(crate) mod testkit;
