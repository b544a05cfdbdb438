//! Best-effort deletion of external resources orphaned by removed bindings.
//!
//! Every drained item is attempted at most once and always dequeued. A permanently failing
//! resource would otherwise starve every newer item behind it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::store::{timed, BillingStore};

/// key: billing-cleanup -> external deletion collaborator
#[async_trait]
pub trait ExternalResourceDeleter: Send + Sync {
    /// Deletes the resource. A resource that is already gone counts as deleted.
    async fn delete(&self, external_resource_id: &str) -> Result<(), AppError>;
}

pub struct HttpResourceDeleter {
    base: String,
    token: Option<String>,
    client: Client,
}

impl HttpResourceDeleter {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            token,
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
        })
    }
}

#[async_trait]
impl ExternalResourceDeleter for HttpResourceDeleter {
    async fn delete(&self, external_resource_id: &str) -> Result<(), AppError> {
        let url = format!("{}/{}", self.base, external_resource_id);
        let mut request = self.client.delete(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|error| AppError::ExternalResourceFailure(error.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(AppError::ExternalResourceFailure(format!(
                "{external_resource_id}: upstream returned {status}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DrainReport {
    pub cleaned: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.cleaned + self.failed
    }
}

/// key: billing-cleanup -> queue drainer
#[derive(Clone)]
pub struct CleanupDrainer {
    store: Arc<dyn BillingStore>,
    deleter: Arc<dyn ExternalResourceDeleter>,
    store_timeout: Duration,
    default_batch_size: usize,
    max_batch_size: usize,
}

impl CleanupDrainer {
    pub fn new(
        store: Arc<dyn BillingStore>,
        deleter: Arc<dyn ExternalResourceDeleter>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            deleter,
            store_timeout,
            default_batch_size: 50,
            max_batch_size: 500,
        }
    }

    pub fn with_batch_limits(mut self, default_batch_size: usize, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self.default_batch_size = default_batch_size.clamp(1, self.max_batch_size);
        self
    }

    /// Batch size for a trigger, clamped to the configured ceiling.
    pub fn batch_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_batch_size)
            .min(self.max_batch_size)
    }

    /// Processes up to `batch_size` of the oldest queued items.
    ///
    /// Items are claimed off the queue before any deletion is attempted, so overlapping drains
    /// never share an item. External failures are logged and counted, never re-queued. A failed
    /// claim propagates and leaves the queue untouched.
    pub async fn drain(&self, batch_size: usize) -> AppResult<DrainReport> {
        let mut report = DrainReport::default();
        if batch_size == 0 {
            return Ok(report);
        }

        let items = timed(
            self.store_timeout,
            self.store.claim_cleanup_items(batch_size),
        )
        .await?;

        for item in items {
            match self.deleter.delete(&item.external_resource_id).await {
                Ok(()) => report.cleaned += 1,
                Err(error) => {
                    tracing::warn!(
                        item_id = %item.id,
                        external_resource_id = %item.external_resource_id,
                        queued_at = %item.created_at,
                        %error,
                        "external resource deletion failed; dropped from cleanup queue"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            cleaned = report.cleaned,
            failed = report.failed,
            batch_size,
            "cleanup queue drained"
        );
        Ok(report)
    }
}
