//! Persistence seam for the entitlement engine.
//!
//! Every read the evaluators perform goes through [`BillingStore`], and every call the engine
//! makes is bounded by [`timed`] so a slow store surfaces as a retryable error instead of a
//! hung request.

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::billing::charges::ChargeStatus;
use crate::billing::models::{
    BillingClient, CleanupQueueItem, NewScheduledCharge, NewUsageRecord, Profile, ScheduledCharge,
    Tool, UsageRecord, Workspace, WorkspaceMember, WorkspaceTool, WorkspaceToolPatch,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Connection trouble and deadlines may clear on retry. Rows that fail to map will not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Decode(_) => false,
            StoreError::Database(error) => !matches!(
                error,
                sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnIndexOutOfBounds { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Conditional status move. Applies only while the row still holds `from`.
#[derive(Debug, Clone)]
pub struct ChargeTransition {
    pub charge_id: Uuid,
    pub from: ChargeStatus,
    pub to: ChargeStatus,
    pub failure_reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// key: billing-store -> collaborator contract
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn profile(&self, user_id: Uuid) -> StoreResult<Option<Profile>>;

    /// Memberships of a user joined to their workspaces, oldest membership first.
    async fn memberships(&self, user_id: Uuid) -> StoreResult<Vec<(WorkspaceMember, Workspace)>>;

    async fn workspace(&self, workspace_id: Uuid) -> StoreResult<Option<Workspace>>;

    /// Legacy per-user link.
    async fn billing_client_for_user(&self, user_id: Uuid) -> StoreResult<Option<BillingClient>>;

    async fn tool(&self, tool_id: Uuid) -> StoreResult<Option<Tool>>;

    async fn tool_by_slug(&self, slug: &str) -> StoreResult<Option<Tool>>;

    /// Globally enabled tools, ordered by slug.
    async fn enabled_tools(&self) -> StoreResult<Vec<Tool>>;

    async fn workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
    ) -> StoreResult<Option<WorkspaceTool>>;

    async fn workspace_tools(&self, workspace_id: Uuid) -> StoreResult<Vec<WorkspaceTool>>;

    /// Upserts the `(workspace, tool)` row. `enabled_at`/`disabled_at` are set opposite.
    async fn toggle_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        is_enabled: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<WorkspaceTool>;

    /// Returns `None` when no row exists for the pair.
    async fn update_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        patch: WorkspaceToolPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<WorkspaceTool>>;

    async fn insert_usage_record(&self, record: NewUsageRecord) -> StoreResult<UsageRecord>;

    /// Records with `start <= occurred_at < end`, ordered by `(occurred_at, id)`.
    async fn usage_records(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        workspace_id: Option<Uuid>,
    ) -> StoreResult<Vec<UsageRecord>>;

    async fn charge(&self, charge_id: Uuid) -> StoreResult<Option<ScheduledCharge>>;

    async fn charges_for_client(&self, billing_client_id: Uuid)
        -> StoreResult<Vec<ScheduledCharge>>;

    async fn insert_charge(&self, charge: NewScheduledCharge) -> StoreResult<ScheduledCharge>;

    /// Returns the updated row, or `None` if the current status no longer matched `from`.
    async fn transition_charge(
        &self,
        transition: ChargeTransition,
    ) -> StoreResult<Option<ScheduledCharge>>;

    async fn enqueue_cleanup(
        &self,
        external_resource_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<CleanupQueueItem>;

    /// Atomically removes and returns up to `limit` of the oldest items, oldest first.
    /// Concurrent callers never receive the same item.
    async fn claim_cleanup_items(&self, limit: usize) -> StoreResult<Vec<CleanupQueueItem>>;
}

/// Bounds a store round-trip by `limit`.
pub async fn timed<T, F>(limit: Duration, operation: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
