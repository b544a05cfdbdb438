//! In-memory store used by tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BillingStore, ChargeTransition, StoreResult};
use crate::billing::charges::ChargeStatus;
use crate::billing::models::{
    BillingClient, CleanupQueueItem, NewScheduledCharge, NewUsageRecord, Profile, ScheduledCharge,
    Tool, UsageRecord, Workspace, WorkspaceMember, WorkspaceTool, WorkspaceToolPatch,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    profiles: Arc<RwLock<HashMap<Uuid, Profile>>>,
    workspaces: Arc<RwLock<HashMap<Uuid, Workspace>>>,
    members: Arc<RwLock<Vec<WorkspaceMember>>>,
    billing_clients: Arc<RwLock<HashMap<Uuid, BillingClient>>>,
    tools: Arc<RwLock<HashMap<Uuid, Tool>>>,
    workspace_tools: Arc<RwLock<HashMap<(Uuid, Uuid), WorkspaceTool>>>,
    usage: Arc<RwLock<Vec<UsageRecord>>>,
    charges: Arc<RwLock<HashMap<Uuid, ScheduledCharge>>>,
    cleanup_queue: Arc<RwLock<Vec<CleanupQueueItem>>>,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every trait call, for exercising store timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    pub async fn insert_profile(&self, profile: Profile) {
        self.profiles.write().await.insert(profile.id, profile);
    }

    pub async fn insert_workspace(&self, workspace: Workspace) {
        self.workspaces.write().await.insert(workspace.id, workspace);
    }

    /// Replaces any existing membership for the same `(workspace, user)` pair.
    pub async fn insert_member(&self, member: WorkspaceMember) {
        let mut members = self.members.write().await;
        members.retain(|existing| {
            !(existing.workspace_id == member.workspace_id && existing.user_id == member.user_id)
        });
        members.push(member);
    }

    pub async fn insert_billing_client(&self, client: BillingClient) {
        self.billing_clients.write().await.insert(client.id, client);
    }

    pub async fn insert_tool(&self, tool: Tool) {
        self.tools.write().await.insert(tool.id, tool);
    }

    pub async fn insert_workspace_tool(&self, workspace_tool: WorkspaceTool) {
        self.workspace_tools.write().await.insert(
            (workspace_tool.workspace_id, workspace_tool.tool_id),
            workspace_tool,
        );
    }

    pub async fn cleanup_queue_len(&self) -> usize {
        self.cleanup_queue.read().await.len()
    }

    pub async fn usage_len(&self) -> usize {
        self.usage.read().await.len()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn profile(&self, user_id: Uuid) -> StoreResult<Option<Profile>> {
        self.simulate_latency().await;
        Ok(self.profiles.read().await.get(&user_id).cloned())
    }

    async fn memberships(&self, user_id: Uuid) -> StoreResult<Vec<(WorkspaceMember, Workspace)>> {
        self.simulate_latency().await;
        let members = self.members.read().await;
        let workspaces = self.workspaces.read().await;
        let mut joined: Vec<(WorkspaceMember, Workspace)> = members
            .iter()
            .filter(|member| member.user_id == user_id)
            .filter_map(|member| {
                workspaces
                    .get(&member.workspace_id)
                    .map(|workspace| (member.clone(), workspace.clone()))
            })
            .collect();
        joined.sort_by(|(a, _), (b, _)| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(joined)
    }

    async fn workspace(&self, workspace_id: Uuid) -> StoreResult<Option<Workspace>> {
        self.simulate_latency().await;
        Ok(self.workspaces.read().await.get(&workspace_id).cloned())
    }

    async fn billing_client_for_user(&self, user_id: Uuid) -> StoreResult<Option<BillingClient>> {
        self.simulate_latency().await;
        let clients = self.billing_clients.read().await;
        let mut linked: Vec<&BillingClient> = clients
            .values()
            .filter(|client| client.user_id == Some(user_id))
            .collect();
        linked.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(linked.first().map(|client| (*client).clone()))
    }

    async fn tool(&self, tool_id: Uuid) -> StoreResult<Option<Tool>> {
        self.simulate_latency().await;
        Ok(self.tools.read().await.get(&tool_id).cloned())
    }

    async fn tool_by_slug(&self, slug: &str) -> StoreResult<Option<Tool>> {
        self.simulate_latency().await;
        Ok(self
            .tools
            .read()
            .await
            .values()
            .find(|tool| tool.slug == slug)
            .cloned())
    }

    async fn enabled_tools(&self) -> StoreResult<Vec<Tool>> {
        self.simulate_latency().await;
        let mut tools: Vec<Tool> = self
            .tools
            .read()
            .await
            .values()
            .filter(|tool| tool.is_enabled)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(tools)
    }

    async fn workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
    ) -> StoreResult<Option<WorkspaceTool>> {
        self.simulate_latency().await;
        Ok(self
            .workspace_tools
            .read()
            .await
            .get(&(workspace_id, tool_id))
            .cloned())
    }

    async fn workspace_tools(&self, workspace_id: Uuid) -> StoreResult<Vec<WorkspaceTool>> {
        self.simulate_latency().await;
        let mut rows: Vec<WorkspaceTool> = self
            .workspace_tools
            .read()
            .await
            .values()
            .filter(|row| row.workspace_id == workspace_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.tool_id);
        Ok(rows)
    }

    async fn toggle_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        is_enabled: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<WorkspaceTool> {
        self.simulate_latency().await;
        let mut rows = self.workspace_tools.write().await;
        let row = rows
            .entry((workspace_id, tool_id))
            .or_insert_with(|| WorkspaceTool {
                workspace_id,
                tool_id,
                is_enabled,
                pricing_override: None,
                enabled_at: None,
                disabled_at: None,
            });
        apply_toggle(row, is_enabled, at);
        Ok(row.clone())
    }

    async fn update_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        patch: WorkspaceToolPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<WorkspaceTool>> {
        self.simulate_latency().await;
        let mut rows = self.workspace_tools.write().await;
        let Some(row) = rows.get_mut(&(workspace_id, tool_id)) else {
            return Ok(None);
        };
        if let Some(is_enabled) = patch.is_enabled {
            apply_toggle(row, is_enabled, at);
        }
        if let Some(pricing_override) = patch.pricing_override {
            row.pricing_override = pricing_override;
        }
        Ok(Some(row.clone()))
    }

    async fn insert_usage_record(&self, record: NewUsageRecord) -> StoreResult<UsageRecord> {
        self.simulate_latency().await;
        let stored = UsageRecord {
            id: Uuid::new_v4(),
            workspace_id: record.workspace_id,
            user_id: record.user_id,
            tool_id: record.tool_id,
            event_type: record.event_type,
            quantity: record.quantity,
            unit: record.unit,
            occurred_at: record.occurred_at,
        };
        self.usage.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn usage_records(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        workspace_id: Option<Uuid>,
    ) -> StoreResult<Vec<UsageRecord>> {
        self.simulate_latency().await;
        let mut records: Vec<UsageRecord> = self
            .usage
            .read()
            .await
            .iter()
            .filter(|record| record.occurred_at >= start && record.occurred_at < end)
            .filter(|record| workspace_id.map_or(true, |scope| record.workspace_id == Some(scope)))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn charge(&self, charge_id: Uuid) -> StoreResult<Option<ScheduledCharge>> {
        self.simulate_latency().await;
        Ok(self.charges.read().await.get(&charge_id).cloned())
    }

    async fn charges_for_client(
        &self,
        billing_client_id: Uuid,
    ) -> StoreResult<Vec<ScheduledCharge>> {
        self.simulate_latency().await;
        let mut charges: Vec<ScheduledCharge> = self
            .charges
            .read()
            .await
            .values()
            .filter(|charge| charge.billing_client_id == billing_client_id)
            .cloned()
            .collect();
        charges.sort_by(|a, b| {
            a.scheduled_date
                .cmp(&b.scheduled_date)
                .then(a.id.cmp(&b.id))
        });
        Ok(charges)
    }

    async fn insert_charge(&self, charge: NewScheduledCharge) -> StoreResult<ScheduledCharge> {
        self.simulate_latency().await;
        let now = Utc::now();
        let stored = ScheduledCharge {
            id: Uuid::new_v4(),
            billing_client_id: charge.billing_client_id,
            amount_cents: charge.amount_cents,
            currency: charge.currency,
            description: charge.description,
            scheduled_date: charge.scheduled_date,
            status: ChargeStatus::Pending,
            failure_reason: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.charges.write().await.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn transition_charge(
        &self,
        transition: ChargeTransition,
    ) -> StoreResult<Option<ScheduledCharge>> {
        self.simulate_latency().await;
        let mut charges = self.charges.write().await;
        let Some(charge) = charges.get_mut(&transition.charge_id) else {
            return Ok(None);
        };
        if charge.status != transition.from {
            return Ok(None);
        }
        charge.status = transition.to;
        charge.updated_at = transition.at;
        if transition.failure_reason.is_some() {
            charge.failure_reason = transition.failure_reason;
        }
        if transition.to.stamps_processed_at() {
            charge.processed_at = Some(transition.at);
        }
        Ok(Some(charge.clone()))
    }

    async fn enqueue_cleanup(
        &self,
        external_resource_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<CleanupQueueItem> {
        self.simulate_latency().await;
        let item = CleanupQueueItem {
            id: Uuid::new_v4(),
            external_resource_id: external_resource_id.to_string(),
            created_at: at,
        };
        self.cleanup_queue.write().await.push(item.clone());
        Ok(item)
    }

    async fn claim_cleanup_items(&self, limit: usize) -> StoreResult<Vec<CleanupQueueItem>> {
        self.simulate_latency().await;
        let mut queue = self.cleanup_queue.write().await;
        queue.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let claimed = queue.len().min(limit);
        Ok(queue.drain(..claimed).collect())
    }
}

fn apply_toggle(row: &mut WorkspaceTool, is_enabled: bool, at: DateTime<Utc>) {
    row.is_enabled = is_enabled;
    if is_enabled {
        row.enabled_at = Some(at);
        row.disabled_at = None;
    } else {
        row.enabled_at = None;
        row.disabled_at = Some(at);
    }
}
