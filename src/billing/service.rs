use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use uuid::Uuid;

use super::access::{check_access, AccessDecision};
use super::charges::{ChargeStatus, GatewayOutcome};
use super::context::{select_membership, BillingContext};
use super::models::{
    MemberRole, NewScheduledCharge, NewUsageRecord, Profile, ScheduledCharge, SubscriptionStatus,
    Tool, UsageRecord, Workspace, WorkspaceTool, WorkspaceToolPatch,
};
use super::pricing::{resolve_pricing, ResolvedPricing};
use super::usage::{group_records, BillingPeriod, UsageAggregate, UsageGroup, UsageSummary};
use crate::error::{AppError, AppResult};
use crate::store::{timed, BillingStore, ChargeTransition, StoreResult};

const DEFAULT_UNIT: &str = "unit";
const DEFAULT_EVENT_TYPE: &str = "usage";
const DEFAULT_CURRENCY: &str = "usd";

/// Usage event submitted by a workspace member.
#[derive(Debug, Clone)]
pub struct RecordUsage {
    pub workspace_id: Uuid,
    pub tool_slug: String,
    pub quantity: f64,
    pub event_type: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateCharge {
    pub amount_cents: i64,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub scheduled_date: DateTime<Utc>,
}

/// key: billing-service -> entitlement engine
///
/// Stateless per call. Every store round-trip is bounded by `store_timeout`, and nothing read
/// here is cached between calls.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn BillingStore>,
    store_timeout: Duration,
    enrichment_concurrency: usize,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        store_timeout: Duration,
        enrichment_concurrency: usize,
    ) -> Self {
        Self {
            store,
            store_timeout,
            enrichment_concurrency: enrichment_concurrency.max(1),
        }
    }

    async fn call<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        timed(self.store_timeout, operation).await
    }

    pub async fn profile(&self, user_id: Uuid) -> AppResult<Profile> {
        self.call(self.store.profile(user_id))
            .await?
            .ok_or_else(|| AppError::not_found("profile"))
    }

    /// Admin role is read from the stored profile, never trusted from the token.
    pub async fn require_admin(&self, user_id: Uuid) -> AppResult<Profile> {
        let profile = self
            .call(self.store.profile(user_id))
            .await?
            .ok_or(AppError::Forbidden)?;
        if !profile.is_admin() {
            return Err(AppError::Forbidden);
        }
        Ok(profile)
    }

    pub async fn workspace(&self, workspace_id: Uuid) -> AppResult<Workspace> {
        self.call(self.store.workspace(workspace_id))
            .await?
            .ok_or_else(|| AppError::not_found("workspace"))
    }

    async fn tool(&self, tool_id: Uuid) -> AppResult<Tool> {
        self.call(self.store.tool(tool_id))
            .await?
            .ok_or_else(|| AppError::not_found("tool"))
    }

    async fn tool_by_slug(&self, slug: &str) -> AppResult<Tool> {
        self.call(self.store.tool_by_slug(slug))
            .await?
            .ok_or_else(|| AppError::not_found("tool"))
    }

    /// Resolves the billing entity for a user.
    ///
    /// Runs membership lookup first and only then the legacy per-user client lookup, since the
    /// fallback depends on what the first step found.
    pub async fn billing_context(&self, user_id: Uuid) -> AppResult<Option<BillingContext>> {
        let memberships = self.call(self.store.memberships(user_id)).await?;

        if let Some((member, workspace)) = select_membership(&memberships) {
            let billing_client_id = match workspace.billing_client_id {
                Some(id) => Some(id),
                None => self
                    .call(self.store.billing_client_for_user(user_id))
                    .await?
                    .map(|client| client.id),
            };
            return Ok(Some(BillingContext::mediated(
                member,
                workspace,
                billing_client_id,
            )));
        }

        let direct = self
            .call(self.store.billing_client_for_user(user_id))
            .await?
            .map(|client| BillingContext::Direct {
                billing_client_id: client.id,
            });
        Ok(direct)
    }

    /// Evaluates access for `user_id` against the tool named by `slug`.
    ///
    /// Store failures propagate; they are never turned into a denial.
    pub async fn tool_access(
        &self,
        user_id: Uuid,
        slug: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ToolAccess> {
        let tool = self.tool_by_slug(slug).await?;
        let profile = self.profile(user_id).await?;
        let context = self.billing_context(user_id).await?;

        let managed_workspace = context
            .as_ref()
            .filter(|context| context.is_managed())
            .and_then(BillingContext::workspace_id);
        let workspace_tool = match managed_workspace {
            Some(workspace_id) => {
                self.call(self.store.workspace_tool(workspace_id, tool.id))
                    .await?
            }
            None => None,
        };

        let decision = check_access(
            &tool,
            &profile,
            context.as_ref(),
            workspace_tool.as_ref(),
            now,
        );
        tracing::debug!(
            %user_id,
            tool = %tool.slug,
            allowed = decision.allowed,
            reason = ?decision.reason,
            "evaluated tool access"
        );

        Ok(ToolAccess {
            tool_id: tool.id,
            tool_slug: tool.slug,
            decision,
            trial_days_remaining: (profile.subscription_status == SubscriptionStatus::Trialing)
                .then(|| profile.trial_days_remaining(now).max(0)),
        })
    }

    /// Tools the caller can see, each with its effective price and access decision.
    ///
    /// Inside a workspace the catalog is the workspace's enabled tool rows. Without one it is
    /// every enabled tool whose tier list includes the caller's subscription status.
    pub async fn tool_catalog(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<CatalogEntry>> {
        let profile = self.profile(user_id).await?;
        let context = self.billing_context(user_id).await?;
        let tools = self.call(self.store.enabled_tools()).await?;

        let workspace_rows: Option<HashMap<Uuid, WorkspaceTool>> =
            match context.as_ref().and_then(BillingContext::workspace_id) {
                Some(workspace_id) => Some(
                    self.call(self.store.workspace_tools(workspace_id))
                        .await?
                        .into_iter()
                        .filter(|row| row.is_enabled)
                        .map(|row| (row.tool_id, row))
                        .collect(),
                ),
                None => None,
            };

        let entries = tools
            .into_iter()
            .filter_map(|tool| {
                let workspace_tool = match &workspace_rows {
                    Some(rows) => Some(rows.get(&tool.id)?.clone()),
                    None if tool.tier_access.contains(&profile.subscription_status) => None,
                    None => return None,
                };
                let pricing = resolve_pricing(&tool, workspace_tool.as_ref());
                let access = check_access(
                    &tool,
                    &profile,
                    context.as_ref(),
                    workspace_tool.as_ref(),
                    now,
                );
                Some(CatalogEntry {
                    tool,
                    pricing,
                    access,
                })
            })
            .collect::<Vec<_>>();
        tracing::debug!(%user_id, tools = entries.len(), "built tool catalog");
        Ok(entries)
    }

    pub async fn record_usage(&self, user_id: Uuid, usage: RecordUsage) -> AppResult<UsageRecord> {
        if !usage.quantity.is_finite() || usage.quantity <= 0.0 {
            return Err(AppError::InvalidInput("quantity must be positive".into()));
        }
        let tool = self.tool_by_slug(&usage.tool_slug).await?;
        if !tool.is_enabled {
            return Err(AppError::InvalidInput(format!(
                "tool {} is disabled",
                tool.slug
            )));
        }

        let memberships = self.call(self.store.memberships(user_id)).await?;
        if !memberships
            .iter()
            .any(|(member, _)| member.workspace_id == usage.workspace_id)
        {
            return Err(AppError::Forbidden);
        }

        let workspace_tool = self
            .call(self.store.workspace_tool(usage.workspace_id, tool.id))
            .await?
            .filter(|row| row.is_enabled)
            .ok_or(AppError::Forbidden)?;

        let pricing = resolve_pricing(&tool, Some(&workspace_tool));
        let record = NewUsageRecord {
            workspace_id: Some(usage.workspace_id),
            user_id: Some(user_id),
            tool_id: tool.id,
            event_type: usage
                .event_type
                .filter(|event_type| !event_type.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            quantity: usage.quantity,
            unit: pricing.unit.unwrap_or_else(|| DEFAULT_UNIT.to_string()),
            occurred_at: usage.occurred_at,
        };
        let stored = self.call(self.store.insert_usage_record(record)).await?;
        tracing::info!(
            record_id = %stored.id,
            workspace_id = %usage.workspace_id,
            tool = %tool.slug,
            quantity = stored.quantity,
            "usage recorded"
        );
        Ok(stored)
    }

    /// Workspace owners may read their own workspace's aggregates.
    pub async fn require_owner(&self, user_id: Uuid, workspace_id: Uuid) -> AppResult<()> {
        let memberships = self.call(self.store.memberships(user_id)).await?;
        let is_owner = memberships.iter().any(|(member, _)| {
            member.workspace_id == workspace_id && member.role == MemberRole::Owner
        });
        if is_owner {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    /// Pure projection of usage records onto billable line items. Never writes.
    pub async fn aggregate_usage(
        &self,
        period: BillingPeriod,
        scope_workspace_id: Option<Uuid>,
    ) -> AppResult<UsageSummary> {
        let (start, end) = period.bounds();
        let records = self
            .call(self.store.usage_records(start, end, scope_workspace_id))
            .await?;
        let groups = group_records(&records, &period, scope_workspace_id);

        let aggregates: Vec<UsageAggregate> = stream::iter(groups)
            .map(|group| self.price_group(group))
            .buffered(self.enrichment_concurrency)
            .try_collect()
            .await?;

        Ok(UsageSummary::new(period, scope_workspace_id, aggregates))
    }

    async fn price_group(&self, group: UsageGroup) -> AppResult<UsageAggregate> {
        let tool = self.call(self.store.tool(group.tool_id)).await?;
        let (workspace_name, workspace_tool) = match group.workspace_id {
            Some(workspace_id) => {
                let workspace = self.call(self.store.workspace(workspace_id)).await?;
                let workspace_tool = self
                    .call(self.store.workspace_tool(workspace_id, group.tool_id))
                    .await?;
                (workspace.map(|workspace| workspace.name), workspace_tool)
            }
            None => (None, None),
        };
        let pricing = tool
            .as_ref()
            .map(|tool| resolve_pricing(tool, workspace_tool.as_ref()));
        Ok(UsageAggregate::priced(
            group,
            tool.as_ref(),
            pricing,
            workspace_name,
        ))
    }

    pub async fn workspace_tools(&self, workspace_id: Uuid) -> AppResult<Vec<WorkspaceTool>> {
        self.workspace(workspace_id).await?;
        Ok(self.call(self.store.workspace_tools(workspace_id)).await?)
    }

    pub async fn toggle_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        is_enabled: bool,
        now: DateTime<Utc>,
    ) -> AppResult<WorkspaceTool> {
        self.workspace(workspace_id).await?;
        self.tool(tool_id).await?;
        let row = self
            .call(
                self.store
                    .toggle_workspace_tool(workspace_id, tool_id, is_enabled, now),
            )
            .await?;
        tracing::info!(%workspace_id, %tool_id, is_enabled, "workspace tool toggled");
        Ok(row)
    }

    pub async fn update_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        patch: WorkspaceToolPatch,
        now: DateTime<Utc>,
    ) -> AppResult<WorkspaceTool> {
        if patch.is_empty() {
            return Err(AppError::InvalidInput("no fields to update".into()));
        }
        if let Some(Some(pricing_override)) = &patch.pricing_override {
            validate_override(pricing_override)?;
        }
        self.call(
            self.store
                .update_workspace_tool(workspace_id, tool_id, patch, now),
        )
        .await?
        .ok_or_else(|| AppError::not_found("workspace tool"))
    }

    pub async fn workspace_tool_pricing(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
    ) -> AppResult<ResolvedPricing> {
        self.workspace(workspace_id).await?;
        let tool = self.tool(tool_id).await?;
        let workspace_tool = self
            .call(self.store.workspace_tool(workspace_id, tool_id))
            .await?;
        Ok(resolve_pricing(&tool, workspace_tool.as_ref()))
    }

    async fn workspace_billing_client(&self, workspace_id: Uuid) -> AppResult<Uuid> {
        self.workspace(workspace_id)
            .await?
            .billing_client_id
            .ok_or_else(|| AppError::not_found("billing client"))
    }

    pub async fn workspace_charges(&self, workspace_id: Uuid) -> AppResult<Vec<ScheduledCharge>> {
        let billing_client_id = self.workspace_billing_client(workspace_id).await?;
        Ok(self
            .call(self.store.charges_for_client(billing_client_id))
            .await?)
    }

    pub async fn create_charge(
        &self,
        workspace_id: Uuid,
        request: CreateCharge,
    ) -> AppResult<ScheduledCharge> {
        if request.amount_cents <= 0 {
            return Err(AppError::InvalidInput("amount_cents must be positive".into()));
        }
        let billing_client_id = self.workspace_billing_client(workspace_id).await?;
        let currency = request
            .currency
            .map(|currency| currency.trim().to_ascii_lowercase())
            .filter(|currency| !currency.is_empty())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
        let charge = self
            .call(self.store.insert_charge(NewScheduledCharge {
                billing_client_id,
                amount_cents: request.amount_cents,
                currency,
                description: request.description,
                scheduled_date: request.scheduled_date,
            }))
            .await?;
        tracing::info!(charge_id = %charge.id, %billing_client_id, "scheduled charge created");
        Ok(charge)
    }

    /// Cancels a pending charge. With `workspace_id` the charge must belong to that workspace's
    /// billing client; a foreign charge is reported as missing.
    pub async fn cancel_charge(
        &self,
        charge_id: Uuid,
        workspace_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> AppResult<ScheduledCharge> {
        let charge = self.charge(charge_id).await?;
        if let Some(workspace_id) = workspace_id {
            let billing_client_id = self.workspace_billing_client(workspace_id).await?;
            if charge.billing_client_id != billing_client_id {
                return Err(AppError::not_found("charge"));
            }
        }
        self.transition(charge, ChargeStatus::Pending, ChargeStatus::Canceled, None, now)
            .await
    }

    /// Applies an asynchronous payment gateway outcome.
    pub async fn apply_gateway_outcome(
        &self,
        charge_id: Uuid,
        outcome: GatewayOutcome,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<ScheduledCharge> {
        let charge = self.charge(charge_id).await?;
        let failure_reason = failure_reason.filter(|_| outcome == GatewayOutcome::Failed);
        self.transition(
            charge,
            outcome.expected_prior(),
            outcome.target(),
            failure_reason,
            now,
        )
        .await
    }

    async fn charge(&self, charge_id: Uuid) -> AppResult<ScheduledCharge> {
        self.call(self.store.charge(charge_id))
            .await?
            .ok_or_else(|| AppError::not_found("charge"))
    }

    /// Moves `charge` from `expected` to `to` with a conditional update. A concurrent writer
    /// that got there first surfaces as `InvalidTransition` from the status it left behind.
    async fn transition(
        &self,
        charge: ScheduledCharge,
        expected: ChargeStatus,
        to: ChargeStatus,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<ScheduledCharge> {
        if charge.status != expected || !charge.status.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                from: charge.status,
                to,
            });
        }

        let applied = self
            .call(self.store.transition_charge(ChargeTransition {
                charge_id: charge.id,
                from: expected,
                to,
                failure_reason,
                at: now,
            }))
            .await?;

        match applied {
            Some(updated) => {
                tracing::info!(charge_id = %updated.id, from = %expected, %to, "charge transitioned");
                Ok(updated)
            }
            None => {
                let current = self.charge(charge.id).await?;
                tracing::warn!(charge_id = %charge.id, current = %current.status, %to, "lost charge transition race");
                Err(AppError::InvalidTransition {
                    from: current.status,
                    to,
                })
            }
        }
    }
}

/// Access decision plus the identifiers the caller asked about.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolAccess {
    pub tool_id: Uuid,
    pub tool_slug: String,
    #[serde(flatten)]
    pub decision: AccessDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_days_remaining: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub tool: Tool,
    pub pricing: ResolvedPricing,
    pub access: AccessDecision,
}

fn validate_override(value: &Value) -> AppResult<()> {
    let fields = value
        .as_object()
        .ok_or_else(|| AppError::InvalidInput("pricing_override must be an object".into()))?;
    if let Some(rate) = fields.get("rate") {
        if !rate.is_null() && rate.as_f64().map_or(true, |rate| rate < 0.0) {
            return Err(AppError::InvalidInput(
                "pricing_override.rate must be a non-negative number".into(),
            ));
        }
    }
    Ok(())
}
