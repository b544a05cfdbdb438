use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use uuid::Uuid;

use super::charges::GatewayOutcome;
use super::cleanup::{CleanupDrainer, DrainReport};
use super::context::BillingContext;
use super::models::{ScheduledCharge, UsageRecord, WorkspaceTool, WorkspaceToolPatch};
use super::pricing::ResolvedPricing;
use super::service::{BillingService, CatalogEntry, CreateCharge, RecordUsage, ToolAccess};
use super::usage::{BillingPeriod, UsageSummary};
use crate::error::{AppError, AppResult};
use crate::extractor::{AuthUser, CronCaller};

/// key: billing-api -> rest endpoints
pub async fn billing_context(
    user: AuthUser,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<Option<BillingContext>>> {
    Ok(Json(service.billing_context(user.user_id).await?))
}

pub async fn tool_catalog(
    user: AuthUser,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<Vec<CatalogEntry>>> {
    Ok(Json(service.tool_catalog(user.user_id, Utc::now()).await?))
}

pub async fn tool_access(
    user: AuthUser,
    Path(slug): Path<String>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<ToolAccess>> {
    let access = service.tool_access(user.user_id, &slug, Utc::now()).await?;
    Ok(Json(access))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<Uuid>,
}

fn billing_period(period: Option<&str>) -> AppResult<BillingPeriod> {
    match period.map(str::trim).filter(|key| !key.is_empty()) {
        Some(key) => BillingPeriod::parse(key)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid billing period {key}"))),
        None => BillingPeriod::containing(Utc::now())
            .ok_or_else(|| AppError::InvalidInput("billing period out of range".into())),
    }
}

/// Scoped summary for a workspace owner (or an admin).
pub async fn workspace_usage(
    user: AuthUser,
    Query(query): Query<UsageQuery>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<UsageSummary>> {
    let workspace_id = query
        .workspace_id
        .ok_or_else(|| AppError::InvalidInput("workspace_id is required".into()))?;
    let period = billing_period(query.period.as_deref())?;
    match service.require_owner(user.user_id, workspace_id).await {
        Ok(()) => {}
        Err(AppError::Forbidden) => {
            service.require_admin(user.user_id).await?;
        }
        Err(error) => return Err(error),
    }
    Ok(Json(service.aggregate_usage(period, Some(workspace_id)).await?))
}

pub async fn admin_usage(
    user: AuthUser,
    Query(query): Query<UsageQuery>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<UsageSummary>> {
    service.require_admin(user.user_id).await?;
    let period = billing_period(query.period.as_deref())?;
    Ok(Json(service.aggregate_usage(period, query.workspace_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    pub workspace_id: Uuid,
    pub tool_slug: String,
    pub quantity: f64,
    #[serde(default)]
    pub event_type: Option<String>,
}

pub async fn record_usage(
    user: AuthUser,
    Extension(service): Extension<BillingService>,
    Json(payload): Json<RecordUsageRequest>,
) -> AppResult<(StatusCode, Json<UsageRecord>)> {
    let record = service
        .record_usage(
            user.user_id,
            RecordUsage {
                workspace_id: payload.workspace_id,
                tool_slug: payload.tool_slug,
                quantity: payload.quantity,
                event_type: payload.event_type,
                occurred_at: Utc::now(),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_workspace_tools(
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<Vec<WorkspaceTool>>> {
    service.require_admin(user.user_id).await?;
    Ok(Json(service.workspace_tools(workspace_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ToggleToolRequest {
    pub tool_id: Uuid,
    pub is_enabled: bool,
}

pub async fn toggle_workspace_tool(
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    Extension(service): Extension<BillingService>,
    Json(payload): Json<ToggleToolRequest>,
) -> AppResult<Json<WorkspaceTool>> {
    service.require_admin(user.user_id).await?;
    let row = service
        .toggle_workspace_tool(workspace_id, payload.tool_id, payload.is_enabled, Utc::now())
        .await?;
    Ok(Json(row))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateToolRequest {
    #[serde(default)]
    pub is_enabled: Option<bool>,
    /// Absent leaves the override alone, `null` clears it.
    #[serde(default, deserialize_with = "present_or_null")]
    pub pricing_override: Option<Option<Value>>,
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Value>::deserialize(deserializer).map(Some)
}

pub async fn update_workspace_tool(
    user: AuthUser,
    Path((workspace_id, tool_id)): Path<(Uuid, Uuid)>,
    Extension(service): Extension<BillingService>,
    Json(payload): Json<UpdateToolRequest>,
) -> AppResult<Json<WorkspaceTool>> {
    service.require_admin(user.user_id).await?;
    let patch = WorkspaceToolPatch {
        is_enabled: payload.is_enabled,
        pricing_override: payload.pricing_override,
    };
    let row = service
        .update_workspace_tool(workspace_id, tool_id, patch, Utc::now())
        .await?;
    Ok(Json(row))
}

pub async fn workspace_tool_pricing(
    user: AuthUser,
    Path((workspace_id, tool_id)): Path<(Uuid, Uuid)>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<ResolvedPricing>> {
    service.require_admin(user.user_id).await?;
    Ok(Json(
        service.workspace_tool_pricing(workspace_id, tool_id).await?,
    ))
}

pub async fn list_charges(
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<Vec<ScheduledCharge>>> {
    service.require_admin(user.user_id).await?;
    Ok(Json(service.workspace_charges(workspace_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateChargeRequest {
    pub amount_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scheduled_date: Option<DateTime<Utc>>,
}

pub async fn create_charge(
    user: AuthUser,
    Path(workspace_id): Path<Uuid>,
    Extension(service): Extension<BillingService>,
    Json(payload): Json<CreateChargeRequest>,
) -> AppResult<(StatusCode, Json<ScheduledCharge>)> {
    service.require_admin(user.user_id).await?;
    let charge = service
        .create_charge(
            workspace_id,
            CreateCharge {
                amount_cents: payload.amount_cents,
                currency: payload.currency,
                description: payload.description,
                scheduled_date: payload.scheduled_date.unwrap_or_else(Utc::now),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(charge)))
}

pub async fn cancel_workspace_charge(
    user: AuthUser,
    Path((workspace_id, charge_id)): Path<(Uuid, Uuid)>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<ScheduledCharge>> {
    service.require_admin(user.user_id).await?;
    let charge = service
        .cancel_charge(charge_id, Some(workspace_id), Utc::now())
        .await?;
    Ok(Json(charge))
}

pub async fn cancel_charge(
    user: AuthUser,
    Path(charge_id): Path<Uuid>,
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<ScheduledCharge>> {
    service.require_admin(user.user_id).await?;
    Ok(Json(service.cancel_charge(charge_id, None, Utc::now()).await?))
}

#[derive(Debug, Deserialize)]
pub struct ChargeOutcomeRequest {
    pub outcome: GatewayOutcome,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

pub async fn charge_outcome(
    user: AuthUser,
    Path(charge_id): Path<Uuid>,
    Extension(service): Extension<BillingService>,
    Json(payload): Json<ChargeOutcomeRequest>,
) -> AppResult<Json<ScheduledCharge>> {
    service.require_admin(user.user_id).await?;
    let charge = service
        .apply_gateway_outcome(charge_id, payload.outcome, payload.failure_reason, Utc::now())
        .await?;
    Ok(Json(charge))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    #[serde(default)]
    pub batch_size: Option<usize>,
}

pub async fn cron_cleanup(
    _caller: CronCaller,
    Query(query): Query<CleanupQuery>,
    Extension(drainer): Extension<CleanupDrainer>,
) -> AppResult<Json<DrainReport>> {
    let batch_size = drainer.batch_size(query.batch_size);
    Ok(Json(drainer.drain(batch_size).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_payload_distinguishes_null_from_absent() {
        let absent: UpdateToolRequest = serde_json::from_value(json!({"is_enabled": true})).unwrap();
        assert_eq!(absent.pricing_override, None);

        let cleared: UpdateToolRequest =
            serde_json::from_value(json!({"pricing_override": null})).unwrap();
        assert_eq!(cleared.pricing_override, Some(None));

        let set: UpdateToolRequest =
            serde_json::from_value(json!({"pricing_override": {"type": "metered"}})).unwrap();
        assert_eq!(set.pricing_override, Some(Some(json!({"type": "metered"}))));
    }

    #[test]
    fn default_period_is_current_month() {
        let period = billing_period(None).unwrap();
        assert_eq!(Some(period), BillingPeriod::containing(Utc::now()));
        assert_eq!(billing_period(Some(" 2025-03 ")).unwrap().to_string(), "2025-03");
        assert!(matches!(
            billing_period(Some("2025-14")),
            Err(AppError::InvalidInput(_))
        ));
    }
}
