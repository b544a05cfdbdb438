use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{BillingStore, ChargeTransition, StoreError, StoreResult};
use crate::billing::charges::ChargeStatus;
use crate::billing::models::{
    BillingClient, BillingConfig, CleanupQueueItem, MemberRole, NewScheduledCharge,
    NewUsageRecord, Profile, ScheduledCharge, SubscriptionStatus, Tool, ToolType, UsageRecord,
    UserRole, Workspace, WorkspaceMember, WorkspaceStatus, WorkspaceTool, WorkspaceToolPatch,
    WorkspaceType,
};

/// key: billing-store-postgres -> sqlx implementation
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const WORKSPACE_TOOL_COLUMNS: &str =
    "workspace_id, tool_id, is_enabled, pricing_override, enabled_at, disabled_at";

const CHARGE_COLUMNS: &str = "id, billing_client_id, amount_cents, currency, description, \
     scheduled_date, status, failure_reason, processed_at, created_at, updated_at";

#[async_trait]
impl BillingStore for PgStore {
    async fn profile(&self, user_id: Uuid) -> StoreResult<Option<Profile>> {
        let row = sqlx::query(
            r#"
            SELECT id, role, subscription_status, trial_ends_at, billing_account_ref,
                   created_at, updated_at
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    async fn memberships(&self, user_id: Uuid) -> StoreResult<Vec<(WorkspaceMember, Workspace)>> {
        let rows = sqlx::query(
            r#"
            SELECT
                m.id,
                m.workspace_id,
                m.user_id,
                m.role,
                m.created_at,
                w.name,
                w.type,
                w.status,
                w.billing_client_id,
                w.payment_account_ref,
                w.created_at AS workspace_created_at
            FROM workspace_members m
            JOIN workspaces w ON w.id = m.workspace_id
            WHERE m.user_id = $1
            ORDER BY m.created_at ASC, m.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<(WorkspaceMember, Workspace)> {
                let member = WorkspaceMember {
                    id: row.try_get("id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    user_id: row.try_get("user_id")?,
                    role: parse_column(row, "role", MemberRole::parse)?,
                    created_at: row.try_get("created_at")?,
                };
                let workspace = Workspace {
                    id: member.workspace_id,
                    name: row.try_get("name")?,
                    workspace_type: parse_column(row, "type", WorkspaceType::parse)?,
                    status: parse_column(row, "status", WorkspaceStatus::parse)?,
                    billing_client_id: row.try_get("billing_client_id")?,
                    payment_account_ref: row.try_get("payment_account_ref")?,
                    created_at: row.try_get("workspace_created_at")?,
                };
                Ok((member, workspace))
            })
            .collect()
    }

    async fn workspace(&self, workspace_id: Uuid) -> StoreResult<Option<Workspace>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, type, status, billing_client_id, payment_account_ref, created_at
            FROM workspaces
            WHERE id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(workspace_from_row).transpose()
    }

    async fn billing_client_for_user(&self, user_id: Uuid) -> StoreResult<Option<BillingClient>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, status, user_id, created_at
            FROM billing_clients
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(billing_client_from_row).transpose()
    }

    async fn tool(&self, tool_id: Uuid) -> StoreResult<Option<Tool>> {
        let row = sqlx::query(
            r#"
            SELECT id, slug, name, tool_type, billing_config, is_enabled, tier_access,
                   requires_workspace
            FROM tools
            WHERE id = $1
            "#,
        )
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tool_from_row).transpose()
    }

    async fn tool_by_slug(&self, slug: &str) -> StoreResult<Option<Tool>> {
        let row = sqlx::query(
            r#"
            SELECT id, slug, name, tool_type, billing_config, is_enabled, tier_access,
                   requires_workspace
            FROM tools
            WHERE slug = $1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tool_from_row).transpose()
    }

    async fn enabled_tools(&self) -> StoreResult<Vec<Tool>> {
        let rows = sqlx::query(
            r#"
            SELECT id, slug, name, tool_type, billing_config, is_enabled, tier_access,
                   requires_workspace
            FROM tools
            WHERE is_enabled
            ORDER BY slug ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tool_from_row).collect()
    }

    async fn workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
    ) -> StoreResult<Option<WorkspaceTool>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_TOOL_COLUMNS} FROM workspace_tools WHERE workspace_id = $1 AND tool_id = $2"
        ))
        .bind(workspace_id)
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(workspace_tool_from_row).transpose()
    }

    async fn workspace_tools(&self, workspace_id: Uuid) -> StoreResult<Vec<WorkspaceTool>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKSPACE_TOOL_COLUMNS} FROM workspace_tools WHERE workspace_id = $1 ORDER BY tool_id ASC"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(workspace_tool_from_row).collect()
    }

    async fn toggle_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        is_enabled: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<WorkspaceTool> {
        let (enabled_at, disabled_at) = toggle_stamps(is_enabled, at);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workspace_tools (workspace_id, tool_id, is_enabled, enabled_at, disabled_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workspace_id, tool_id)
            DO UPDATE SET
                is_enabled = EXCLUDED.is_enabled,
                enabled_at = EXCLUDED.enabled_at,
                disabled_at = EXCLUDED.disabled_at
            RETURNING {WORKSPACE_TOOL_COLUMNS}
            "#
        ))
        .bind(workspace_id)
        .bind(tool_id)
        .bind(is_enabled)
        .bind(enabled_at)
        .bind(disabled_at)
        .fetch_one(&self.pool)
        .await?;

        workspace_tool_from_row(&row)
    }

    async fn update_workspace_tool(
        &self,
        workspace_id: Uuid,
        tool_id: Uuid,
        patch: WorkspaceToolPatch,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<WorkspaceTool>> {
        if patch.is_empty() {
            return self.workspace_tool(workspace_id, tool_id).await;
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE workspace_tools SET ");
        let mut first = true;
        if let Some(is_enabled) = patch.is_enabled {
            let (enabled_at, disabled_at) = toggle_stamps(is_enabled, at);
            builder.push("is_enabled = ");
            builder.push_bind(is_enabled);
            builder.push(", enabled_at = ");
            builder.push_bind(enabled_at);
            builder.push(", disabled_at = ");
            builder.push_bind(disabled_at);
            first = false;
        }
        if let Some(pricing_override) = patch.pricing_override {
            if !first {
                builder.push(", ");
            }
            builder.push("pricing_override = ");
            builder.push_bind(pricing_override);
        }
        builder.push(" WHERE workspace_id = ");
        builder.push_bind(workspace_id);
        builder.push(" AND tool_id = ");
        builder.push_bind(tool_id);
        builder.push(" RETURNING ");
        builder.push(WORKSPACE_TOOL_COLUMNS);

        let row = builder.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(workspace_tool_from_row).transpose()
    }

    async fn insert_usage_record(&self, record: NewUsageRecord) -> StoreResult<UsageRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO usage_records (
                id, workspace_id, user_id, tool_id, event_type, quantity, unit, occurred_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, workspace_id, user_id, tool_id, event_type, quantity, unit, occurred_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.workspace_id)
        .bind(record.user_id)
        .bind(record.tool_id)
        .bind(&record.event_type)
        .bind(record.quantity)
        .bind(&record.unit)
        .bind(record.occurred_at)
        .fetch_one(&self.pool)
        .await?;

        usage_from_row(&row)
    }

    async fn usage_records(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        workspace_id: Option<Uuid>,
    ) -> StoreResult<Vec<UsageRecord>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, workspace_id, user_id, tool_id, event_type, quantity, unit, occurred_at \
             FROM usage_records WHERE occurred_at >= ",
        );
        builder.push_bind(start);
        builder.push(" AND occurred_at < ");
        builder.push_bind(end);
        if let Some(scope) = workspace_id {
            builder.push(" AND workspace_id = ");
            builder.push_bind(scope);
        }
        builder.push(" ORDER BY occurred_at ASC, id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn charge(&self, charge_id: Uuid) -> StoreResult<Option<ScheduledCharge>> {
        let row = sqlx::query(&format!(
            "SELECT {CHARGE_COLUMNS} FROM scheduled_charges WHERE id = $1"
        ))
        .bind(charge_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(charge_from_row).transpose()
    }

    async fn charges_for_client(
        &self,
        billing_client_id: Uuid,
    ) -> StoreResult<Vec<ScheduledCharge>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHARGE_COLUMNS} FROM scheduled_charges WHERE billing_client_id = $1 \
             ORDER BY scheduled_date ASC, id ASC"
        ))
        .bind(billing_client_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(charge_from_row).collect()
    }

    async fn insert_charge(&self, charge: NewScheduledCharge) -> StoreResult<ScheduledCharge> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO scheduled_charges (
                id, billing_client_id, amount_cents, currency, description, scheduled_date, status
            ) VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING {CHARGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(charge.billing_client_id)
        .bind(charge.amount_cents)
        .bind(&charge.currency)
        .bind(&charge.description)
        .bind(charge.scheduled_date)
        .fetch_one(&self.pool)
        .await?;

        charge_from_row(&row)
    }

    async fn transition_charge(
        &self,
        transition: ChargeTransition,
    ) -> StoreResult<Option<ScheduledCharge>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE scheduled_charges
            SET
                status = $3,
                failure_reason = COALESCE($4, failure_reason),
                processed_at = CASE WHEN $5 THEN $6 ELSE processed_at END,
                updated_at = $6
            WHERE id = $1
              AND status = $2
            RETURNING {CHARGE_COLUMNS}
            "#
        ))
        .bind(transition.charge_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(&transition.failure_reason)
        .bind(transition.to.stamps_processed_at())
        .bind(transition.at)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(charge_from_row).transpose()
    }

    async fn enqueue_cleanup(
        &self,
        external_resource_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<CleanupQueueItem> {
        let row = sqlx::query(
            r#"
            INSERT INTO cleanup_queue (id, external_resource_id, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, external_resource_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_resource_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        cleanup_item_from_row(&row)
    }

    async fn claim_cleanup_items(&self, limit: usize) -> StoreResult<Vec<CleanupQueueItem>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            DELETE FROM cleanup_queue
            WHERE id IN (
                SELECT id
                FROM cleanup_queue
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, external_resource_id, created_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING carries no order
        let mut items = rows
            .iter()
            .map(cleanup_item_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }
}

fn toggle_stamps(
    is_enabled: bool,
    at: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    if is_enabled {
        (Some(at), None)
    } else {
        (None, Some(at))
    }
}

fn parse_column<T>(row: &PgRow, column: &str, parse: fn(&str) -> Option<T>) -> StoreResult<T> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| StoreError::Decode(format!("unexpected {column} value `{raw}`")))
}

fn profile_from_row(row: &PgRow) -> StoreResult<Profile> {
    Ok(Profile {
        id: row.try_get("id")?,
        role: parse_column(row, "role", UserRole::parse)?,
        subscription_status: parse_column(row, "subscription_status", SubscriptionStatus::parse)?,
        trial_ends_at: row.try_get("trial_ends_at")?,
        billing_account_ref: row.try_get("billing_account_ref")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn workspace_from_row(row: &PgRow) -> StoreResult<Workspace> {
    Ok(Workspace {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        workspace_type: parse_column(row, "type", WorkspaceType::parse)?,
        status: parse_column(row, "status", WorkspaceStatus::parse)?,
        billing_client_id: row.try_get("billing_client_id")?,
        payment_account_ref: row.try_get("payment_account_ref")?,
        created_at: row.try_get("created_at")?,
    })
}

fn billing_client_from_row(row: &PgRow) -> StoreResult<BillingClient> {
    Ok(BillingClient {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn tool_from_row(row: &PgRow) -> StoreResult<Tool> {
    let config: Value = row.try_get("billing_config")?;
    let billing_config: BillingConfig = serde_json::from_value(config)
        .map_err(|err| StoreError::Decode(format!("billing_config: {err}")))?;
    let tiers: Vec<String> = row.try_get("tier_access")?;
    let tier_access = tiers
        .iter()
        .map(|tier| {
            SubscriptionStatus::parse(tier)
                .ok_or_else(|| StoreError::Decode(format!("unexpected tier_access value `{tier}`")))
        })
        .collect::<StoreResult<Vec<_>>>()?;

    Ok(Tool {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        tool_type: parse_column(row, "tool_type", ToolType::parse)?,
        billing_config,
        is_enabled: row.try_get("is_enabled")?,
        tier_access,
        requires_workspace: row.try_get("requires_workspace")?,
    })
}

fn workspace_tool_from_row(row: &PgRow) -> StoreResult<WorkspaceTool> {
    Ok(WorkspaceTool {
        workspace_id: row.try_get("workspace_id")?,
        tool_id: row.try_get("tool_id")?,
        is_enabled: row.try_get("is_enabled")?,
        pricing_override: row.try_get("pricing_override")?,
        enabled_at: row.try_get("enabled_at")?,
        disabled_at: row.try_get("disabled_at")?,
    })
}

fn usage_from_row(row: &PgRow) -> StoreResult<UsageRecord> {
    Ok(UsageRecord {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        user_id: row.try_get("user_id")?,
        tool_id: row.try_get("tool_id")?,
        event_type: row.try_get("event_type")?,
        quantity: row.try_get("quantity")?,
        unit: row.try_get("unit")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn charge_from_row(row: &PgRow) -> StoreResult<ScheduledCharge> {
    Ok(ScheduledCharge {
        id: row.try_get("id")?,
        billing_client_id: row.try_get("billing_client_id")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: row.try_get("currency")?,
        description: row.try_get("description")?,
        scheduled_date: row.try_get("scheduled_date")?,
        status: parse_column(row, "status", ChargeStatus::parse)?,
        failure_reason: row.try_get("failure_reason")?,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cleanup_item_from_row(row: &PgRow) -> StoreResult<CleanupQueueItem> {
    Ok(CleanupQueueItem {
        id: row.try_get("id")?,
        external_resource_id: row.try_get("external_resource_id")?,
        created_at: row.try_get("created_at")?,
    })
}
