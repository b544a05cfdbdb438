use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// key: billing-models -> profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub role: UserRole,
    pub subscription_status: SubscriptionStatus,
    pub trial_ends_at: DateTime<Utc>,
    pub billing_account_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Whole days left on the trial, rounded up. Zero or negative once the trial has ended.
    pub fn trial_days_remaining(&self, now: DateTime<Utc>) -> i64 {
        let remaining = self.trial_ends_at - now;
        let day = Duration::days(1).num_milliseconds();
        let millis = remaining.num_milliseconds();
        if millis <= 0 {
            millis / day
        } else {
            (millis + day - 1) / day
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(UserRole::User),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    ExpiredTrial,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::ExpiredTrial => "expired_trial",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "expired_trial" => Some(SubscriptionStatus::ExpiredTrial),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

/// key: billing-models -> workspaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub workspace_type: WorkspaceType,
    pub status: WorkspaceStatus,
    pub billing_client_id: Option<Uuid>,
    pub payment_account_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceType {
    Direct,
    Managed,
}

impl WorkspaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceType::Direct => "direct",
            WorkspaceType::Managed => "managed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(WorkspaceType::Direct),
            "managed" => Some(WorkspaceType::Managed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Suspended,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(WorkspaceStatus::Active),
            "suspended" => Some(WorkspaceStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceMember {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(MemberRole::Owner),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

/// key: billing-models -> legacy billing clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingClient {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Global price definition stored on the tool catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub pricing_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// key: billing-models -> tool catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub tool_type: ToolType,
    pub billing_config: BillingConfig,
    pub is_enabled: bool,
    pub tier_access: Vec<SubscriptionStatus>,
    pub requires_workspace: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Included,
    Metered,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Included => "included",
            ToolType::Metered => "metered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "included" => Some(ToolType::Included),
            "metered" => Some(ToolType::Metered),
            _ => None,
        }
    }
}

/// key: billing-models -> per-workspace tool override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceTool {
    pub workspace_id: Uuid,
    pub tool_id: Uuid,
    pub is_enabled: bool,
    /// Raw override document. Only objects carrying a `type` key are honoured.
    pub pricing_override: Option<Value>,
    pub enabled_at: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
}

/// Partial update applied to an existing workspace tool row.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceToolPatch {
    pub is_enabled: Option<bool>,
    /// `Some(None)` clears the override.
    pub pricing_override: Option<Option<Value>>,
}

impl WorkspaceToolPatch {
    pub fn is_empty(&self) -> bool {
        self.is_enabled.is_none() && self.pricing_override.is_none()
    }
}

/// key: billing-models -> usage events (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub tool_id: Uuid,
    pub event_type: String,
    pub quantity: f64,
    pub unit: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub workspace_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub tool_id: Uuid,
    pub event_type: String,
    pub quantity: f64,
    pub unit: String,
    pub occurred_at: DateTime<Utc>,
}

/// key: billing-models -> scheduled charges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCharge {
    pub id: Uuid,
    pub billing_client_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub description: Option<String>,
    pub scheduled_date: DateTime<Utc>,
    pub status: super::charges::ChargeStatus,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewScheduledCharge {
    pub billing_client_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub description: Option<String>,
    pub scheduled_date: DateTime<Utc>,
}

/// key: billing-models -> orphaned external resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupQueueItem {
    pub id: Uuid,
    pub external_resource_id: String,
    pub created_at: DateTime<Utc>,
}
