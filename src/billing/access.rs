use chrono::{DateTime, Utc};
use serde::Serialize;

use super::context::BillingContext;
use super::models::{Profile, SubscriptionStatus, Tool, WorkspaceStatus, WorkspaceTool};

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    ToolDisabled,
    WorkspaceSuspended,
    WorkspaceToolDisabled,
    SubscriptionExpired,
    PaymentPastDue,
    TierNotIncluded,
    WorkspaceRequired,
}

impl DenialReason {
    /// Where the UI should route the caller next.
    pub fn cta(&self) -> Option<Cta> {
        match self {
            DenialReason::ToolDisabled => None,
            DenialReason::WorkspaceSuspended | DenialReason::WorkspaceToolDisabled => {
                Some(Cta::ContactAdmin)
            }
            DenialReason::SubscriptionExpired | DenialReason::TierNotIncluded => {
                Some(Cta::Subscribe)
            }
            DenialReason::PaymentPastDue => Some(Cta::UpdatePayment),
            DenialReason::WorkspaceRequired => Some(Cta::CreateWorkspace),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cta {
    Subscribe,
    UpdatePayment,
    ContactAdmin,
    CreateWorkspace,
}

/// key: billing-access -> allow/deny with reason
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
    pub cta: Option<Cta>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            cta: None,
        }
    }

    pub fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            cta: reason.cta(),
        }
    }
}

/// Evaluates tool access. First decisive rule wins.
///
/// Managed workspace members are governed by the workspace alone: their personal subscription
/// is never consulted. `workspace_tool` must be the freshly read row for the context workspace.
pub fn check_access(
    tool: &Tool,
    profile: &Profile,
    context: Option<&BillingContext>,
    workspace_tool: Option<&WorkspaceTool>,
    now: DateTime<Utc>,
) -> AccessDecision {
    if !tool.is_enabled {
        return AccessDecision::deny(DenialReason::ToolDisabled);
    }

    if let Some(BillingContext::WorkspaceMediated {
        workspace_status, ..
    }) = context.filter(|context| context.is_managed())
    {
        if *workspace_status != WorkspaceStatus::Active {
            return AccessDecision::deny(DenialReason::WorkspaceSuspended);
        }
        return match workspace_tool {
            Some(row) if row.is_enabled => AccessDecision::allow(),
            _ => AccessDecision::deny(DenialReason::WorkspaceToolDisabled),
        };
    }

    if let Some(reason) = subscription_denial(profile, now) {
        return AccessDecision::deny(reason);
    }

    if !tool.tier_access.contains(&profile.subscription_status) {
        return AccessDecision::deny(DenialReason::TierNotIncluded);
    }

    if tool.requires_workspace && context.and_then(BillingContext::workspace_id).is_none() {
        return AccessDecision::deny(DenialReason::WorkspaceRequired);
    }

    AccessDecision::allow()
}

fn subscription_denial(profile: &Profile, now: DateTime<Utc>) -> Option<DenialReason> {
    match profile.subscription_status {
        SubscriptionStatus::Active => None,
        // strict: a trial ending exactly now is over
        SubscriptionStatus::Trialing if now < profile.trial_ends_at => None,
        SubscriptionStatus::PastDue => Some(DenialReason::PaymentPastDue),
        _ => Some(DenialReason::SubscriptionExpired),
    }
}
