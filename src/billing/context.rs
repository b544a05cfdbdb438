use serde::Serialize;
use uuid::Uuid;

use super::models::{
    MemberRole, Workspace, WorkspaceMember, WorkspaceStatus, WorkspaceType,
};

/// key: billing-context -> resolved billing entity for a principal
///
/// Workspace-mediated resolution always wins over the legacy per-user client link, which may be
/// stale after a user was migrated into a workspace.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillingContext {
    Direct {
        billing_client_id: Uuid,
    },
    WorkspaceMediated {
        workspace_id: Uuid,
        workspace_name: String,
        workspace_type: WorkspaceType,
        workspace_status: WorkspaceStatus,
        member_role: MemberRole,
        billing_client_id: Option<Uuid>,
    },
}

impl BillingContext {
    pub fn mediated(
        member: &WorkspaceMember,
        workspace: &Workspace,
        billing_client_id: Option<Uuid>,
    ) -> Self {
        BillingContext::WorkspaceMediated {
            workspace_id: workspace.id,
            workspace_name: workspace.name.clone(),
            workspace_type: workspace.workspace_type,
            workspace_status: workspace.status,
            member_role: member.role,
            billing_client_id,
        }
    }

    pub fn workspace_id(&self) -> Option<Uuid> {
        match self {
            BillingContext::WorkspaceMediated { workspace_id, .. } => Some(*workspace_id),
            BillingContext::Direct { .. } => None,
        }
    }

    pub fn billing_client_id(&self) -> Option<Uuid> {
        match self {
            BillingContext::Direct { billing_client_id } => Some(*billing_client_id),
            BillingContext::WorkspaceMediated {
                billing_client_id, ..
            } => *billing_client_id,
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(
            self,
            BillingContext::WorkspaceMediated {
                workspace_type: WorkspaceType::Managed,
                ..
            }
        )
    }

    pub fn member_role(&self) -> Option<MemberRole> {
        match self {
            BillingContext::WorkspaceMediated { member_role, .. } => Some(*member_role),
            BillingContext::Direct { .. } => None,
        }
    }
}

/// Picks the membership that defines a user's context.
///
/// Memberships arrive oldest first. An active workspace is preferred; when every workspace is
/// suspended the oldest membership still resolves so callers can gate on the status.
pub fn select_membership(
    memberships: &[(WorkspaceMember, Workspace)],
) -> Option<&(WorkspaceMember, Workspace)> {
    memberships
        .iter()
        .find(|(_, workspace)| workspace.status == WorkspaceStatus::Active)
        .or_else(|| memberships.first())
}
