use std::fmt;

use serde::{Deserialize, Serialize};

/// key: billing-charge-lifecycle -> pending, processing, terminal
///
/// `pending -> processing -> {succeeded | failed}` and `pending -> canceled`.
/// Nothing leaves a terminal state.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl ChargeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeStatus::Pending => "pending",
            ChargeStatus::Processing => "processing",
            ChargeStatus::Succeeded => "succeeded",
            ChargeStatus::Failed => "failed",
            ChargeStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ChargeStatus::Pending),
            "processing" => Some(ChargeStatus::Processing),
            "succeeded" => Some(ChargeStatus::Succeeded),
            "failed" => Some(ChargeStatus::Failed),
            "canceled" => Some(ChargeStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChargeStatus::Succeeded | ChargeStatus::Failed | ChargeStatus::Canceled
        )
    }

    pub fn can_transition_to(&self, next: ChargeStatus) -> bool {
        matches!(
            (self, next),
            (ChargeStatus::Pending, ChargeStatus::Processing)
                | (ChargeStatus::Pending, ChargeStatus::Canceled)
                | (ChargeStatus::Processing, ChargeStatus::Succeeded)
                | (ChargeStatus::Processing, ChargeStatus::Failed)
        )
    }

    /// Gateway-settled states record when processing finished.
    pub fn stamps_processed_at(&self) -> bool {
        matches!(self, ChargeStatus::Succeeded | ChargeStatus::Failed)
    }
}

impl fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcomes reported by the payment gateway adapter.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOutcome {
    Processing,
    Succeeded,
    Failed,
}

impl GatewayOutcome {
    pub fn target(&self) -> ChargeStatus {
        match self {
            GatewayOutcome::Processing => ChargeStatus::Processing,
            GatewayOutcome::Succeeded => ChargeStatus::Succeeded,
            GatewayOutcome::Failed => ChargeStatus::Failed,
        }
    }

    /// The only state each outcome may be applied from.
    pub fn expected_prior(&self) -> ChargeStatus {
        match self {
            GatewayOutcome::Processing => ChargeStatus::Pending,
            GatewayOutcome::Succeeded | GatewayOutcome::Failed => ChargeStatus::Processing,
        }
    }
}
