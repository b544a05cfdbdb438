use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{BillingConfig, Tool, WorkspaceTool};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PricingType {
    Included,
    Metered,
}

impl PricingType {
    /// Anything other than `metered` is billed as included.
    fn from_label(label: Option<&str>) -> Self {
        match label {
            Some("metered") => PricingType::Metered,
            _ => PricingType::Included,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Override,
    Global,
}

/// key: billing-pricing -> effective price definition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResolvedPricing {
    #[serde(rename = "type")]
    pub pricing_type: PricingType,
    pub rate: Option<f64>,
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: PricingSource,
}

impl ResolvedPricing {
    /// Amount owed for `quantity` units. Included pricing and missing rates are free.
    pub fn amount_for(&self, quantity: f64) -> f64 {
        match (self.pricing_type, self.rate) {
            (PricingType::Metered, Some(rate)) => quantity * rate,
            _ => 0.0,
        }
    }
}

pub fn resolve_pricing(tool: &Tool, workspace_tool: Option<&WorkspaceTool>) -> ResolvedPricing {
    let pricing_override = workspace_tool.and_then(|row| row.pricing_override.as_ref());
    resolve_config(&tool.billing_config, pricing_override)
}

/// Merges a workspace override over the global config.
///
/// An override is honoured only when it is an object carrying a `type` key. It then replaces
/// the global definition wholesale: `rate`, `unit` and `description` come from the override
/// alone (a missing rate stays missing). Only an empty `type` falls back to the global type.
pub fn resolve_config(global: &BillingConfig, pricing_override: Option<&Value>) -> ResolvedPricing {
    if let Some(fields) = pricing_override
        .and_then(Value::as_object)
        .filter(|fields| fields.contains_key("type"))
    {
        let override_type = fields
            .get("type")
            .and_then(Value::as_str)
            .filter(|label| !label.is_empty());
        let label = override_type.or(non_empty(global.pricing_type.as_deref()));
        return ResolvedPricing {
            pricing_type: PricingType::from_label(label),
            rate: fields.get("rate").and_then(Value::as_f64),
            unit: fields
                .get("unit")
                .and_then(Value::as_str)
                .map(str::to_string),
            description: fields
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            source: PricingSource::Override,
        };
    }

    ResolvedPricing {
        pricing_type: PricingType::from_label(non_empty(global.pricing_type.as_deref())),
        rate: global.rate,
        unit: global.unit.clone(),
        description: global.description.clone(),
        source: PricingSource::Global,
    }
}

fn non_empty(label: Option<&str>) -> Option<&str> {
    label.filter(|value| !value.is_empty())
}
