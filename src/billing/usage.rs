use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::models::{Tool, ToolType, UsageRecord};
use super::pricing::{PricingSource, PricingType, ResolvedPricing};

/// key: billing-usage -> calendar month bucket (`YYYY-MM`)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BillingPeriod {
    year: i32,
    month: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
        let end = start.checked_add_months(Months::new(1))?;
        Some(Self {
            year,
            month,
            start,
            end,
        })
    }

    /// Parses a `YYYY-MM` key.
    pub fn parse(key: &str) -> Option<Self> {
        let (year, month) = key.trim().split_once('-')?;
        if year.len() != 4 || month.len() != 2 {
            return None;
        }
        let year = year.parse::<i32>().ok()?;
        let month = month.parse::<u32>().ok()?;
        Self::new(year, month)
    }

    pub fn containing(now: DateTime<Utc>) -> Option<Self> {
        Self::new(now.year(), now.month())
    }

    /// Half-open bounds `[start, end)`.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start, self.end)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for BillingPeriod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Summed usage for one `(tool, workspace)` pair before pricing is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct UsageGroup {
    pub tool_id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub quantity: f64,
    pub event_count: u64,
    /// Unit of the earliest record in the group.
    pub recorded_unit: String,
}

/// Groups in-period records by `(tool_id, workspace_id)`.
///
/// Output is ordered by tool id then workspace id. Quantities are summed in `(occurred_at, id)`
/// order so repeated runs produce identical floating point totals. When `scope` is given only
/// records of that workspace are kept.
pub fn group_records(
    records: &[UsageRecord],
    period: &BillingPeriod,
    scope: Option<Uuid>,
) -> Vec<UsageGroup> {
    let mut ordered: Vec<&UsageRecord> = records
        .iter()
        .filter(|record| period.contains(record.occurred_at))
        .filter(|record| scope.map_or(true, |scope| record.workspace_id == Some(scope)))
        .collect();
    ordered.sort_by(|a, b| (a.occurred_at, a.id).cmp(&(b.occurred_at, b.id)));

    let mut groups: BTreeMap<(Uuid, Option<Uuid>), UsageGroup> = BTreeMap::new();
    for record in ordered {
        let group = groups
            .entry((record.tool_id, record.workspace_id))
            .or_insert_with(|| UsageGroup {
                tool_id: record.tool_id,
                workspace_id: record.workspace_id,
                quantity: 0.0,
                event_count: 0,
                recorded_unit: record.unit.clone(),
            });
        group.quantity += record.quantity;
        group.event_count += 1;
    }
    groups.into_values().collect()
}

/// key: billing-usage -> billable line item
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UsageAggregate {
    pub tool_id: Uuid,
    pub tool_slug: String,
    pub workspace_id: Option<Uuid>,
    pub workspace_name: Option<String>,
    pub quantity: f64,
    pub event_count: u64,
    pub unit: String,
    pub pricing_type: PricingType,
    pub rate: Option<f64>,
    pub pricing_source: PricingSource,
    pub computed_amount: f64,
}

impl UsageAggregate {
    /// Applies resolved pricing to a group. A group whose tool vanished is reported as free, and
    /// an `included` tool never bills whatever its config or override says.
    pub fn priced(
        group: UsageGroup,
        tool: Option<&Tool>,
        pricing: Option<ResolvedPricing>,
        workspace_name: Option<String>,
    ) -> Self {
        let pricing = pricing.unwrap_or(ResolvedPricing {
            pricing_type: PricingType::Included,
            rate: None,
            unit: None,
            description: None,
            source: PricingSource::Global,
        });
        let computed_amount = match tool {
            Some(tool) if tool.tool_type == ToolType::Included => 0.0,
            _ => pricing.amount_for(group.quantity),
        };
        Self {
            tool_id: group.tool_id,
            tool_slug: tool.map_or_else(|| "unknown".to_string(), |tool| tool.slug.clone()),
            workspace_id: group.workspace_id,
            workspace_name,
            quantity: group.quantity,
            event_count: group.event_count,
            unit: pricing.unit.clone().unwrap_or(group.recorded_unit),
            pricing_type: pricing.pricing_type,
            rate: pricing.rate,
            pricing_source: pricing.source,
            computed_amount,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UsageSummary {
    pub billing_period: BillingPeriod,
    pub scope_workspace_id: Option<Uuid>,
    pub aggregates: Vec<UsageAggregate>,
    pub total_amount: f64,
}

impl UsageSummary {
    pub fn new(
        billing_period: BillingPeriod,
        scope_workspace_id: Option<Uuid>,
        aggregates: Vec<UsageAggregate>,
    ) -> Self {
        let total_amount = aggregates.iter().map(|row| row.computed_amount).sum();
        Self {
            billing_period,
            scope_workspace_id,
            aggregates,
            total_amount,
        }
    }
}
