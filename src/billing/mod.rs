pub mod access;
pub mod api;
pub mod charges;
pub mod cleanup;
pub mod context;
pub mod models;
pub mod pricing;
pub mod service;
pub mod usage;

pub use access::{AccessDecision, Cta, DenialReason};
pub use charges::{ChargeStatus, GatewayOutcome};
pub use cleanup::{CleanupDrainer, DrainReport, ExternalResourceDeleter, HttpResourceDeleter};
pub use context::BillingContext;
pub use pricing::{PricingSource, PricingType, ResolvedPricing};
pub use service::{BillingService, CatalogEntry, CreateCharge, RecordUsage, ToolAccess};
pub use usage::{BillingPeriod, UsageAggregate, UsageSummary};
