use axum::{
    routing::{get, post, put},
    Extension, Router,
};

use crate::billing::{api, BillingService, CleanupDrainer};
use crate::extractor::CronSecret;

pub async fn root() -> &'static str {
    "Entitlement Engine API"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/me/billing-context", get(api::billing_context))
        .route("/api/tools", get(api::tool_catalog))
        .route("/api/tools/:slug/access", get(api::tool_access))
        .route(
            "/api/usage",
            get(api::workspace_usage).post(api::record_usage),
        )
        .route("/api/admin/usage", get(api::admin_usage))
        .route(
            "/api/admin/workspaces/:workspace_id/tools",
            get(api::list_workspace_tools).patch(api::toggle_workspace_tool),
        )
        .route(
            "/api/admin/workspaces/:workspace_id/tools/:tool_id",
            put(api::update_workspace_tool),
        )
        .route(
            "/api/admin/workspaces/:workspace_id/tools/:tool_id/pricing",
            get(api::workspace_tool_pricing),
        )
        .route(
            "/api/admin/workspaces/:workspace_id/charges",
            get(api::list_charges).post(api::create_charge),
        )
        .route(
            "/api/admin/workspaces/:workspace_id/charges/:charge_id/cancel",
            post(api::cancel_workspace_charge),
        )
        .route(
            "/api/admin/charges/:charge_id/cancel",
            post(api::cancel_charge),
        )
        .route(
            "/api/admin/charges/:charge_id/outcome",
            post(api::charge_outcome),
        )
        .route("/api/cron/cleanup", get(api::cron_cleanup))
}

/// Full application router with its collaborators attached.
pub fn app(service: BillingService, drainer: CleanupDrainer, cron_secret: CronSecret) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(service))
        .layer(Extension(drainer))
        .layer(Extension(cron_secret))
}
