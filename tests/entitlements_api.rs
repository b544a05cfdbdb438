use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use entitlement_engine::billing::charges::ChargeStatus;
use entitlement_engine::billing::models::{
    BillingClient, BillingConfig, MemberRole, NewScheduledCharge, NewUsageRecord, Profile,
    SubscriptionStatus, Tool, ToolType, UserRole, Workspace, WorkspaceMember, WorkspaceStatus,
    WorkspaceTool, WorkspaceType,
};
use entitlement_engine::billing::{BillingService, CleanupDrainer, ExternalResourceDeleter};
use entitlement_engine::error::AppError;
use entitlement_engine::extractor::CronSecret;
use entitlement_engine::routes;
use entitlement_engine::store::{BillingStore, MemoryStore};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const JWT_SECRET: &str = "entitlement-test-secret";
const CRON_TOKEN: &str = "cron-test-token";

/// Fails for any resource id prefixed with `broken-`.
struct FlakyDeleter;

#[async_trait]
impl ExternalResourceDeleter for FlakyDeleter {
    async fn delete(&self, external_resource_id: &str) -> Result<(), AppError> {
        if external_resource_id.starts_with("broken-") {
            Err(AppError::ExternalResourceFailure(external_resource_id.into()))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    app: Router,
}

impl Harness {
    fn new() -> Self {
        Self::with_timeout(Duration::from_secs(2))
    }

    fn with_timeout(store_timeout: Duration) -> Self {
        std::env::set_var("JWT_SECRET", JWT_SECRET);
        let store = Arc::new(MemoryStore::new());
        let service = BillingService::new(store.clone(), store_timeout, 4);
        let drainer = CleanupDrainer::new(store.clone(), Arc::new(FlakyDeleter), store_timeout)
            .with_batch_limits(50, 500);
        let app = routes::app(service, drainer, CronSecret(Some(CRON_TOKEN.into())));
        Self { store, app }
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<String>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get(&self, uri: &str, user: Uuid) -> (StatusCode, Value) {
        self.send(Method::GET, uri, Some(token_for(user)), None).await
    }

    async fn profile(&self, status: SubscriptionStatus, trial_ends_in: ChronoDuration) -> Uuid {
        self.profile_with_role(status, trial_ends_in, UserRole::User)
            .await
    }

    async fn admin(&self) -> Uuid {
        self.profile_with_role(
            SubscriptionStatus::Active,
            ChronoDuration::zero(),
            UserRole::Admin,
        )
        .await
    }

    async fn profile_with_role(
        &self,
        status: SubscriptionStatus,
        trial_ends_in: ChronoDuration,
        role: UserRole,
    ) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        self.store
            .insert_profile(Profile {
                id,
                role,
                subscription_status: status,
                trial_ends_at: now + trial_ends_in,
                billing_account_ref: None,
                created_at: now,
                updated_at: now,
            })
            .await;
        id
    }

    async fn billing_client(&self, user_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_billing_client(BillingClient {
                id,
                name: "Legacy".into(),
                status: "active".into(),
                user_id,
                created_at: Utc::now(),
            })
            .await;
        id
    }

    async fn workspace(&self, name: &str, billing_client_id: Option<Uuid>) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_workspace(Workspace {
                id,
                name: name.into(),
                workspace_type: WorkspaceType::Managed,
                status: WorkspaceStatus::Active,
                billing_client_id,
                payment_account_ref: None,
                created_at: Utc::now(),
            })
            .await;
        id
    }

    async fn member(&self, workspace_id: Uuid, user_id: Uuid, role: MemberRole) {
        self.store
            .insert_member(WorkspaceMember {
                id: Uuid::new_v4(),
                workspace_id,
                user_id,
                role,
                created_at: Utc::now(),
            })
            .await;
    }

    async fn metered_tool(&self, slug: &str, rate: f64) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_tool(Tool {
                id,
                slug: slug.into(),
                name: slug.into(),
                tool_type: ToolType::Metered,
                billing_config: BillingConfig {
                    pricing_type: Some("metered".into()),
                    rate: Some(rate),
                    unit: Some("minute".into()),
                    description: None,
                },
                is_enabled: true,
                tier_access: vec![SubscriptionStatus::Trialing, SubscriptionStatus::Active],
                requires_workspace: false,
            })
            .await;
        id
    }

    async fn workspace_tool(&self, workspace_id: Uuid, tool_id: Uuid, is_enabled: bool) {
        let now = Utc::now();
        self.store
            .insert_workspace_tool(WorkspaceTool {
                workspace_id,
                tool_id,
                is_enabled,
                pricing_override: None,
                enabled_at: is_enabled.then_some(now),
                disabled_at: (!is_enabled).then_some(now),
            })
            .await;
    }

    async fn pending_charge(&self, billing_client_id: Uuid) -> Uuid {
        self.store
            .insert_charge(NewScheduledCharge {
                billing_client_id,
                amount_cents: 2_500,
                currency: "usd".into(),
                description: Some("March usage".into()),
                scheduled_date: Utc::now() + ChronoDuration::days(1),
            })
            .await
            .unwrap()
            .id
    }
}

fn token_for(user_id: Uuid) -> String {
    let claims = json!({"sub": user_id, "role": "user", "exp": 9999999999u64});
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

// key: entitlements-tests -> tool catalog
#[tokio::test]
async fn catalog_lists_workspace_enabled_tools_with_pricing() {
    let h = Harness::new();
    let user = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let workspace = h.workspace("Studio W", None).await;
    h.member(workspace, user, MemberRole::Member).await;
    let live = h.metered_tool("live-stream", 0.05).await;
    let captions = h.metered_tool("captions", 0.01).await;
    h.workspace_tool(workspace, live, true).await;
    h.workspace_tool(workspace, captions, false).await;

    let (status, body) = h.get("/api/tools", user).await;
    assert_eq!(status, StatusCode::OK);
    let tools = body.as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["slug"], "live-stream");
    assert_eq!(tools[0]["pricing"]["type"], "metered");
    assert_eq!(tools[0]["pricing"]["rate"], 0.05);
    assert_eq!(tools[0]["access"]["allowed"], true);

    let outsider = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let (status, body) = h.get("/api/tools", outsider).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _) = h.send(Method::GET, "/api/tools", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// key: entitlements-tests -> access precedence
#[tokio::test]
async fn workspace_toggle_overrides_active_subscription() {
    let h = Harness::new();
    let user = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let workspace = h.workspace("Studio W", None).await;
    h.member(workspace, user, MemberRole::Member).await;
    let tool = h.metered_tool("live-stream", 0.05).await;
    h.workspace_tool(workspace, tool, false).await;

    let (status, body) = h.get("/api/tools/live-stream/access", user).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "workspace_tool_disabled");
    assert_eq!(body["cta"], "contact_admin");
}

#[tokio::test]
async fn expired_trial_without_workspace_is_denied() {
    let h = Harness::new();
    let user = h
        .profile(SubscriptionStatus::Trialing, -ChronoDuration::seconds(1))
        .await;
    h.metered_tool("live-stream", 0.05).await;

    let (status, body) = h.get("/api/tools/live-stream/access", user).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "subscription_expired");
    assert_eq!(body["trial_days_remaining"], 0);
}

#[tokio::test]
async fn access_requires_a_principal_and_a_known_tool() {
    let h = Harness::new();
    h.metered_tool("live-stream", 0.05).await;
    let (status, _) = h
        .send(Method::GET, "/api/tools/live-stream/access", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h
        .send(
            Method::GET,
            "/api/tools/live-stream/access",
            Some("not-a-jwt".into()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let user = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let (status, _) = h.get("/api/tools/unknown/access", user).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn slow_store_fails_instead_of_denying() {
    let h = Harness::with_timeout(Duration::from_millis(20));
    let user = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    h.metered_tool("live-stream", 0.05).await;
    h.store.set_latency(Duration::from_millis(250));

    let (status, body) = h.get("/api/tools/live-stream/access", user).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["retryable"], true);
    assert!(body.get("allowed").is_none());
}

#[tokio::test]
async fn billing_context_prefers_workspace_client() {
    let h = Harness::new();
    let user = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let stale = h.billing_client(Some(user)).await;
    let current = h.billing_client(None).await;
    let workspace = h.workspace("Studio W", Some(current)).await;
    h.member(workspace, user, MemberRole::Owner).await;

    let (status, body) = h.get("/api/me/billing-context", user).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "workspace_mediated");
    assert_eq!(body["billing_client_id"], current.to_string());
    assert_ne!(body["billing_client_id"], stale.to_string());
    assert_eq!(body["member_role"], "owner");

    let loner = h.profile(SubscriptionStatus::Trialing, ChronoDuration::days(3)).await;
    let (status, body) = h.get("/api/me/billing-context", loner).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
}

// key: entitlements-tests -> usage aggregation
#[tokio::test]
async fn scoped_aggregation_never_leaks_other_workspaces() {
    let h = Harness::new();
    let admin = h.admin().await;
    let tool = h.metered_tool("live-stream", 0.5).await;
    let w1 = h.workspace("W1", None).await;
    let w2 = h.workspace("W2", None).await;
    let occurred_at = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
    for (workspace_id, quantity) in [(w1, 10.0), (w2, 5.0)] {
        h.store
            .insert_usage_record(NewUsageRecord {
                workspace_id: Some(workspace_id),
                user_id: None,
                tool_id: tool,
                event_type: "stream_minutes".into(),
                quantity,
                unit: "minute".into(),
                occurred_at,
            })
            .await
            .unwrap();
    }

    let uri = format!("/api/admin/usage?period=2025-03&workspace_id={w1}");
    let (status, body) = h.get(&uri, admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["billing_period"], "2025-03");
    let rows = body["aggregates"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["tool_id"], tool.to_string());
    assert_eq!(rows[0]["workspace_id"], w1.to_string());
    assert_eq!(rows[0]["quantity"], 10.0);
    assert_eq!(rows[0]["computed_amount"], 5.0);

    let (_, first) = h.get("/api/admin/usage?period=2025-03", admin).await;
    let (_, second) = h.get("/api/admin/usage?period=2025-03", admin).await;
    assert_eq!(first["aggregates"].as_array().unwrap().len(), 2);
    assert_eq!(first, second);

    let (_, april) = h.get("/api/admin/usage?period=2025-04", admin).await;
    assert!(april["aggregates"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn usage_views_enforce_roles() {
    let h = Harness::new();
    let owner = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let member = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let workspace = h.workspace("W1", None).await;
    h.member(workspace, owner, MemberRole::Owner).await;
    h.member(workspace, member, MemberRole::Member).await;

    let (status, _) = h.get("/api/admin/usage?period=2025-03", owner).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let uri = format!("/api/usage?period=2025-03&workspace_id={workspace}");
    let (status, body) = h.get(&uri, owner).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope_workspace_id"], workspace.to_string());

    let (status, _) = h.get(&uri, member).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = h.get("/api/admin/usage?period=2025-3", h.admin().await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn members_record_usage_for_enabled_tools() {
    let h = Harness::new();
    let user = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let workspace = h.workspace("W1", None).await;
    h.member(workspace, user, MemberRole::Member).await;
    let tool = h.metered_tool("live-stream", 0.05).await;
    let payload = json!({
        "workspace_id": workspace,
        "tool_slug": "live-stream",
        "quantity": 12.5,
        "event_type": "stream_minutes"
    });

    let (status, _) = h
        .send(Method::POST, "/api/usage", Some(token_for(user)), Some(payload.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    h.workspace_tool(workspace, tool, true).await;
    let (status, body) = h
        .send(Method::POST, "/api/usage", Some(token_for(user)), Some(payload))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["unit"], "minute");
    assert_eq!(body["quantity"], 12.5);
    assert_eq!(h.store.usage_len().await, 1);
}

// key: entitlements-tests -> workspace tool admin
#[tokio::test]
async fn workspace_tool_administration() {
    let h = Harness::new();
    let admin = h.admin().await;
    let outsider = h.profile(SubscriptionStatus::Active, ChronoDuration::zero()).await;
    let workspace = h.workspace("W1", None).await;
    let tool = h.metered_tool("live-stream", 0.05).await;
    let tools_uri = format!("/api/admin/workspaces/{workspace}/tools");
    let tool_uri = format!("{tools_uri}/{tool}");

    let (status, _) = h
        .send(
            Method::PATCH,
            &tools_uri,
            Some(token_for(outsider)),
            Some(json!({"tool_id": tool, "is_enabled": true})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = h
        .send(Method::PUT, &tool_uri, Some(token_for(admin)), Some(json!({"is_enabled": true})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = h
        .send(
            Method::PATCH,
            &tools_uri,
            Some(token_for(admin)),
            Some(json!({"tool_id": tool, "is_enabled": true})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_enabled"], true);
    assert!(body["enabled_at"].is_string());
    assert!(body["disabled_at"].is_null());

    let (status, _) = h
        .send(Method::PUT, &tool_uri, Some(token_for(admin)), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .send(
            Method::PUT,
            &tool_uri,
            Some(token_for(admin)),
            Some(json!({"pricing_override": {"type": "metered", "rate": null}})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, pricing) = h.get(&format!("{tool_uri}/pricing"), admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pricing["type"], "metered");
    assert_eq!(pricing["rate"], Value::Null);
    assert_eq!(pricing["source"], "override");

    let (status, _) = h
        .send(
            Method::PUT,
            &tool_uri,
            Some(token_for(admin)),
            Some(json!({"pricing_override": null})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, pricing) = h.get(&format!("{tool_uri}/pricing"), admin).await;
    assert_eq!(pricing["source"], "global");
    assert_eq!(pricing["rate"], 0.05);

    let (status, rows) = h.get(&tools_uri, admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows.as_array().unwrap().len(), 1);
}

// key: entitlements-tests -> charge lifecycle
#[tokio::test]
async fn cancel_respects_the_state_machine() {
    let h = Harness::new();
    let admin = h.admin().await;
    let client = h.billing_client(None).await;
    let workspace = h.workspace("W1", Some(client)).await;
    let pending = h.pending_charge(client).await;
    let in_flight = h.pending_charge(client).await;

    let (status, body) = h
        .send(
            Method::POST,
            &format!("/api/admin/charges/{in_flight}/outcome"),
            Some(token_for(admin)),
            Some(json!({"outcome": "processing"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processing");

    let (status, _) = h
        .send(
            Method::POST,
            &format!("/api/admin/workspaces/{workspace}/charges/{in_flight}/cancel"),
            Some(token_for(admin)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let stored = h.store.charge(in_flight).await.unwrap().unwrap();
    assert_eq!(stored.status, ChargeStatus::Processing);

    let (status, body) = h
        .send(
            Method::POST,
            &format!("/api/admin/workspaces/{workspace}/charges/{pending}/cancel"),
            Some(token_for(admin)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "canceled");

    let (status, _) = h
        .send(
            Method::POST,
            &format!("/api/admin/charges/{pending}/cancel"),
            Some(token_for(admin)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h
        .send(
            Method::POST,
            &format!("/api/admin/charges/{in_flight}/outcome"),
            Some(token_for(admin)),
            Some(json!({"outcome": "failed", "failure_reason": "card_declined"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["failure_reason"], "card_declined");
    assert!(body["processed_at"].is_string());

    let (status, _) = h
        .send(
            Method::POST,
            &format!("/api/admin/charges/{}/cancel", Uuid::new_v4()),
            Some(token_for(admin)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn charges_are_scoped_to_the_workspace_client() {
    let h = Harness::new();
    let admin = h.admin().await;
    let mine = h.billing_client(None).await;
    let theirs = h.billing_client(None).await;
    let workspace = h.workspace("W1", Some(mine)).await;
    let foreign = h.pending_charge(theirs).await;
    let charges_uri = format!("/api/admin/workspaces/{workspace}/charges");

    let (status, _) = h
        .send(
            Method::POST,
            &format!("{charges_uri}/{foreign}/cancel"),
            Some(token_for(admin)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = h
        .send(
            Method::POST,
            &charges_uri,
            Some(token_for(admin)),
            Some(json!({"amount_cents": 9900})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["currency"], "usd");

    let (status, _) = h
        .send(
            Method::POST,
            &charges_uri,
            Some(token_for(admin)),
            Some(json!({"amount_cents": -5})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, list) = h.get(&charges_uri, admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

// key: entitlements-tests -> cleanup queue
#[tokio::test]
async fn cron_cleanup_requires_the_shared_token() {
    let h = Harness::new();
    h.store.enqueue_cleanup("input-1", Utc::now()).await.unwrap();

    let (status, _) = h
        .send(Method::GET, "/api/cron/cleanup", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h
        .send(Method::GET, "/api/cron/cleanup", Some("wrong".into()), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.store.cleanup_queue_len().await, 1);
}

#[tokio::test]
async fn cron_cleanup_drains_a_bounded_batch() {
    let h = Harness::new();
    let base = Utc::now() - ChronoDuration::minutes(10);
    for (offset, id) in ["broken-a", "input-b", "broken-c", "input-d", "input-e"]
        .into_iter()
        .enumerate()
    {
        h.store
            .enqueue_cleanup(id, base + ChronoDuration::seconds(offset as i64))
            .await
            .unwrap();
    }

    let (status, body) = h
        .send(
            Method::GET,
            "/api/cron/cleanup?batch_size=3",
            Some(CRON_TOKEN.into()),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleaned"], 1);
    assert_eq!(body["failed"], 2);
    assert_eq!(h.store.cleanup_queue_len().await, 2);

    let (_, body) = h
        .send(Method::GET, "/api/cron/cleanup", Some(CRON_TOKEN.into()), None)
        .await;
    assert_eq!(body["cleaned"], 2);
    assert_eq!(body["failed"], 0);
    assert_eq!(h.store.cleanup_queue_len().await, 0);
}
