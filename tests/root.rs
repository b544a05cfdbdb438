use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use entitlement_engine::billing::{BillingService, CleanupDrainer, HttpResourceDeleter};
use entitlement_engine::extractor::CronSecret;
use entitlement_engine::routes;
use entitlement_engine::store::MemoryStore;
use tower::ServiceExt; // for `oneshot`

#[tokio::test]
async fn root_responds_ok() {
    let store = Arc::new(MemoryStore::new());
    let service = BillingService::new(store.clone(), Duration::from_secs(1), 1);
    let deleter = HttpResourceDeleter::new("http://127.0.0.1:9/live-inputs", None).unwrap();
    let drainer = CleanupDrainer::new(store, Arc::new(deleter), Duration::from_secs(1));
    let app = routes::app(service, drainer, CronSecret(None));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, "Entitlement Engine API".as_bytes());
}
