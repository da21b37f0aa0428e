//! API regression tests.
//!
//! Drive the daemon's router in-process with `tower::ServiceExt::oneshot`
//! over an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleetroll_api::build_router;
use fleetroll_core::RolloutSettings;
use fleetroll_rollout::{RolloutManager, StoreTargetMatcher};
use fleetroll_scheduler::RolloutScheduler;
use fleetroll_state::*;
use serde_json::{Value, json};
use tower::ServiceExt;

struct App {
    router: Router,
    store: StateStore,
    manager: RolloutManager,
}

fn app() -> App {
    let store = StateStore::open_in_memory().unwrap();
    let matcher = Arc::new(StoreTargetMatcher::new(store.clone()));
    let manager = RolloutManager::new(store.clone(), matcher, RolloutSettings::default());
    App {
        router: build_router(manager.clone()),
        store,
        manager,
    }
}

fn seed(store: &StateStore, targets: usize) -> DistributionId {
    for i in 0..targets {
        store
            .put_target(&Target::new(format!("dev-{i:02}")).with_attribute("ring", "canary"))
            .unwrap();
    }
    store.create_distribution("firmware", "3.1").unwrap().id
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn api_list_rollouts_empty() {
    let app = app();
    let (status, body) = send(&app.router, "GET", "/api/v1/rollouts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn api_create_and_get_rollout() {
    let app = app();
    let distribution = seed(&app.store, 4);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({
            "name": "fw-3.1",
            "distribution_id": distribution,
            "target_filter": "ring==canary",
            "groups": { "count": 2 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "creating");
    let id = body["data"]["id"].as_u64().unwrap();

    let (status, body) = send(&app.router, "GET", &format!("/api/v1/rollouts/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "fw-3.1");

    let (status, body) =
        send(&app.router, "GET", &format!("/api/v1/rollouts/{id}/groups"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["name"], "group-1");
}

#[tokio::test]
async fn api_validate_groups_estimates_sizes() {
    let app = app();
    seed(&app.store, 8);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/rollouts/validate",
        Some(json!({ "target_filter": "*", "groups": { "count": 4 } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_targets"], 8);
    assert_eq!(body["data"]["targets_per_group"], json!([2, 2, 2, 2]));
    assert!(app.store.list_rollouts().unwrap().is_empty());
}

#[tokio::test]
async fn api_rejects_bad_requests() {
    let app = app();
    let distribution = seed(&app.store, 4);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({
            "name": "  ",
            "distribution_id": distribution,
            "target_filter": "*",
            "groups": { "count": 2 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body.get("data").is_none());

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({
            "name": "broken-filter",
            "distribution_id": distribution,
            "target_filter": "ring=canary",
            "groups": { "count": 2 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({
            "name": "no-dist",
            "distribution_id": 99,
            "target_filter": "*",
            "groups": { "count": 2 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/rollouts/validate",
        Some(json!({ "target_filter": "*", "groups": { "count": u64::MAX } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn api_lifecycle_errors() {
    let app = app();
    let (status, _) = send(&app.router, "GET", "/api/v1/rollouts/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app.router, "GET", "/api/v1/rollouts/42/progress", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let distribution = seed(&app.store, 2);
    let (_, body) = send(
        &app.router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({
            "name": "early",
            "distribution_id": distribution,
            "target_filter": "*",
            "groups": { "count": 1 }
        })),
    )
    .await;
    let id = body["data"]["id"].as_u64().unwrap();

    // Still CREATING: none of the lifecycle requests apply.
    for op in ["start", "pause", "resume"] {
        let (status, body) =
            send(&app.router, "POST", &format!("/api/v1/rollouts/{id}/{op}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT, "{op}");
        assert_eq!(body["success"], false);
    }
}

#[tokio::test]
async fn api_target_registry() {
    let app = app();

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/targets",
        Some(json!({ "id": "dev-01", "attributes": { "region": "eu" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["attributes"]["region"], "eu");

    let (status, _) = send(&app.router, "POST", "/api/v1/targets", Some(json!({ "id": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app.router, "GET", "/api/v1/targets", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app.router, "DELETE", "/api/v1/targets/dev-01", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app.router, "DELETE", "/api/v1/targets/dev-01", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_distributions() {
    let app = app();
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/v1/distributions",
        Some(json!({ "name": "firmware", "version": "3.2" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], 1);

    let (_, body) = send(&app.router, "GET", "/api/v1/distributions", None).await;
    assert_eq!(body["data"][0]["version"], "3.2");
}

#[tokio::test]
async fn api_action_feedback_drives_progress() {
    let app = app();
    let distribution = seed(&app.store, 3);
    let rollout = app
        .manager
        .create_rollout(fleetroll_rollout::CreateRollout::new(
            "feedback",
            distribution,
            "*",
            fleetroll_rollout::GroupLayout::Count(1),
        ))
        .unwrap();

    let scheduler =
        RolloutScheduler::new(app.manager.executor(), Duration::from_secs(10), Duration::from_secs(1));
    scheduler.tick(100_000);
    app.manager.start(rollout.id).unwrap();
    scheduler.tick(200_000);

    let actions = app.store.list_actions_for_rollout(rollout.id).unwrap();
    assert_eq!(actions.len(), 3);
    let (status, body) = send(
        &app.router,
        "PUT",
        &format!("/api/v1/actions/{}/status", actions[0].id),
        Some(json!({ "status": "finished" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["active"], false);

    // A finished action stays finished.
    let (status, body) = send(
        &app.router,
        "PUT",
        &format!("/api/v1/actions/{}/status", actions[0].id),
        Some(json!({ "status": "running" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, body) = send(
        &app.router,
        "GET",
        &format!("/api/v1/rollouts/{}/progress", rollout.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["actions"]["finished"], 1);
    assert_eq!(body["data"]["actions"]["running"], 2);

    let (status, _) = send(
        &app.router,
        "PUT",
        "/api/v1/actions/999/status",
        Some(json!({ "status": "error" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
