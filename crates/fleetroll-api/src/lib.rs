//! fleetroll-api: REST API for the rollout engine.
//!
//! Handlers are thin wrappers over [`RolloutManager`] and the store. All
//! responses share the `{ success, data?, error? }` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List rollouts |
//! | POST | `/api/v1/rollouts` | Create a rollout |
//! | POST | `/api/v1/rollouts/validate` | Estimate group sizes for a layout |
//! | GET | `/api/v1/rollouts/{id}` | Get a rollout |
//! | GET | `/api/v1/rollouts/{id}/groups` | Groups in chain order |
//! | GET | `/api/v1/rollouts/{id}/progress` | Action counts per group |
//! | POST | `/api/v1/rollouts/{id}/start` | Request start of a READY rollout |
//! | POST | `/api/v1/rollouts/{id}/pause` | Pause a RUNNING rollout |
//! | POST | `/api/v1/rollouts/{id}/resume` | Resume a PAUSED rollout |
//! | GET | `/api/v1/targets` | List targets |
//! | POST | `/api/v1/targets` | Register or update a target |
//! | DELETE | `/api/v1/targets/{id}` | Remove a target |
//! | GET | `/api/v1/distributions` | List distributions |
//! | POST | `/api/v1/distributions` | Create a distribution |
//! | PUT | `/api/v1/actions/{id}/status` | Report action progress |

pub mod handlers;

use axum::Router;
use axum::routing::{delete, get, post, put};
use fleetroll_rollout::RolloutManager;
use fleetroll_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: RolloutManager,
    pub store: StateStore,
}

/// Build the API router, mounted under `/api/v1`.
pub fn build_router(manager: RolloutManager) -> Router {
    let state = ApiState {
        store: manager.store().clone(),
        manager,
    };

    let api_routes = Router::new()
        .route("/rollouts", get(handlers::list_rollouts).post(handlers::create_rollout))
        .route("/rollouts/validate", post(handlers::validate_groups))
        .route("/rollouts/{id}", get(handlers::get_rollout))
        .route("/rollouts/{id}/groups", get(handlers::list_groups))
        .route("/rollouts/{id}/progress", get(handlers::get_progress))
        .route("/rollouts/{id}/start", post(handlers::start_rollout))
        .route("/rollouts/{id}/pause", post(handlers::pause_rollout))
        .route("/rollouts/{id}/resume", post(handlers::resume_rollout))
        .route("/targets", get(handlers::list_targets).post(handlers::put_target))
        .route("/targets/{id}", delete(handlers::delete_target))
        .route(
            "/distributions",
            get(handlers::list_distributions).post(handlers::create_distribution),
        )
        .route("/actions/{id}/status", put(handlers::update_action_status))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
