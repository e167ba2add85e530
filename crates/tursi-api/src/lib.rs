//! tursi-api — REST control API for Tursi.
//!
//! Translates HTTP requests into state-store mutations. Handlers never talk
//! to the supervisor; the supervisor observes the rows they write.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/health` | Liveness and version |
//! | GET | `/api/v1/models` | List active deployments |
//! | POST | `/api/v1/models` | Create a `pending` deployment |
//! | GET | `/api/v1/models/{id}` | Get one deployment |
//! | DELETE | `/api/v1/models/{id}` | Request a stop |
//! | GET | `/api/v1/models/{id}/logs?limit=N` | Newest log entries first |
//! | GET | `/api/v1/models/{id}/metrics?limit=N` | Newest metric samples first |

pub mod handlers;

use axum::Router;
use axum::routing::get;
use tursi_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

/// Build the complete API router.
pub fn build_router(store: StateStore) -> Router {
    let api_state = ApiState { store };

    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::list_models).post(handlers::create_model))
        .route("/models/{id}", get(handlers::get_model).delete(handlers::stop_model))
        .route("/models/{id}/logs", get(handlers::get_logs))
        .route("/models/{id}/metrics", get(handlers::get_metrics))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
