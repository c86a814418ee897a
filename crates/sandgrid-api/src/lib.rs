//! sandgrid-api — the Task Store HTTP API.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/task/` | Submit a task, returns its id |
//! | GET | `/task/{id}/` | Get a task |
//! | DELETE | `/task/{id}/` | Delete a task and its result |
//! | POST | `/queue/dequeue/` | Assign tasks that fit the caller's capacity |
//! | GET | `/queue/stats/` | Queue counters |
//! | POST | `/result/{id}/` | Push a result |
//! | GET | `/result/{id}/` | Get a result |
//! | POST | `/blob/` | Upload bytes, returns their sha256 reference |
//! | GET | `/blob/{reference}/` | Download bytes |

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use sandgrid_state::StateStore;

pub use auth::{ANONYMOUS, AllowAll, Authorizer, StaticTokens};

/// Largest accepted request body (blob uploads).
pub const MAX_BODY_SIZE: usize = 1 << 30;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub authorizer: Arc<dyn Authorizer>,
}

/// Build the Task Store router.
pub fn build_router(store: StateStore, authorizer: Arc<dyn Authorizer>) -> Router {
    let state = ApiState { store, authorizer };

    Router::new()
        .route("/task/", post(handlers::submit_task))
        .route("/task/{id}/", get(handlers::get_task).delete(handlers::delete_task))
        .route("/queue/dequeue/", post(handlers::dequeue))
        .route("/queue/stats/", get(handlers::queue_stats))
        .route("/result/{id}/", get(handlers::get_result).post(handlers::put_result))
        .route("/blob/", post(handlers::upload_blob))
        .route("/blob/{reference}/", get(handlers::download_blob))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
