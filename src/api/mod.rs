//! Operator HTTP API.
//!
//! | Method | Path                     | Purpose                                   |
//! |--------|--------------------------|-------------------------------------------|
//! | POST   | `/submit_story`          | queue a story for decomposition           |
//! | GET    | `/health`                | queue lengths, workers, backend health    |
//! | POST   | `/scale_workers/{count}` | resize the worker pool                    |
//! | GET    | `/metrics`               | Prometheus text exposition                |

mod error;
mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;

pub use error::{ApiError, ApiResult};
pub use handlers::{ScaleWorkersResponse, SubmitStoryRequest, SubmitStoryResponse};

/// Shared state available to all handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Builds the operator router.
pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/submit_story", post(handlers::submit_story))
        .route("/health", get(handlers::health))
        .route("/scale_workers/{count}", post(handlers::scale_workers))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { scheduler })
}
