use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth::{attach_identity, require_auth};
use crate::cancellable_stream::cancel_stream;
use crate::handlers::{actions::actions_handler, copilot::copilot_stream_handler, mcp::mcp_manifest};
use crate::middleware::tracing::trace_requests;
use crate::state::AppState;

pub fn app_router(app_state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/ai/actions", post(actions_handler))
        .route_layer(middleware::from_fn(require_auth));

    Router::new()
        .route("/api/ai/copilot", post(copilot_stream_handler))
        .route("/api/ai/cancel-stream", post(cancel_stream))
        .route("/api/mcp", get(mcp_manifest))
        .merge(protected_routes)
        .layer(middleware::from_fn_with_state(app_state.clone(), attach_identity))
        .layer(middleware::from_fn(trace_requests))
        .with_state(app_state)
}
