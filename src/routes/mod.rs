pub mod api_routes;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::routes::api_routes::{
    delete_all_history_handler, delete_chat_handler, get_response_handler, input_handler,
};
use crate::service::gateway_service::AgentGateway;

/// The backend's HTTP surface.
pub fn router(gateway: AgentGateway) -> Router {
    Router::new()
        .route("/input", post(input_handler))
        .route("/get_response", get(get_response_handler))
        .route("/delete_all_history", post(delete_all_history_handler))
        .route("/delete_chat", post(delete_chat_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}
