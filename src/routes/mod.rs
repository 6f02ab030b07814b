use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod assets;
pub mod broadcasts;
pub mod contacts;
pub mod events;
pub mod health;
pub mod status;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    let mr_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/events", post(events::handle_event))
        .route("/status", post(status::handle_status))
        .route("/contacts/groups", post(contacts::change_groups))
        .route("/contacts/release", post(contacts::release))
        .route("/broadcasts", post(broadcasts::queue))
        .route("/assets/refresh", post(assets::refresh));

    Router::new()
        .nest("/mr", mr_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024 * 8))
}
