//! Router configuration for the node API.

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;

use crate::{error, handler, middleware as app_middleware, state::AppState, ws};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Create a new router with the given state.
pub fn create_router(state: AppState) -> Router {
    let upload_limit_bytes =
        *state.get_config().snapshot().get_api().get_upload_limit() as usize * 1024 * 1024;

    // Everything except the websocket authenticates with the static node
    // token; the websocket authenticates with a panel-signed JWT instead.
    let authenticated = Router::new()
        .route("/system", get(handler::system_information))
        .route("/servers", post(handler::create_server))
        .route(
            "/servers/{uuid}",
            get(handler::view_server).delete(handler::delete_server),
        )
        .route("/servers/{uuid}/power", post(handler::power))
        .route("/servers/{uuid}/commands", post(handler::send_commands))
        .route("/servers/{uuid}/files/list", get(handler::list_files))
        .route("/servers/{uuid}/files/write", post(handler::write_file))
        .route("/servers/{uuid}/files/compress", post(handler::compress_files))
        .route(
            "/servers/{uuid}/files/decompress",
            post(handler::decompress_file),
        )
        .route("/servers/{uuid}/backup", post(handler::create_backup))
        .route(
            "/servers/{uuid}/backup/{backup}",
            post(handler::restore_backup).delete(handler::delete_backup),
        )
        .route("/servers/{uuid}/transfer", post(handler::transfer_server))
        .route("/transfers", post(handler::receive_transfer))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ));

    let websocket = Router::new().route("/servers/{uuid}/ws", get(ws::server_websocket));

    Router::new()
        .nest("/api", authenticated.merge(websocket))
        .layer(middleware::from_fn(app_middleware::logging_middleware))
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(DefaultBodyLimit::max(upload_limit_bytes))
        .with_state(state)
}
