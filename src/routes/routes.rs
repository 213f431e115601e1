//! Defines routes for the tus upload protocol.
//!
//! ## Structure
//! - **Creation endpoint**
//!   - `OPTIONS /` — capability discovery
//!   - `POST    /` — create an upload (or assemble a final one)
//!
//! - **Per-upload endpoints**
//!   - `HEAD   /{uid}` — resume point
//!   - `PATCH  /{uid}` — append at the current offset
//!   - `GET    /{uid}` — download, with range support
//!   - `DELETE /{uid}` — terminate
//!
//! The method-override and CORS layers wrap every route, so a `POST` carrying
//! `X-HTTP-Method-Override: PATCH` is rewritten before dispatch.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cors, create_upload, download_upload, head_upload, override_method, patch_upload,
            server_options, terminate_upload,
        },
    },
    state::AppState,
};
use axum::{
    middleware,
    routing::{get, head, post},
    Router,
};

/// Build and return the router for the whole protocol surface.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes(state: AppState) -> Router {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // creation endpoint
        .route("/", post(create_upload).options(server_options))
        // per-upload endpoints
        .route(
            "/{uid}",
            head(head_upload)
                .patch(patch_upload)
                .get(download_upload)
                .delete(terminate_upload)
                .options(server_options),
        )
        .layer(middleware::from_fn(override_method))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}
