//! HTTP server setup.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

use super::v0;
use crate::controller::Controller;
use crate::tracing::prelude::*;

#[derive(OpenApi)]
#[openapi(
    info(title = "hashfleet", description = "Mining fleet controller status API"),
    tags(
        (name = "health"),
        (name = "fleet", description = "Fleet summary"),
        (name = "devices", description = "Devices and their latest telemetry"),
        (name = "strategy", description = "Price band strategy"),
        (name = "rules", description = "Automation rule evaluations"),
        (name = "audit", description = "Recent dispatched actions"),
    ),
)]
struct ApiDoc;

/// State handed to every handler.
#[derive(Clone)]
pub struct SharedState {
    pub controller: Arc<Controller>,
}

/// Build the application router.
pub fn router(controller: Arc<Controller>) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .nest("/api/v0", v0::routes())
        .split_for_parts();

    router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api))
        .layer(TraceLayer::new_for_http())
        .with_state(SharedState { controller })
}

/// Serve the API on `addr` until `cancellation` fires.
pub async fn serve(
    addr: SocketAddr,
    controller: Arc<Controller>,
    cancellation: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding API listener on {addr}"))?;
    info!(%addr, "API listening");

    axum::serve(listener, router(controller))
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await
        .context("API server failed")?;

    info!("API stopped");
    Ok(())
}
