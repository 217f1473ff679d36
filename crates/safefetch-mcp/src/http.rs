//! Download endpoint: `GET /cache/{namespace}/{hash}` serves the full cached markdown.

use axum::{
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use safefetch_local::clock::Clock;
use safefetch_local::{build_download, DownloadResponse, Services};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/cache/:namespace/:hash", get(download))
        .with_state(services)
}

async fn download(
    State(svc): State<Arc<Services>>,
    Path((namespace, hash)): Path<(String, String)>,
) -> Response {
    let r = build_download(svc.cache.as_deref(), &namespace, &hash, svc.clock.now_ms());
    tracing::debug!(status = r.status, namespace = %namespace, hash = %hash, "download");
    into_response(r)
}

fn into_response(r: DownloadResponse) -> Response {
    let status = StatusCode::from_u16(r.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = (status, r.body).into_response();
    for (k, v) in &r.headers {
        match (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) {
            (Ok(name), Ok(value)) => {
                resp.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = %k, "dropping unrepresentable header"),
        }
    }
    resp
}

/// Serve until `shutdown` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    services: Arc<Services>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(services))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
