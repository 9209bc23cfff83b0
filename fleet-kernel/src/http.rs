/**
 * HTTP EDGE - axum router in front of the ingestion service
 *
 * ROLE: turns each POST into one `IngestionService::handle` call, with the
 * peer IP as the caller's identity.
 *
 * ROUTES:
 * - GET  /           plain-text banner
 * - POST /heartbeat  register or refresh a node
 * - POST /stats      hardware, runtime or tasks report
 * - POST /query      settings, quota, hardware, runtime or tasks
 * - POST /realloc    always 501
 *
 * The HTTP status mirrors `status_code` of the JSON body.
 */

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use fleet_proto::{Api, Response, StatusCode as WireStatusCode};

use crate::service::IngestionService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestionService>,
}

/// A structured response on the wire.
pub struct WireResponse(pub Response);

impl IntoResponse for WireResponse {
    fn into_response(self) -> HttpResponse {
        let status = StatusCode::from_u16(self.0.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/heartbeat", post(heartbeat))
        .route("/stats", post(stats))
        .route("/query", post(query))
        .route("/realloc", post(realloc))
        .with_state(app_state)
}

/// Serve until `shutdown` resolves. In-flight requests are drained first.
pub async fn serve(
    listener: TcpListener,
    service: Arc<IngestionService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on http://{addr}");
    }
    let app = build_router(AppState { service });
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

async fn banner() -> &'static str {
    concat!("fleet-kernel ", env!("CARGO_PKG_VERSION"), "\n")
}

/// Store work (locks, regex compilation, ledger sorts) runs on the blocking pool.
async fn dispatch(app: &AppState, api: Api, peer: SocketAddr, body: Bytes) -> WireResponse {
    let service = app.service.clone();
    let handled = tokio::task::spawn_blocking(move || service.handle(api, peer.ip(), &body)).await;
    match handled {
        Ok(resp) => WireResponse(resp),
        Err(e) => {
            error!("{api} from {peer} did not complete: {e}");
            WireResponse(Response::new(WireStatusCode::InternalServerError, None))
        }
    }
}

async fn heartbeat(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> WireResponse {
    dispatch(&app, Api::Heartbeat, peer, body).await
}

async fn stats(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> WireResponse {
    dispatch(&app, Api::Stats, peer, body).await
}

async fn query(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> WireResponse {
    dispatch(&app, Api::Query, peer, body).await
}

async fn realloc(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> WireResponse {
    dispatch(&app, Api::Realloc, peer, body).await
}
