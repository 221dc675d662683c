//! HTTP server exposing one Store over the wire protocol
//!
//! Routes:
//! - `POST /rpc`: one [`RpcRequest`] in, one [`RpcResponse`] out. Failures
//!   of the call itself are `200` with `success: false`; an unreadable
//!   envelope is `400`.
//! - `GET /health`: the Store's [`strand_core::HealthReport`], `503` when
//!   unhealthy.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use strand_core::{
    AppendRequest, HealthStatus, Result, StrandError, TimelineService,
};

use crate::protocol::{
    BlockParams, MessagesParams, MigrateParams, RpcMethod, RpcRequest, RpcResponse,
    TimelineParams,
};

type SharedService = Arc<dyn TimelineService>;

/// Serves a [`TimelineService`] to remote coordinators
#[derive(Clone)]
pub struct RpcServer {
    service: SharedService,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("store", self.service.store_id())
            .finish()
    }
}

impl RpcServer {
    /// Server for `service`
    pub fn new(service: SharedService) -> Self {
        Self { service }
    }

    /// The axum router, for embedding or for tests
    pub fn router(&self) -> Router {
        Router::new()
            .route("/rpc", post(handle_rpc))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.service.clone())
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(store = %self.service.store_id(), %addr, "rpc server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!(store = %self.service.store_id(), "rpc server stopped");
        Ok(())
    }
}

async fn handle_rpc(
    State(service): State<SharedService>,
    body: Bytes,
) -> (StatusCode, Json<RpcResponse>) {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = StrandError::serialization(format!("bad envelope: {e}"));
            return (StatusCode::BAD_REQUEST, Json(RpcResponse::err("", &err)));
        }
    };

    let started = Instant::now();
    let call = dispatch(service.as_ref(), &request);
    let result = if request.timeout > 0 {
        match tokio::time::timeout(Duration::from_millis(request.timeout), call).await {
            Ok(result) => result,
            Err(_) => Err(StrandError::timeout(format!(
                "{} after {} ms",
                request.method, request.timeout
            ))),
        }
    } else {
        call.await
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let response = match result {
        Ok(data) => {
            tracing::debug!(method = %request.method, request_id = %request.request_id, elapsed_ms, "rpc ok");
            RpcResponse::ok(request.request_id, data)
        }
        Err(err) => {
            tracing::debug!(method = %request.method, request_id = %request.request_id, elapsed_ms, error = %err, "rpc failed");
            RpcResponse::err(request.request_id, &err)
        }
    };
    (StatusCode::OK, Json(response))
}

async fn handle_health(State(service): State<SharedService>) -> (StatusCode, Json<RpcResponse>) {
    match service.health().await {
        Ok(report) => {
            let status = if report.status == HealthStatus::Unhealthy {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            match serde_json::to_value(&report) {
                Ok(data) => (status, Json(RpcResponse::ok("health", data))),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RpcResponse::err("health", &e.into())),
                ),
            }
        }
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RpcResponse::err("health", &err)),
        ),
    }
}

/// Run one request against `service`
pub async fn dispatch(
    service: &dyn TimelineService,
    request: &RpcRequest,
) -> Result<serde_json::Value> {
    match request.method {
        RpcMethod::GetTimeline => {
            let p: TimelineParams = request.params()?;
            to_json(service.get_timeline(&p.key).await?)
        }
        RpcMethod::CreateTimeline => {
            let p: TimelineParams = request.params()?;
            to_json(service.create_timeline(&p.key).await?)
        }
        RpcMethod::DeleteTimeline => {
            let p: TimelineParams = request.params()?;
            service.delete_timeline(&p.key).await?;
            Ok(serde_json::Value::Null)
        }
        RpcMethod::MigrateTimeline => {
            let p: MigrateParams = request.params()?;
            tracing::info!(store = %service.store_id(), key = %p.key, count = p.messages.len(), "receiving migrated messages");
            to_json(service.import_messages(&p.key, p.messages).await?)
        }
        RpcMethod::AddMessage => {
            let p: AppendRequest = request.params()?;
            to_json(service.add_message(p).await?)
        }
        RpcMethod::GetMessages => {
            let p: MessagesParams = request.params()?;
            to_json(service.get_messages(&p.key, p.query()?).await?)
        }
        RpcMethod::GetTimelineBlock => {
            let p: BlockParams = request.params()?;
            to_json(service.get_block(&p.block_id).await?)
        }
        RpcMethod::GetStoreStats => to_json(service.stats().await?),
        RpcMethod::HealthCheck => to_json(service.health().await?),
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}
