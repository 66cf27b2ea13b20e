use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::content_store::ContentStore;
use crate::context::ServiceContext;
use crate::driver::Pipeline;
use crate::pipeline_ledger::PipelineLedger;
use crate::RawEmail;

use super::config::ServiceConfig;
use super::state::AppState;
use super::worker::{PipelineQueue, PipelineSubmitter};
use super::BoxError;

const ACK_MESSAGE: &str = "Queued. Thank you.";

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let context = Arc::new(ServiceContext::open(&config)?);
    let pipeline = Arc::new(Pipeline::from_config(&config, context.clone()));

    match pipeline.ledger().list_pending().await {
        Ok(pending) if !pending.is_empty() => warn!(
            "{} email(s) left pending by a previous run; `assistance rerun` replays them",
            pending.len()
        ),
        Ok(_) => {}
        Err(err) => warn!("could not list pending emails: {}", err),
    }

    let queue = PipelineQueue::start(
        pipeline.clone(),
        config.pipeline_queue_capacity,
        config.pipeline_max_in_flight,
    );
    let app = build_router(
        Arc::new(pipeline.store().clone()),
        Arc::new(pipeline.ledger().clone()),
        queue.submitter(),
        config.inbound_body_max_bytes,
    );

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("assistance email service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    queue.shutdown().await;
    context.close();
    serve_result?;
    Ok(())
}

pub fn build_router(
    store: Arc<ContentStore>,
    ledger: Arc<PipelineLedger>,
    queue: PipelineSubmitter,
    body_limit: usize,
) -> Router {
    let state = AppState {
        store,
        ledger,
        queue,
    };
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/email", post(receive_email))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Stores the payload, marks it pending and hands it to the worker queue.
async fn receive_email(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let raw: RawEmail = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        Ok(_) | Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "bad_json"})));
        }
    };

    let digest = match state.store.put(&raw).await {
        Ok(digest) => digest,
        Err(err) => {
            error!("failed to store inbound email: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "store_failed"})),
            );
        }
    };
    if let Err(err) = state.ledger.mark(&digest).await {
        error!("[{}] failed to mark inbound email pending: {}", digest, err);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "store_failed"})),
        );
    }
    info!("[{}] inbound email stored", digest);

    // The marker is on disk, so a rerun recovers the email even if queuing fails.
    if let Err(err) = state.queue.submit(digest.clone(), raw).await {
        error!("[{}] could not queue email: {}", digest, err);
    }

    (StatusCode::OK, Json(json!({"message": ACK_MESSAGE})))
}
