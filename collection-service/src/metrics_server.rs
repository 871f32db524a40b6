use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::{
    context::ServiceContext,
    scheduler::SchedulerState,
    status::CollectionCycleStatus,
    sync::{SyncMode, SyncOutcome, SyncSkipRecord},
    telemetry::TimeoutSummary,
};

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Clone)]
pub struct HttpState {
    ctx: Arc<ServiceContext>,
    scheduler: watch::Receiver<SchedulerState>,
}

#[derive(Debug, Serialize)]
struct CatalogInfo {
    meters: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    loaded_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    scheduler: SchedulerState,
    cycle: CollectionCycleStatus,
    timeouts: TimeoutSummary,
    sync_skips: Vec<SyncSkipRecord>,
    catalog: CatalogInfo,
}

pub fn router(ctx: Arc<ServiceContext>, scheduler: watch::Receiver<SchedulerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/sync", post(sync_handler))
        .with_state(HttpState { ctx, scheduler })
}

/// Install the Prometheus recorder and serve metrics, status and the
/// manual sync trigger on `bind_addr`.
pub fn init(
    bind_addr: &str,
    ctx: Arc<ServiceContext>,
    scheduler: watch::Receiver<SchedulerState>,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // Ignore error if the handle was already set; this should only be called once.
    let _ = PROM_HANDLE.set(handle);

    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics bind address {bind_addr}: {e}"))?;
    let app = router(ctx, scheduler);

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(addr = %addr, "status server listening");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "status server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind status listener");
            }
        }
    });
    Ok(())
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(|h| h.render()).unwrap_or_default()
}

async fn status_handler(State(state): State<HttpState>) -> Json<StatusResponse> {
    let ctx = &state.ctx;
    let snapshot = ctx.catalog.snapshot();
    Json(StatusResponse {
        scheduler: *state.scheduler.borrow(),
        cycle: ctx.status.current(),
        timeouts: ctx.telemetry.summary(),
        sync_skips: ctx.sync.skip_history(),
        catalog: CatalogInfo {
            meters: snapshot.active_meters().len(),
            loaded_at: snapshot.loaded_at(),
        },
    })
}

async fn sync_handler(State(state): State<HttpState>) -> (StatusCode, Json<SyncOutcome>) {
    let outcome = state.ctx.sync.trigger(SyncMode::Manual).await;
    let code = match &outcome {
        SyncOutcome::Executed(_) => StatusCode::OK,
        SyncOutcome::Skipped(_) => StatusCode::CONFLICT,
        SyncOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
    };
    (code, Json(outcome))
}
