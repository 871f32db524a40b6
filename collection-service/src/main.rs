use std::sync::Arc;

use anyhow::Result;
use collection_service::{
    config::AppConfig,
    metrics_server, observability,
    scheduler::{Scheduler, SystemClock},
    ServiceContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;
    let metrics_addr = cfg.metrics.as_ref().map(|m| m.bind_addr.clone());

    // Database, collaborators and the initial catalog load; a catalog that
    // cannot be loaded stops the process here.
    let (ctx, writer) = ServiceContext::connect(cfg).await?;
    let ctx = Arc::new(ctx);

    let mut scheduler = Scheduler::new(ctx.clone(), writer, Arc::new(SystemClock));

    // Start status/metrics server if configured
    if let Some(addr) = &metrics_addr {
        metrics_server::init(addr, ctx.clone(), scheduler.subscribe())?;
    }

    scheduler.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    scheduler.stop().await;
    ctx.client.close_all().await;

    Ok(())
}
