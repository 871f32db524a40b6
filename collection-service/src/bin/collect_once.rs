use anyhow::Result;
use collection_service::{config::AppConfig, observability, ServiceContext};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let (ctx, writer) = ServiceContext::connect(cfg).await?;

    let report = ctx.collector.run_cycle(&writer).await?;
    ctx.client.close_all().await;

    println!("{}", serde_json::to_string_pretty(&report.status)?);
    tracing::info!(
        readings = report.readings,
        persisted = report.persisted,
        timeouts = report.timeouts,
        "collection finished"
    );
    Ok(())
}
