use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use sqlx::postgres::PgPoolOptions;

use crate::{
    catalog::{Catalog, CatalogStore, PgCatalogStore},
    collector::Collector,
    config::AppConfig,
    protocol::{DeviceClient, DeviceTransport, ModbusTcpTransport},
    sinks::{HttpUploader, PgReadingStore, ReadingStore, Uploader},
    status::{status_cell, StatusReader, StatusWriter},
    sync::{HttpRemoteSync, RemoteSync, SyncCoordinator},
    telemetry::Telemetry,
};

/// External collaborators the engine talks to.
pub struct Collaborators {
    pub catalog_store: Arc<dyn CatalogStore>,
    pub transport: Arc<dyn DeviceTransport>,
    pub store: Arc<dyn ReadingStore>,
    pub uploader: Arc<dyn Uploader>,
    pub remote: Arc<dyn RemoteSync>,
}

pub struct ServiceContext {
    pub config: AppConfig,
    pub catalog: Arc<Catalog>,
    pub client: Arc<DeviceClient>,
    pub collector: Arc<Collector>,
    pub telemetry: Arc<Telemetry>,
    pub status: StatusReader,
    pub sync: Arc<SyncCoordinator>,
    pub uploader: Arc<dyn Uploader>,
}

impl ServiceContext {
    /// Wire the engine together. The returned writer is the only handle
    /// that can publish collection status; hand it to whoever runs cycles.
    pub fn new(config: AppConfig, parts: Collaborators) -> (Self, StatusWriter) {
        let (writer, status) = status_cell();
        let catalog = Arc::new(Catalog::new(parts.catalog_store));
        let client = Arc::new(DeviceClient::new(parts.transport, config.connection.clone()));
        let telemetry = Arc::new(Telemetry::new(&config.collector));
        let collector = Arc::new(Collector::new(
            config.collector.clone(),
            client.clone(),
            catalog.clone(),
            parts.store,
            telemetry.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            status.clone(),
            parts.remote,
            catalog.clone(),
        ));

        let ctx = Self {
            config,
            catalog,
            client,
            collector,
            telemetry,
            status,
            sync,
            uploader: parts.uploader,
        };
        (ctx, writer)
    }

    /// Connect to Postgres, build the production collaborators and load the
    /// catalog. A catalog that cannot be loaded is fatal.
    pub async fn connect(config: AppConfig) -> anyhow::Result<(Self, StatusWriter)> {
        let uri = config
            .database_uri
            .clone()
            .context("no database configured; set DATABASE_URL or [database].uri")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&uri)
            .await
            .context("failed to connect to database")?;

        let persistence = &config.persistence;
        let parts = Collaborators {
            catalog_store: Arc::new(PgCatalogStore::new(pool.clone())),
            transport: Arc::new(ModbusTcpTransport::default()),
            store: Arc::new(PgReadingStore::new(
                pool.clone(),
                persistence.batch_size,
                persistence.max_retries,
                Duration::from_millis(persistence.retry_backoff_ms),
            )),
            uploader: Arc::new(HttpUploader::new(
                pool,
                config.schedule.upload.url.clone(),
                config.schedule.upload.batch_limit,
            )),
            remote: Arc::new(HttpRemoteSync::new(config.schedule.remote_sync.url.clone())),
        };

        let (ctx, writer) = Self::new(config, parts);
        ctx.catalog
            .load()
            .await
            .context("initial catalog load failed")?;
        Ok((ctx, writer))
    }
}
