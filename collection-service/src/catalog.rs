use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use meter_client::{
    db::catalog_queries,
    domain::{DeviceAddress, Meter, RegisterMapping},
};
use sqlx::PgPool;
use time::OffsetDateTime;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("catalog store error: {0}")]
    Store(String),
    #[error("catalog has not been loaded")]
    NotLoaded,
}

/// Backing store the catalog loads from.
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    async fn active_meters(&self) -> Result<Vec<Meter>, CatalogError>;
    async fn register_mappings(&self) -> Result<Vec<(DeviceAddress, RegisterMapping)>, CatalogError>;
}

pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CatalogStore for PgCatalogStore {
    async fn active_meters(&self) -> Result<Vec<Meter>, CatalogError> {
        catalog_queries::active_meters(&self.pool)
            .await
            .map_err(|e| CatalogError::Store(format!("{e:#}")))
    }

    async fn register_mappings(&self) -> Result<Vec<(DeviceAddress, RegisterMapping)>, CatalogError> {
        catalog_queries::register_mappings(&self.pool)
            .await
            .map_err(|e| CatalogError::Store(format!("{e:#}")))
    }
}

#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    meters: Vec<Meter>,
    registers: HashMap<DeviceAddress, Arc<[RegisterMapping]>>,
    loaded_at: Option<OffsetDateTime>,
}

impl CatalogSnapshot {
    pub fn build(meters: Vec<Meter>, mappings: Vec<(DeviceAddress, RegisterMapping)>) -> Self {
        let mut grouped: HashMap<DeviceAddress, Vec<RegisterMapping>> = HashMap::new();
        for (address, mapping) in mappings {
            let regs = grouped.entry(address).or_default();
            if regs.iter().any(|r| r.address == mapping.address) {
                tracing::warn!(register = mapping.address, "duplicate register mapping ignored");
                continue;
            }
            regs.push(mapping);
        }

        Self {
            meters: meters.into_iter().filter(|m| m.active).collect(),
            registers: grouped.into_iter().map(|(k, v)| (k, v.into())).collect(),
            loaded_at: Some(OffsetDateTime::now_utc()),
        }
    }

    pub fn active_meters(&self) -> &[Meter] {
        &self.meters
    }

    /// Registers of a device address, in register order. Empty when the
    /// address has no mappings.
    pub fn device_registers(&self, address: &DeviceAddress) -> Arc<[RegisterMapping]> {
        self.registers
            .get(address)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn loaded_at(&self) -> Option<OffsetDateTime> {
        self.loaded_at
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded_at.is_some()
    }
}

pub struct Catalog {
    store: Arc<dyn CatalogStore>,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            current: RwLock::new(Arc::new(CatalogSnapshot::default())),
        }
    }

    async fn fetch(&self) -> Result<CatalogSnapshot, CatalogError> {
        let meters = self.store.active_meters().await?;
        let mappings = self.store.register_mappings().await?;
        Ok(CatalogSnapshot::build(meters, mappings))
    }

    fn swap(&self, snapshot: CatalogSnapshot) {
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
        *current = Arc::new(snapshot);
    }

    /// Initial load. Errors are returned to the caller, which must not start
    /// collecting without a catalog.
    pub async fn load(&self) -> Result<(), CatalogError> {
        let snapshot = self.fetch().await?;
        tracing::info!(
            meters = snapshot.meters.len(),
            devices = snapshot.registers.len(),
            "catalog loaded"
        );
        self.swap(snapshot);
        Ok(())
    }

    /// Refresh from the store. On failure the previous snapshot stays in
    /// effect and `false` is returned.
    pub async fn reload(&self) -> bool {
        match self.fetch().await {
            Ok(snapshot) => {
                tracing::info!(
                    meters = snapshot.meters.len(),
                    devices = snapshot.registers.len(),
                    "catalog reloaded"
                );
                self.swap(snapshot);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "catalog reload failed, keeping previous snapshot");
                metrics::counter!("catalog_reload_failures_total").increment(1);
                false
            }
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn active_meters(&self) -> Vec<Meter> {
        self.snapshot().active_meters().to_vec()
    }

    pub fn device_registers(&self, address: &DeviceAddress) -> Arc<[RegisterMapping]> {
        self.snapshot().device_registers(address)
    }
}
