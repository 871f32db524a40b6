use std::sync::{Arc, Mutex};

use meter_client::domain::{
    Meter, MeterKey, OperationKind, PendingReading, Quality, ReadSource,
    RegisterMapping, TimeoutEvent,
};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::{
    catalog::{Catalog, CatalogError},
    config::{BatchSizePolicy, CollectorSettings},
    protocol::{DeviceClient, ProtocolError},
    sinks::ReadingStore,
    status::{CollectionCycleStatus, StatusWriter},
    telemetry::Telemetry,
};

/// Everything produced while reading one meter element.
#[derive(Debug, Clone)]
pub struct MeterOutcome {
    pub meter: MeterKey,
    pub readings: Vec<PendingReading>,
    pub timeouts: Vec<TimeoutEvent>,
    /// Batch sizes attempted, in order.
    pub batch_sizes: Vec<usize>,
    /// `b` when the meter finished; carried forward under `per_cycle`.
    pub final_batch_size: usize,
    pub fell_back: bool,
    pub failed: bool,
    pub error: Option<String>,
}

impl MeterOutcome {
    pub fn good_readings(&self) -> usize {
        self.readings
            .iter()
            .filter(|r| r.quality == Quality::Good)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub status: CollectionCycleStatus,
    pub readings: usize,
    pub persisted: usize,
    pub timeouts: usize,
}

pub struct Collector {
    settings: CollectorSettings,
    client: Arc<DeviceClient>,
    catalog: Arc<Catalog>,
    store: Arc<dyn ReadingStore>,
    telemetry: Arc<Telemetry>,
}

impl Collector {
    pub fn new(
        settings: CollectorSettings,
        client: Arc<DeviceClient>,
        catalog: Arc<Catalog>,
        store: Arc<dyn ReadingStore>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            settings,
            client,
            catalog,
            store,
            telemetry,
        }
    }

    fn timeout_event(&self, operation: OperationKind, meter: &Meter) -> TimeoutEvent {
        let timeout_ms = match operation {
            OperationKind::Batch => self.settings.batch_timeout_ms,
            OperationKind::Sequential => self.settings.sequential_timeout_ms,
        };
        TimeoutEvent {
            operation,
            timeout_ms,
            meter: meter.key(),
            device: meter.device.clone(),
            ts: OffsetDateTime::now_utc(),
        }
    }

    /// Read every register of one meter element, starting at batch size
    /// `initial_batch_size`.
    pub async fn collect_meter(
        &self,
        meter: &Meter,
        registers: &[RegisterMapping],
        initial_batch_size: usize,
    ) -> MeterOutcome {
        let ts = OffsetDateTime::now_utc();
        let n = registers.len();
        let mut readings = Vec::with_capacity(n);
        let mut timeouts = Vec::new();
        let mut batch_sizes = Vec::new();

        let mut b = initial_batch_size.max(1);
        let mut shrinks: u32 = 0;
        let mut next = 0;
        let mut fell_back = false;
        let mut unreachable: Option<ProtocolError> = None;

        while next < n {
            let end = (next + b).min(n);
            let chunk = &registers[next..end];
            batch_sizes.push(chunk.len());

            match self
                .client
                .batch_read(&meter.device, chunk, self.settings.batch_timeout())
                .await
            {
                Ok(values) => {
                    for (reg, value) in chunk.iter().zip(values) {
                        readings.push(reading(meter, reg, value, ts, ReadSource::Batch));
                    }
                    next = end;
                }
                Err(e) if e.is_unreachable() => {
                    unreachable = Some(e);
                    break;
                }
                Err(e) => {
                    timeouts.push(self.timeout_event(OperationKind::Batch, meter));
                    if b == 1 || shrinks >= self.settings.max_shrink_attempts {
                        tracing::debug!(
                            meter = %meter.key(),
                            error = %e,
                            batch_size = b,
                            "batch reads exhausted, falling back to sequential reads"
                        );
                        fell_back = true;
                        break;
                    }
                    shrinks += 1;
                    b = (b / 2).max(1);
                    tracing::debug!(meter = %meter.key(), error = %e, batch_size = b, "batch read failed, shrinking");
                }
            }
        }

        if let Some(e) = &unreachable {
            for reg in &registers[next..] {
                readings.push(PendingReading::failed(meter, reg, ts, ReadSource::Batch));
            }
            tracing::warn!(meter = %meter.key(), device = %meter.device, error = %e, "meter unreachable");
        } else if fell_back {
            let remaining = &registers[next..];
            let values = self
                .client
                .sequential_read(&meter.device, remaining, self.settings.sequential_timeout())
                .await;
            for (reg, value) in remaining.iter().zip(values) {
                match &value {
                    Err(ProtocolError::Timeout { .. } | ProtocolError::Transport(_)) => {
                        timeouts.push(self.timeout_event(OperationKind::Sequential, meter));
                    }
                    Err(e) if e.is_unreachable() && unreachable.is_none() => {
                        unreachable = Some(e.clone());
                    }
                    _ => {}
                }
                readings.push(reading(meter, reg, value, ts, ReadSource::Sequential));
            }
        }

        let good = readings.iter().filter(|r| r.quality == Quality::Good).count();
        let failed = unreachable.is_some() || (n > 0 && good == 0);
        let error = match (&unreachable, failed) {
            (Some(e), _) => Some(format!("meter {} ({}): {e}", meter.key(), meter.device)),
            (None, true) => Some(format!(
                "meter {} ({}): none of {n} registers could be read",
                meter.key(),
                meter.device
            )),
            (None, false) => None,
        };
        if n == 0 {
            tracing::warn!(meter = %meter.key(), device = %meter.device, "meter has no register mappings");
        }

        MeterOutcome {
            meter: meter.key(),
            readings,
            timeouts,
            batch_sizes,
            final_batch_size: b,
            fell_back,
            failed,
            error,
        }
    }

    /// Run one full collection cycle and publish its progress through
    /// `status`.
    ///
    /// Refuses to start while the catalog has never been loaded. The
    /// in-progress flag is cleared only after persistence has returned.
    pub async fn run_cycle(&self, status: &StatusWriter) -> Result<CycleReport, CatalogError> {
        let snapshot = self.catalog.snapshot();
        if !snapshot.is_loaded() {
            return Err(CatalogError::NotLoaded);
        }

        let started = Instant::now();
        let cycle_id = status.begin_cycle();
        let meters = snapshot.active_meters().to_vec();
        tracing::info!(cycle_id, meters = meters.len(), "collection cycle started");

        let queue = Mutex::new(meters.into_iter());
        let (queue, snapshot) = (&queue, &snapshot);
        let workers = (0..self.settings.workers.max(1)).map(|_| async move {
            let mut carried = self.settings.batch_size;
            let mut outcomes = Vec::new();
            loop {
                let next = queue.lock().unwrap_or_else(|p| p.into_inner()).next();
                let Some(meter) = next else {
                    break;
                };

                let initial = match self.settings.batch_size_policy {
                    BatchSizePolicy::PerMeter => self.settings.batch_size,
                    BatchSizePolicy::PerCycle => carried,
                };
                let registers = snapshot.device_registers(&meter.device);
                let outcome = self.collect_meter(&meter, &registers, initial).await;

                carried = outcome.final_batch_size;
                self.telemetry.record_all(outcome.timeouts.iter().cloned());
                if outcome.failed {
                    metrics::counter!("collector_meters_failed_total").increment(1);
                }
                status.record_meter(outcome.failed, outcome.error.clone());
                outcomes.push(outcome);
            }
            outcomes
        });
        let outcomes: Vec<MeterOutcome> = futures::future::join_all(workers)
            .await
            .into_iter()
            .flatten()
            .collect();

        let readings: Vec<PendingReading> = outcomes
            .iter()
            .flat_map(|o| o.readings.iter().cloned())
            .collect();
        for q in [Quality::Good, Quality::Questionable] {
            let count = readings.iter().filter(|r| r.quality == q).count();
            metrics::counter!("collector_readings_total", "quality" => q.as_str())
                .increment(count as u64);
        }

        let results = self.store.persist_readings(&readings).await;
        let rejected: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        if let Some(first) = rejected.first() {
            tracing::warn!(
                cycle_id,
                failed = rejected.len(),
                total = readings.len(),
                error = %first,
                "some readings could not be persisted"
            );
            status.record_error(format!(
                "{} of {} readings not persisted: {first}",
                rejected.len(),
                readings.len()
            ));
        }
        let persisted = results.len() - rejected.len();

        let timeouts = outcomes.iter().map(|o| o.timeouts.len()).sum();
        let status = status.finish_cycle();
        let elapsed = started.elapsed();
        metrics::histogram!("collector_cycle_duration_seconds").record(elapsed.as_secs_f64());
        tracing::info!(
            cycle_id,
            processed = status.meters_processed,
            failed = status.meters_failed,
            readings = readings.len(),
            persisted,
            timeouts,
            elapsed_ms = elapsed.as_millis() as u64,
            "collection cycle finished"
        );

        Ok(CycleReport {
            status,
            readings: readings.len(),
            persisted,
            timeouts,
        })
    }
}

fn reading(
    meter: &Meter,
    reg: &RegisterMapping,
    value: Result<f64, ProtocolError>,
    ts: OffsetDateTime,
    source: ReadSource,
) -> PendingReading {
    match value {
        Ok(v) => PendingReading::good(meter, reg, v, ts, source),
        Err(e) => {
            tracing::debug!(meter = %meter.key(), register = reg.address, error = %e, "register read failed");
            PendingReading::failed(meter, reg, ts, source)
        }
    }
}
