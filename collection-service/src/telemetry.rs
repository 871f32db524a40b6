use std::{collections::VecDeque, sync::Mutex};

use meter_client::domain::{OperationKind, TimeoutEvent};
use serde::Serialize;

use crate::config::CollectorSettings;

const RECENT_EVENTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationTimeouts {
    pub count: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeoutSummary {
    pub batch: OperationTimeouts,
    pub sequential: OperationTimeouts,
    /// Newest last.
    pub recent: Vec<TimeoutEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    batch: u64,
    sequential: u64,
    recent: VecDeque<TimeoutEvent>,
}

/// Append-only timeout telemetry, counted per operation type.
#[derive(Debug)]
pub struct Telemetry {
    batch_timeout_ms: u64,
    sequential_timeout_ms: u64,
    inner: Mutex<Inner>,
}

impl Telemetry {
    pub fn new(settings: &CollectorSettings) -> Self {
        Self {
            batch_timeout_ms: settings.batch_timeout_ms,
            sequential_timeout_ms: settings.sequential_timeout_ms,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record(&self, event: TimeoutEvent) {
        metrics::counter!("collector_timeouts_total", "operation" => event.operation.as_str())
            .increment(1);
        tracing::debug!(
            operation = %event.operation,
            timeout_ms = event.timeout_ms,
            meter = %event.meter,
            device = %event.device,
            "read timeout recorded"
        );

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match event.operation {
            OperationKind::Batch => inner.batch += 1,
            OperationKind::Sequential => inner.sequential += 1,
        }
        if inner.recent.len() == RECENT_EVENTS {
            inner.recent.pop_front();
        }
        inner.recent.push_back(event);
    }

    pub fn record_all(&self, events: impl IntoIterator<Item = TimeoutEvent>) {
        for e in events {
            self.record(e);
        }
    }

    pub fn summary(&self) -> TimeoutSummary {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        TimeoutSummary {
            batch: OperationTimeouts {
                count: inner.batch,
                timeout_ms: self.batch_timeout_ms,
            },
            sequential: OperationTimeouts {
                count: inner.sequential,
                timeout_ms: self.sequential_timeout_ms,
            },
            recent: inner.recent.iter().cloned().collect(),
        }
    }
}
