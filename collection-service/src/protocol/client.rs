use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use meter_client::domain::{DeviceAddress, Endpoint, OperationKind, RegisterMapping};
use tokio::time::Instant;

use super::{DeviceConnection, DeviceTransport, ProtocolError};
use crate::config::ConnectionSettings;

/// Decoded value of one register, or why it could not be decoded.
pub type RegisterValue = Result<f64, ProtocolError>;

/// Outcome of a successful batch round trip: one entry per requested
/// register. Entries can still be `Decode` errors.
pub type BatchValues = Vec<RegisterValue>;

struct Slot {
    conn: Option<Box<dyn DeviceConnection>>,
    last_used: Instant,
}

impl Slot {
    async fn recycle(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }
}

/// Connection-owning protocol client.
///
/// Holds at most one connection per endpoint. Every operation against an
/// endpoint takes that endpoint's slot lock for its whole duration, so
/// requests to one device are never interleaved.
pub struct DeviceClient {
    transport: Arc<dyn DeviceTransport>,
    settings: ConnectionSettings,
    slots: Mutex<HashMap<Endpoint, Arc<tokio::sync::Mutex<Slot>>>>,
}

impl DeviceClient {
    pub fn new(transport: Arc<dyn DeviceTransport>, settings: ConnectionSettings) -> Self {
        Self {
            transport,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, endpoint: &Endpoint) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Slot {
                    conn: None,
                    last_used: Instant::now(),
                }))
            })
            .clone()
    }

    /// Read many registers in one round trip.
    pub async fn batch_read(
        &self,
        device: &DeviceAddress,
        registers: &[RegisterMapping],
        timeout: Duration,
    ) -> Result<BatchValues, ProtocolError> {
        let endpoint = device.endpoint();
        let slot = self.slot(&endpoint);
        let mut slot = slot.lock().await;

        self.ensure_connected(&mut slot, &endpoint, timeout).await?;
        let Some(conn) = slot.conn.as_mut() else {
            return Err(ProtocolError::Transport("connection unavailable".to_string()));
        };

        let result = with_timeout(
            OperationKind::Batch,
            timeout,
            conn.read_registers(device.unit_id, registers),
        )
        .await;

        match result {
            Ok(words) if words.len() == registers.len() => {
                slot.last_used = Instant::now();
                Ok(registers
                    .iter()
                    .zip(words)
                    .map(|(reg, w)| decode(reg, &w))
                    .collect())
            }
            Ok(words) => {
                slot.recycle().await;
                Err(ProtocolError::Transport(format!(
                    "expected {} values, device returned {}",
                    registers.len(),
                    words.len()
                )))
            }
            Err(e) => {
                tracing::debug!(device = %device, error = %e, "batch read failed, recycling connection");
                slot.recycle().await;
                Err(e)
            }
        }
    }

    /// Read registers one at a time. Returns one outcome per register.
    ///
    /// The endpoint stays locked for the whole sequence. Once the device is
    /// found unreachable the remaining registers are failed with the same
    /// error without further attempts.
    pub async fn sequential_read(
        &self,
        device: &DeviceAddress,
        registers: &[RegisterMapping],
        timeout: Duration,
    ) -> Vec<RegisterValue> {
        let endpoint = device.endpoint();
        let slot = self.slot(&endpoint);
        let mut slot = slot.lock().await;

        let mut out = Vec::with_capacity(registers.len());
        let mut unreachable: Option<ProtocolError> = None;

        for reg in registers {
            if let Some(e) = &unreachable {
                out.push(Err(e.clone()));
                continue;
            }

            if let Err(e) = self.ensure_connected(&mut slot, &endpoint, timeout).await {
                unreachable = Some(e.clone());
                out.push(Err(e));
                continue;
            }
            let Some(conn) = slot.conn.as_mut() else {
                out.push(Err(ProtocolError::Transport("connection unavailable".to_string())));
                continue;
            };

            let result = with_timeout(
                OperationKind::Sequential,
                timeout,
                conn.read_register(device.unit_id, reg),
            )
            .await;

            match result {
                Ok(words) => {
                    slot.last_used = Instant::now();
                    out.push(decode(reg, &words));
                }
                Err(e) => {
                    slot.recycle().await;
                    out.push(Err(e));
                }
            }
        }

        out
    }

    /// Make sure the slot holds a fresh connection, connecting with bounded
    /// linear backoff if needed.
    async fn ensure_connected(
        &self,
        slot: &mut Slot,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        if slot.conn.is_some() && slot.last_used.elapsed() > self.settings.idle_timeout {
            tracing::debug!(endpoint = %endpoint, "connection idle too long, reconnecting");
            slot.recycle().await;
        }
        if slot.conn.is_some() {
            return Ok(());
        }

        let attempts = self.settings.connect_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, self.transport.connect(endpoint)).await {
                Ok(r) => r,
                Err(_) => Err(ProtocolError::Transport(format!(
                    "connect timed out after {} ms",
                    timeout.as_millis()
                ))),
            };

            match result {
                Ok(conn) => {
                    slot.conn = Some(conn);
                    slot.last_used = Instant::now();
                    metrics::counter!("device_connections_opened_total").increment(1);
                    return Ok(());
                }
                Err(e @ ProtocolError::Unsupported(_)) => return Err(e),
                Err(e) if attempt < attempts => {
                    let sleep_for = self.settings.connect_backoff * attempt;
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        attempt,
                        "device connect failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    metrics::counter!("device_connect_failures_total").increment(1);
                    return Err(ProtocolError::Connection {
                        endpoint: endpoint.to_string(),
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Close connections idle for longer than the configured idle period.
    /// Slots in use are skipped.
    pub async fn evict_idle(&self) -> usize {
        let slots: Vec<_> = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.iter().map(|(e, s)| (e.clone(), s.clone())).collect()
        };

        let mut closed = 0;
        for (endpoint, slot) in slots {
            let Ok(mut slot) = slot.try_lock() else {
                continue;
            };
            if slot.conn.is_some() && slot.last_used.elapsed() > self.settings.idle_timeout {
                slot.recycle().await;
                closed += 1;
                tracing::debug!(endpoint = %endpoint, "closed idle device connection");
            }
        }
        closed
    }

    /// Close every connection, waiting for in-flight operations.
    pub async fn close_all(&self) {
        let slots: Vec<_> = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.values().cloned().collect()
        };
        for slot in slots {
            slot.lock().await.recycle().await;
        }
    }

    pub fn open_connections(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots
            .values()
            .filter(|s| s.try_lock().map(|s| s.conn.is_some()).unwrap_or(true))
            .count()
    }
}

async fn with_timeout<T, F>(operation: OperationKind, timeout: Duration, fut: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(ProtocolError::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn decode(register: &RegisterMapping, words: &[u16]) -> RegisterValue {
    register.decode(words).ok_or_else(|| ProtocolError::Decode {
        address: register.address,
        data_point: register.data_point.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sim::{registers, SimDevice, SimTransport};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            idle_timeout: Duration::from_secs(60),
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(200),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_read_decodes_and_reuses_the_connection() {
        let sim = SimTransport::new();
        let dev = sim.add(SimDevice::new("10.0.0.1"));
        let client = DeviceClient::new(sim.clone(), settings());
        let regs = registers(4);

        let first = client.batch_read(&dev, &regs, Duration::from_secs(5)).await.unwrap();
        let second = client.batch_read(&dev, &regs, Duration::from_secs(5)).await.unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(first[2], Ok(2.0));
        assert_eq!(first, second);
        assert_eq!(sim.connects(&dev), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_operation_and_recycles_connection() {
        let sim = SimTransport::new();
        let dev = sim.add(SimDevice::new("10.0.0.2").with_latency(Duration::from_secs(6)));
        let client = DeviceClient::new(sim.clone(), settings());
        let regs = registers(2);

        let err = client
            .batch_read(&dev, &regs, Duration::from_millis(5000))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Timeout {
                operation: OperationKind::Batch,
                timeout_ms: 5000
            }
        );
        assert_eq!(client.open_connections(), 0);

        let seq = client
            .sequential_read(&dev, &regs, Duration::from_millis(3000))
            .await;
        assert!(seq.iter().all(|r| matches!(
            r,
            Err(ProtocolError::Timeout { operation: OperationKind::Sequential, timeout_ms: 3000 })
        )));
        // one connect for the batch, then one per timed-out sequential read
        assert_eq!(sim.connects(&dev), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_retried_then_reported() {
        let sim = SimTransport::new();
        let dev = sim.add(SimDevice::new("10.0.0.3").unreachable());
        let client = DeviceClient::new(sim.clone(), settings());

        let started = Instant::now();
        let err = client
            .batch_read(&dev, &registers(3), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, ProtocolError::Connection { attempts: 3, .. }));
        assert_eq!(sim.connect_attempts(&dev), 3);
        // 200ms + 400ms of backoff between the three attempts
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(600) && waited < Duration::from_millis(700));

        let seq = client
            .sequential_read(&dev, &registers(3), Duration::from_secs(3))
            .await;
        assert!(seq.iter().all(|r| r.as_ref().unwrap_err().is_unreachable()));
        assert_eq!(sim.connect_attempts(&dev), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failures_are_per_register() {
        let sim = SimTransport::new();
        let dev = sim.add(SimDevice::new("10.0.0.4").garbled(1));
        let client = DeviceClient::new(sim.clone(), settings());

        let values = client
            .batch_read(&dev, &registers(3), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(values[0], Ok(0.0));
        assert!(matches!(values[1], Err(ProtocolError::Decode { address: 1, .. })));
        assert_eq!(values[2], Ok(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn access_to_one_endpoint_is_serialized() {
        let sim = SimTransport::new();
        let dev = sim.add(SimDevice::new("10.0.0.5").with_latency(Duration::from_millis(100)));
        let client = Arc::new(DeviceClient::new(sim.clone(), settings()));
        let regs = registers(2);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let client = client.clone();
            let dev = dev.clone();
            let regs = regs.clone();
            tasks.push(tokio::spawn(async move {
                client.batch_read(&dev, &regs, Duration::from_secs(5)).await
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }

        assert_eq!(sim.max_in_flight(&dev), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_evicted() {
        let sim = SimTransport::new();
        let dev = sim.add(SimDevice::new("10.0.0.6"));
        let client = DeviceClient::new(sim.clone(), settings());

        client.batch_read(&dev, &registers(1), Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(client.evict_idle().await, 1);
        assert_eq!(client.open_connections(), 0);

        client.batch_read(&dev, &registers(1), Duration::from_secs(5)).await.unwrap();
        assert_eq!(sim.connects(&dev), 2);
    }
}
