use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use meter_client::domain::{DataType, DeviceAddress, Endpoint, ProtocolKind, RegisterMapping};

use super::{DeviceConnection, DeviceTransport, ProtocolError};

/// `n` single-word registers at addresses `0..n`; each reads back its own
/// address.
pub(crate) fn registers(n: u16) -> Vec<RegisterMapping> {
    (0..n)
        .map(|a| RegisterMapping {
            address: a,
            data_point: format!("point_{a}"),
            data_type: DataType::U16,
            scale: 1.0,
            unit: "kWh".to_string(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub(crate) struct SimDevice {
    host: String,
    unit_id: u8,
    latency: Duration,
    slow_above: Option<(usize, Duration)>,
    unreachable: bool,
    garbled: HashSet<u16>,
}

impl SimDevice {
    pub(crate) fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            unit_id: 1,
            latency: Duration::from_millis(10),
            slow_above: None,
            unreachable: false,
            garbled: HashSet::new(),
        }
    }

    pub(crate) fn unit(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// Latency of every request.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Batches of more than `limit` registers take `latency`.
    pub(crate) fn slow_above(mut self, limit: usize, latency: Duration) -> Self {
        self.slow_above = Some((limit, latency));
        self
    }

    pub(crate) fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Register at `address` answers with a malformed value.
    pub(crate) fn garbled(mut self, address: u16) -> Self {
        self.garbled.insert(address);
        self
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: 502,
            protocol: ProtocolKind::Modbus,
        }
    }

    fn address(&self) -> DeviceAddress {
        DeviceAddress {
            host: self.host.clone(),
            port: 502,
            protocol: ProtocolKind::Modbus,
            unit_id: self.unit_id,
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    device: SimDevice,
    connects: usize,
    connect_attempts: usize,
    in_flight: usize,
    max_in_flight: usize,
    batch_sizes: Vec<usize>,
    single_reads: usize,
}

type Devices = Arc<Mutex<HashMap<Endpoint, DeviceState>>>;

#[derive(Default)]
pub(crate) struct SimTransport {
    devices: Devices,
}

impl SimTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a device. A second unit on an existing endpoint sits behind the
    /// same gateway and shares its behavior and counters.
    pub(crate) fn add(&self, device: SimDevice) -> DeviceAddress {
        let address = device.address();
        self.devices
            .lock()
            .unwrap()
            .entry(device.endpoint())
            .or_insert_with(|| DeviceState {
                device,
                connects: 0,
                connect_attempts: 0,
                in_flight: 0,
                max_in_flight: 0,
                batch_sizes: Vec::new(),
                single_reads: 0,
            });
        address
    }

    fn with_state<T>(&self, dev: &DeviceAddress, f: impl FnOnce(&DeviceState) -> T) -> T {
        let devices = self.devices.lock().unwrap();
        f(devices.get(&dev.endpoint()).expect("unknown sim device"))
    }

    pub(crate) fn connects(&self, dev: &DeviceAddress) -> usize {
        self.with_state(dev, |s| s.connects)
    }

    pub(crate) fn connect_attempts(&self, dev: &DeviceAddress) -> usize {
        self.with_state(dev, |s| s.connect_attempts)
    }

    pub(crate) fn max_in_flight(&self, dev: &DeviceAddress) -> usize {
        self.with_state(dev, |s| s.max_in_flight)
    }

    /// Sizes of every batch request, in order.
    pub(crate) fn batch_sizes(&self, dev: &DeviceAddress) -> Vec<usize> {
        self.with_state(dev, |s| s.batch_sizes.clone())
    }

    pub(crate) fn single_reads(&self, dev: &DeviceAddress) -> usize {
        self.with_state(dev, |s| s.single_reads)
    }
}

#[async_trait::async_trait]
impl DeviceTransport for SimTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DeviceConnection>, ProtocolError> {
        let mut devices = self.devices.lock().unwrap();
        let state = devices
            .get_mut(endpoint)
            .ok_or_else(|| ProtocolError::Transport(format!("no route to {endpoint}")))?;
        state.connect_attempts += 1;
        if state.device.unreachable {
            return Err(ProtocolError::Transport("connection refused".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(SimConnection {
            endpoint: endpoint.clone(),
            devices: self.devices.clone(),
        }))
    }
}

struct SimConnection {
    endpoint: Endpoint,
    devices: Devices,
}

/// Decrements the in-flight count even when the request future is dropped
/// by a timeout.
struct InFlight {
    endpoint: Endpoint,
    devices: Devices,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(s) = self.devices.lock().unwrap().get_mut(&self.endpoint) {
            s.in_flight -= 1;
        }
    }
}

impl SimConnection {
    fn begin(&self, registers: &[RegisterMapping], single: bool) -> (InFlight, Duration, Vec<Vec<u16>>) {
        let mut devices = self.devices.lock().unwrap();
        let state = devices.get_mut(&self.endpoint).expect("unknown sim device");
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        if single {
            state.single_reads += 1;
        } else {
            state.batch_sizes.push(registers.len());
        }

        let latency = match state.device.slow_above {
            Some((limit, slow)) if !single && registers.len() > limit => slow,
            _ => state.device.latency,
        };
        let words = registers
            .iter()
            .map(|r| {
                if state.device.garbled.contains(&r.address) {
                    Vec::new()
                } else {
                    vec![r.address; r.data_type.word_count() as usize]
                }
            })
            .collect();

        let guard = InFlight {
            endpoint: self.endpoint.clone(),
            devices: self.devices.clone(),
        };
        (guard, latency, words)
    }
}

#[async_trait::async_trait]
impl DeviceConnection for SimConnection {
    async fn read_registers(
        &mut self,
        _unit_id: u8,
        registers: &[RegisterMapping],
    ) -> Result<Vec<Vec<u16>>, ProtocolError> {
        let (_guard, latency, words) = self.begin(registers, false);
        tokio::time::sleep(latency).await;
        Ok(words)
    }

    async fn read_register(
        &mut self,
        _unit_id: u8,
        register: &RegisterMapping,
    ) -> Result<Vec<u16>, ProtocolError> {
        let (_guard, latency, mut words) = self.begin(std::slice::from_ref(register), true);
        tokio::time::sleep(latency).await;
        Ok(words.pop().unwrap_or_default())
    }
}
