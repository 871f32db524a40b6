pub mod client;
pub mod modbus;
#[cfg(test)]
pub(crate) mod sim;

use meter_client::domain::{Endpoint, OperationKind, RegisterMapping};

pub use client::{BatchValues, DeviceClient, RegisterValue};
pub use modbus::ModbusTcpTransport;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("connection to {endpoint} failed after {attempts} attempt(s): {reason}")]
    Connection {
        endpoint: String,
        attempts: u32,
        reason: String,
    },
    #[error("{operation} read timed out after {timeout_ms} ms")]
    Timeout {
        operation: OperationKind,
        timeout_ms: u64,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cannot decode register {address} ({data_point})")]
    Decode { address: u16, data_point: String },
    #[error("protocol '{0}' has no transport")]
    Unsupported(&'static str),
}

impl ProtocolError {
    /// The device could not be reached at all; nothing else will succeed
    /// against it this cycle.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Unsupported(_))
    }
}

/// Opens connections to device endpoints of one or more protocols.
#[async_trait::async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DeviceConnection>, ProtocolError>;
}

/// A live connection. Implementations return raw register words; decoding
/// and scaling happen in the client.
#[async_trait::async_trait]
pub trait DeviceConnection: Send {
    /// Read all registers, in as few round trips as the protocol allows.
    /// Returns one word vector per register, in input order.
    async fn read_registers(
        &mut self,
        unit_id: u8,
        registers: &[RegisterMapping],
    ) -> Result<Vec<Vec<u16>>, ProtocolError>;

    /// Read a single register.
    async fn read_register(
        &mut self,
        unit_id: u8,
        register: &RegisterMapping,
    ) -> Result<Vec<u16>, ProtocolError> {
        let mut words = self
            .read_registers(unit_id, std::slice::from_ref(register))
            .await?;
        words
            .pop()
            .ok_or_else(|| ProtocolError::Transport("empty response".to_string()))
    }

    async fn close(&mut self) {}
}
