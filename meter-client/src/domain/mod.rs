pub mod meter;
pub mod reading;
pub mod register;
pub mod timeout_event;

pub use meter::{DeviceAddress, Endpoint, Meter, MeterKey, ProtocolKind};
pub use reading::{PendingReading, Quality, ReadSource, StoredReading};
pub use register::{DataType, RegisterMapping};
pub use timeout_event::{OperationKind, TimeoutEvent};

/// A stored value that does not match any known variant.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
