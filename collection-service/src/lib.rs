pub mod catalog;
pub mod collector;
pub mod config;
pub mod context;
pub mod metrics_server;
pub mod observability;
pub mod protocol;
pub mod scheduler;
pub mod sinks;
pub mod status;
pub mod sync;
pub mod telemetry;
pub mod transform;

pub use context::ServiceContext;
pub use scheduler::Scheduler;
