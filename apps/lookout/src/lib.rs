pub mod api;
pub mod config;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod telemetry;
pub mod transport;
