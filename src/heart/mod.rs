//! Heartbeat fabric.
//!
//! Outbound: one [`Heart`] per peer keeps a WebSocket open and sends an
//! empty frame per beat, reconnecting forever on errors. Inbound beats land
//! in the process-local [`StatusTable`], from which liveness is read.

pub mod beat;
pub mod status;

pub use beat::Heart;
pub use status::{ConnectionStatus, StatusTable};
