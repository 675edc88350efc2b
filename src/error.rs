//! Fatal startup errors.
//!
//! Only initialization can fail in a way the host sees. Runtime capture
//! failures are absorbed by the capture thread and show up as ticks with
//! nothing to drain.

use thiserror::Error;

/// Failure reported to the host when a capture session cannot start.
///
/// Every variant is fatal: the session is not created and anything acquired
/// before the failure (device, capture thread) has already been released.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to open capture device: {0:#}")]
    DeviceOpen(#[source] anyhow::Error),

    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("failed to register collector with host scheduler: {0}")]
    SchedulerRegistration(#[from] RegistrationError),
}

impl PluginError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PluginError::Configuration(msg.into())
    }
}

/// Why the host scheduler refused a collector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("collector interval must be greater than zero")]
    ZeroInterval,

    #[error("host scheduler is full ({0} collectors registered)")]
    CapacityExhausted(usize),
}

/// The capture thread could not be joined cleanly.
#[derive(Error, Debug)]
#[error("capture thread panicked: {reason}")]
pub struct ShutdownJoinError {
    pub reason: String,
}
