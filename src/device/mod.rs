//! Capture device drivers.
//!
//! A `DeviceDriver` opens a `FrameDevice` for one session. The device is then
//! moved onto the capture thread and is touched by nothing else until the
//! thread hands it back at shutdown.
//!
//! Drivers:
//! - `SyntheticDriver`: generated frames, optional injected failures
//! - `ChannelDriver`: frames fed from another thread
//! - `GstreamerDriver`: Jetson CSI sensor (feature: gstreamer-csi)
//! - `V4l2Driver`: local V4L2 device (feature: ingest-v4l2)
//!
//! Drivers MUST NOT:
//! - Retain frames after returning them from `read_frame`
//! - Log frame content

use anyhow::Result;
use std::time::Duration;

use crate::config::{CaptureConfig, DriverKind};

pub mod channel;
pub mod format;
#[cfg(feature = "gstreamer-csi")]
pub mod gstreamer;
pub mod pipeline;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use channel::{ChannelDriver, FrameFeeder};
#[cfg(feature = "gstreamer-csi")]
pub use gstreamer::GstreamerDriver;
pub use synthetic::{SyntheticDriver, SyntheticOptions};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Driver;

/// Opens capture devices.
pub trait DeviceDriver {
    /// Open the sensor described by `config`. Failure is fatal for the
    /// session being initialized.
    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn FrameDevice>>;
}

/// An open capture device, exclusively owned by one session.
pub trait FrameDevice: Send {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// Block until the next frame is available or `timeout` elapses.
    ///
    /// `Ok(None)` means no frame arrived in time. Errors are treated by the
    /// caller as transient and retried.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Release the underlying device. Called once, after the capture thread
    /// has stopped.
    fn release(&mut self) -> Result<()>;
}

/// Build the driver selected in configuration.
pub fn driver_for(kind: DriverKind) -> Result<Box<dyn DeviceDriver>> {
    match kind {
        DriverKind::Synthetic => Ok(Box::new(SyntheticDriver::new(SyntheticOptions::default()))),
        DriverKind::Gstreamer => {
            #[cfg(feature = "gstreamer-csi")]
            {
                Ok(Box::new(GstreamerDriver::new()))
            }
            #[cfg(not(feature = "gstreamer-csi"))]
            {
                anyhow::bail!("the gstreamer driver requires the gstreamer-csi feature")
            }
        }
        DriverKind::V4l2 => {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Box::new(V4l2Driver::new()))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!("the v4l2 driver requires the ingest-v4l2 feature")
            }
        }
    }
}
