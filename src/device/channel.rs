//! Channel-fed capture device.
//!
//! Lets another thread act as the sensor: whatever the `FrameFeeder` sends is
//! what the capture thread reads. The channel holds a single pending buffer,
//! like a camera pipeline configured to drop late frames.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use super::{DeviceDriver, FrameDevice};
use crate::config::CaptureConfig;

/// Create a connected feeder/driver pair.
pub fn channel() -> (FrameFeeder, ChannelDriver) {
    let (tx, rx) = mpsc::sync_channel(1);
    (FrameFeeder { tx }, ChannelDriver { rx: Some(rx) })
}

/// Sending half: supplies frame buffers to the device.
#[derive(Clone)]
pub struct FrameFeeder {
    tx: SyncSender<Vec<u8>>,
}

impl FrameFeeder {
    /// Offer a buffer without waiting. Returns false when the previous buffer
    /// has not been read yet (the new one is dropped) or the device is gone.
    pub fn offer(&self, data: Vec<u8>) -> bool {
        match self.tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Send a buffer, waiting for the device to take the previous one.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        self.tx
            .send(data)
            .map_err(|_| anyhow!("channel device has been released"))
    }
}

/// Driver whose single device reads from the paired `FrameFeeder`.
pub struct ChannelDriver {
    rx: Option<Receiver<Vec<u8>>>,
}

impl DeviceDriver for ChannelDriver {
    fn open(&mut self, config: &CaptureConfig) -> Result<Box<dyn FrameDevice>> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| anyhow!("channel device is already open"))?;
        log::info!(
            "ChannelDriver: opened sensor {} ({}x{})",
            config.sensor_id(),
            config.width(),
            config.height()
        );
        Ok(Box::new(ChannelDevice {
            sensor_id: config.sensor_id(),
            rx: Some(rx),
        }))
    }
}

struct ChannelDevice {
    sensor_id: i32,
    rx: Option<Receiver<Vec<u8>>>,
}

impl FrameDevice for ChannelDevice {
    fn describe(&self) -> String {
        format!("channel sensor {}", self.sensor_id)
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| anyhow!("channel device already released"))?;
        match rx.recv_timeout(timeout) {
            Ok(data) => Ok(Some(data)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("frame feeder disconnected")),
        }
    }

    fn release(&mut self) -> Result<()> {
        // Dropping the receiver makes further sends fail on the feeder side.
        self.rx = None;
        Ok(())
    }
}
