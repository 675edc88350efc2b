//! Downstream side of the drain tick.
//!
//! An `Emitter` receives one `FrameRecord` per drained frame. How the record
//! is packaged for transport is the emitter's business.

use anyhow::{Context, Result};
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::Frame;

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordTime {
    pub sec: u64,
    pub nsec: u32,
}

impl RecordTime {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        // Clocks set before 1970 collapse to the epoch.
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since_epoch.as_secs(),
            nsec: since_epoch.subsec_nanos(),
        }
    }
}

/// One drained frame, stamped at drain time.
#[derive(Debug)]
pub struct FrameRecord {
    /// When the drain tick emitted the record.
    pub timestamp: RecordTime,
    /// When the capture thread read the frame from the device.
    pub captured_at: RecordTime,
    pub width: u32,
    pub height: u32,
    pub frame: Vec<u8>,
}

impl FrameRecord {
    /// Stamp `frame` with the current time.
    pub fn stamp(frame: Frame) -> Self {
        let timestamp = RecordTime::now();
        let captured_at = RecordTime::from_system_time(frame.captured_at);
        let (width, height) = (frame.width, frame.height);
        Self {
            // A wall-clock step backwards must not produce a record that
            // predates its own capture.
            timestamp: timestamp.max(captured_at),
            captured_at,
            width,
            height,
            frame: frame.into_data(),
        }
    }

    /// SHA-256 of the frame bytes, hex encoded.
    pub fn digest_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.frame))
    }
}

/// Hands drained frames to the packaging/transport layer.
pub trait Emitter: Send {
    fn emit(&mut self, record: FrameRecord) -> Result<()>;
}

#[derive(Serialize)]
struct RecordSummary<'a> {
    timestamp: RecordTime,
    captured_at: RecordTime,
    frame: FrameSummary<'a>,
}

#[derive(Serialize)]
struct FrameSummary<'a> {
    width: u32,
    height: u32,
    bytes: usize,
    sha256: &'a str,
}

/// Writes one JSON object per record: timestamps plus frame size and digest.
///
/// Pixel data is never written; the digest is enough to correlate records
/// with frames stored elsewhere.
pub struct JsonLinesEmitter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Emitter for JsonLinesEmitter<W> {
    fn emit(&mut self, record: FrameRecord) -> Result<()> {
        let digest = record.digest_hex();
        let summary = RecordSummary {
            timestamp: record.timestamp,
            captured_at: record.captured_at,
            frame: FrameSummary {
                width: record.width,
                height: record.height,
                bytes: record.frame.len(),
                sha256: &digest,
            },
        };
        serde_json::to_writer(&mut self.out, &summary).context("serialize frame record")?;
        self.out.write_all(b"\n").context("write frame record")?;
        self.out.flush().context("flush frame record")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct FramePayload {
    frame: String,
}

/// Writes one JSON array per record, `[timestamp, {"frame": <pixels>}]`,
/// with the pixel bytes base64 encoded.
///
/// This is the record a downstream consumer works from; nothing of the frame
/// is left out.
pub struct FrameJsonEmitter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> FrameJsonEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Emitter for FrameJsonEmitter<W> {
    fn emit(&mut self, record: FrameRecord) -> Result<()> {
        let payload = FramePayload {
            frame: base64::engine::general_purpose::STANDARD.encode(&record.frame),
        };
        serde_json::to_writer(&mut self.out, &(record.timestamp, payload))
            .context("serialize frame record")?;
        self.out.write_all(b"\n").context("write frame record")?;
        self.out.flush().context("flush frame record")?;
        Ok(())
    }
}

/// Keeps every record in memory. Clones share the same storage, so a clone
/// can be handed to a session while the original is used to inspect output.
#[derive(Clone, Default)]
pub struct InMemoryEmitter {
    records: Arc<Mutex<Vec<FrameRecord>>>,
}

impl InMemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return everything emitted so far.
    pub fn take(&self) -> Vec<FrameRecord> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FrameRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Emitter for InMemoryEmitter {
    fn emit(&mut self, record: FrameRecord) -> Result<()> {
        self.lock().push(record);
        Ok(())
    }
}
