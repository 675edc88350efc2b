//! CSI camera frame input.
//!
//! Pulls frames from a camera sensor on a dedicated thread and hands them to
//! a periodically scheduled consumer, one frame per tick at most.
//!
//! # Architecture
//!
//! ```text
//! DeviceDriver ─► capture thread ─► FrameSlot ─► DrainTick ─► Emitter
//!                 (blocking reads)   (1 frame)   (host tick)
//! ```
//!
//! - `frame`: `Frame` and the single-slot `FrameSlot` mailbox
//! - `capture`: the capture thread and its backoff/cancellation protocol
//! - `drain`: the per-tick consumer
//! - `session`: init / pause / resume / exit
//! - `scheduler`: host scheduling surface and the `HostLoop` timer loop
//! - `device`: driver trait plus synthetic, channel, GStreamer and V4L2 drivers
//! - `emit`: downstream emitters
//! - `config`: settings loading and validation
//!
//! The handoff never queues: while a frame sits undrained the capture thread
//! skips device reads, so a slow consumer costs frames, not memory.

pub mod capture;
pub mod config;
pub mod device;
pub mod drain;
pub mod emit;
pub mod error;
pub mod frame;
pub mod scheduler;
pub mod session;
pub mod stats;

pub use capture::CaptureWorker;
pub use config::{CaptureConfig, CaptureSettings, DriverKind, TickInterval};
pub use device::{DeviceDriver, FrameDevice};
pub use drain::{DrainTick, TickOutcome};
pub use emit::{
    Emitter, FrameJsonEmitter, FrameRecord, InMemoryEmitter, JsonLinesEmitter, RecordTime,
};
pub use error::{PluginError, RegistrationError, ShutdownJoinError};
pub use frame::{Frame, FrameSlot};
pub use scheduler::{CollectorId, HostLoop, Scheduler, TickHandler};
pub use session::{CaptureSession, SessionState};
pub use stats::{SessionCounters, SessionStats};
