//! Capture session lifecycle.
//!
//! ```text
//! init ──► Running ◄──► Paused
//!             │            │
//!             └──► exit ◄──┘   (signal, join, release device)
//! ```
//!
//! A session owns the device (through its capture thread), the frame slot
//! and the host registration of its drain tick. Pause and resume only touch
//! the registration; the capture thread keeps running and keeps the slot
//! topped up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::capture::CaptureWorker;
use crate::config::{CaptureConfig, CaptureSettings};
use crate::device::DeviceDriver;
use crate::drain::DrainTick;
use crate::emit::Emitter;
use crate::error::PluginError;
use crate::frame::FrameSlot;
use crate::scheduler::{CollectorId, Scheduler};
use crate::stats::{SessionCounters, SessionStats};

/// Whether the drain tick is currently being fired by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Paused,
}

pub struct CaptureSession {
    config: CaptureConfig,
    slot: Arc<FrameSlot>,
    counters: Arc<SessionCounters>,
    /// `None` once the capture thread has been stopped.
    worker: Option<CaptureWorker>,
    collector: CollectorId,
    /// Shared with the registered drain tick; set once the session ends.
    tick_retired: Arc<AtomicBool>,
    state: SessionState,
}

impl CaptureSession {
    /// Validate `settings`, open the device, start the capture thread and
    /// register the drain tick with `scheduler` at the tick interval.
    ///
    /// On failure nothing is left behind: a started capture thread is
    /// stopped and joined and the device is released before returning.
    pub fn init<D, S>(
        settings: &CaptureSettings,
        driver: &mut D,
        emitter: Box<dyn Emitter>,
        scheduler: &mut S,
    ) -> Result<Self, PluginError>
    where
        D: DeviceDriver + ?Sized,
        S: Scheduler + ?Sized,
    {
        let config = settings.validate().map_err(|err| {
            log::error!("{}", err);
            err
        })?;

        let device = driver.open(&config).map_err(|err| {
            log::error!("could not open sensor {}: {:#}", config.sensor_id(), err);
            PluginError::DeviceOpen(err)
        })?;
        log::info!(
            "opened {} ({}x{}, {} fps, {} bytes/frame)",
            device.describe(),
            config.width(),
            config.height(),
            config.framerate(),
            config.frame_byte_size()
        );

        let slot = Arc::new(FrameSlot::new());
        let counters = Arc::new(SessionCounters::default());
        let worker = CaptureWorker::spawn(device, Arc::clone(&slot), &config, Arc::clone(&counters))
            .map_err(|err| {
                log::error!("{}", err);
                err
            })?;

        let tick = DrainTick::new(Arc::clone(&slot), emitter, Arc::clone(&counters));
        let tick_retired = tick.retired_flag();
        let interval = config.tick_interval().as_duration();
        let collector = match scheduler.register(interval, Box::new(tick)) {
            Ok(id) => id,
            Err(err) => {
                log::error!("could not set collector for CSI camera input: {}", err);
                shutdown_worker(worker);
                return Err(err.into());
            }
        };
        log::info!(
            "collector registered every {:?}, capture backoff {:?}, read timeout {:?}",
            interval,
            config.backoff_interval(),
            config.read_timeout()
        );

        Ok(Self {
            config,
            slot,
            counters,
            worker: Some(worker),
            collector,
            tick_retired,
            state: SessionState::Running,
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The host registration of this session's drain tick.
    pub fn collector(&self) -> CollectorId {
        self.collector
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// True while a captured frame is waiting for the next tick.
    pub fn frame_pending(&self) -> bool {
        self.slot.is_fresh()
    }

    /// Stop the drain tick. Capture continues; frames that are not drained
    /// make the capture thread skip reads until resumed.
    ///
    /// Returns false, leaving the state unchanged, if the session is already
    /// paused or the host refused.
    pub fn pause<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) -> bool {
        if self.state == SessionState::Paused {
            return false;
        }
        if !scheduler.pause(self.collector) {
            log::warn!("host refused to pause collector {:?}", self.collector);
            return false;
        }
        self.state = SessionState::Paused;
        log::info!("CSI camera input paused");
        true
    }

    /// Fire the drain tick again. Same return contract as `pause`.
    pub fn resume<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) -> bool {
        if self.state == SessionState::Running {
            return false;
        }
        if !scheduler.resume(self.collector) {
            log::warn!("host refused to resume collector {:?}", self.collector);
            return false;
        }
        self.state = SessionState::Running;
        log::info!("CSI camera input resumed");
        true
    }

    /// Unregister the drain tick, stop and join the capture thread, release
    /// the device. Returns the final counters.
    ///
    /// A capture thread that panicked is logged; the session is still gone
    /// afterwards.
    pub fn exit<S: Scheduler + ?Sized>(mut self, scheduler: &mut S) -> SessionStats {
        self.tick_retired.store(true, Ordering::SeqCst);
        if scheduler.unregister(self.collector).is_none() {
            log::warn!("collector {:?} was already unregistered", self.collector);
        }
        if let Some(worker) = self.worker.take() {
            shutdown_worker(worker);
        }
        let stats = self.counters.snapshot();
        log::info!(
            "CSI camera input exited ({} captured, {} emitted)",
            stats.frames_captured,
            stats.records_emitted
        );
        stats
    }
}

/// Ending a session without `exit` still tears everything down: the drain
/// tick is retired (the host prunes it on its next pass) and the capture
/// thread is stopped and its device released.
impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.tick_retired.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            log::warn!("capture session dropped without exit; stopping capture thread");
            shutdown_worker(worker);
        }
    }
}

/// Stop the capture thread and release the device it hands back.
fn shutdown_worker(worker: CaptureWorker) {
    match worker.stop() {
        Ok(mut device) => {
            let name = device.describe();
            if let Err(err) = device.release() {
                log::warn!("failed to release {}: {:#}", name, err);
            }
        }
        Err(err) => {
            log::error!("error in image capture thread handling: {}", err);
        }
    }
}
