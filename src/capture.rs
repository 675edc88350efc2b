//! The capture thread.
//!
//! Device reads block, so they run on a dedicated thread that pulls frames as
//! fast as the slot frees up and publishes them into the `FrameSlot`. The
//! thread owns the device for its whole life and hands it back when joined.
//!
//! Per iteration:
//! 1. stop if exit was requested
//! 2. slot still fresh: skip the device, back off
//! 3. read with a bounded timeout; publish a full-size frame, back off on
//!    failure, loop straight away on success

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::CaptureConfig;
use crate::device::FrameDevice;
use crate::error::{PluginError, ShutdownJoinError};
use crate::frame::{Frame, FrameSlot};
use crate::stats::SessionCounters;

const THREAD_NAME: &str = "csi-capture";

/// Device waiting to be picked up by the capture thread.
type DeviceHandoff = Arc<Mutex<Option<Box<dyn FrameDevice>>>>;

/// Handle to a running capture thread.
pub struct CaptureWorker {
    exit_requested: Arc<AtomicBool>,
    /// Yields `None` only if the thread found the handoff already empty.
    join: JoinHandle<Option<Box<dyn FrameDevice>>>,
}

impl CaptureWorker {
    /// Move `device` onto a new capture thread.
    ///
    /// If the thread cannot be created the device is taken back and released
    /// before the error is returned.
    pub fn spawn(
        device: Box<dyn FrameDevice>,
        slot: Arc<FrameSlot>,
        config: &CaptureConfig,
        counters: Arc<SessionCounters>,
    ) -> Result<Self, PluginError> {
        let exit_requested = Arc::new(AtomicBool::new(false));
        let mut capture = CaptureLoop {
            slot,
            exit_requested: Arc::clone(&exit_requested),
            counters,
            width: config.width(),
            height: config.height(),
            frame_byte_size: config.frame_byte_size(),
            backoff: config.backoff_interval(),
            read_timeout: config.read_timeout(),
            failing: false,
        };

        let handoff: DeviceHandoff = Arc::new(Mutex::new(Some(device)));
        let thread_handoff = Arc::clone(&handoff);
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || -> Option<Box<dyn FrameDevice>> {
                let device = take_device(&thread_handoff)?;
                Some(capture.run(device))
            });
        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                release_unclaimed(&handoff);
                return Err(PluginError::ThreadSpawn(err));
            }
        };

        Ok(Self {
            exit_requested,
            join,
        })
    }

    /// Ask the thread to stop and cut any backoff sleep short.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
        self.join.thread().unpark();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request exit and wait for the thread, getting the device back.
    ///
    /// Waits without a timeout; an in-flight read finishes within the
    /// configured read timeout.
    pub fn stop(self) -> Result<Box<dyn FrameDevice>, ShutdownJoinError> {
        self.request_exit();
        match self.join.join() {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(ShutdownJoinError {
                reason: "capture thread started without a device".to_string(),
            }),
            Err(payload) => Err(ShutdownJoinError {
                reason: panic_reason(payload.as_ref()),
            }),
        }
    }
}

struct CaptureLoop {
    slot: Arc<FrameSlot>,
    exit_requested: Arc<AtomicBool>,
    counters: Arc<SessionCounters>,
    width: u32,
    height: u32,
    frame_byte_size: usize,
    backoff: Duration,
    read_timeout: Duration,
    /// Inside a streak of failed reads (for log de-duplication).
    failing: bool,
}

enum Attempt {
    Published,
    Skipped,
    Failed,
}

impl CaptureLoop {
    /// Runs until exit is requested and returns the device. If a read panics
    /// the device is dropped during unwinding.
    fn run(&mut self, mut device: Box<dyn FrameDevice>) -> Box<dyn FrameDevice> {
        log::info!("capture thread started for {}", device.describe());

        while !self.exit_requested() {
            match self.attempt(device.as_mut()) {
                Attempt::Published => {}
                Attempt::Skipped | Attempt::Failed => self.backoff(),
            }
        }

        log::info!("capture thread stopping for {}", device.describe());
        device
    }

    fn attempt(&mut self, device: &mut dyn FrameDevice) -> Attempt {
        // Consumer is behind; leave the device alone until the slot drains.
        if self.slot.is_fresh() {
            self.counters.skipped();
            return Attempt::Skipped;
        }

        self.counters.read_attempt();
        let failure = match device.read_frame(self.read_timeout) {
            Ok(Some(data)) if data.len() == self.frame_byte_size => {
                self.counters.captured();
                self.recovered();
                let frame = Frame::new(data, self.width, self.height);
                if self.slot.try_publish(frame) {
                    self.counters.published();
                    return Attempt::Published;
                }
                // Only reachable if something else published meanwhile.
                return Attempt::Skipped;
            }
            Ok(Some(data)) => format!(
                "frame has {} bytes, expected {}",
                data.len(),
                self.frame_byte_size
            ),
            Ok(None) => format!("no frame within {:?}", self.read_timeout),
            Err(err) => format!("{:#}", err),
        };

        self.counters.read_failure();
        if self.failing {
            log::debug!("capture retry failed: {}", failure);
        } else {
            log::warn!("capture failed, retrying every {:?}: {}", self.backoff, failure);
            self.failing = true;
        }
        Attempt::Failed
    }

    fn recovered(&mut self) {
        if self.failing {
            log::info!("capture recovered");
            self.failing = false;
        }
    }

    /// Sleep for the backoff interval, returning early once exit is
    /// requested. Spurious wakeups go back to sleep.
    fn backoff(&self) {
        let deadline = Instant::now() + self.backoff;
        while !self.exit_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }

    fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }
}

fn take_device(handoff: &Mutex<Option<Box<dyn FrameDevice>>>) -> Option<Box<dyn FrameDevice>> {
    handoff
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

/// Release a device the capture thread never picked up. Returns whether one
/// was there.
fn release_unclaimed(handoff: &Mutex<Option<Box<dyn FrameDevice>>>) -> bool {
    let Some(mut device) = take_device(handoff) else {
        return false;
    };
    let name = device.describe();
    if let Err(err) = device.release() {
        log::warn!("failed to release {}: {:#}", name, err);
    }
    true
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureSettings;
    use anyhow::{anyhow, Result};
    use std::sync::Mutex;

    /// Records when each read happened; fails or succeeds as scripted.
    struct ProbeDevice {
        reads: Arc<Mutex<Vec<Instant>>>,
        frame: Option<Vec<u8>>,
    }

    impl FrameDevice for ProbeDevice {
        fn describe(&self) -> String {
            "probe".to_string()
        }

        fn read_frame(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
            self.reads
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(Instant::now());
            match &self.frame {
                Some(frame) => Ok(Some(frame.clone())),
                None => Err(anyhow!("sensor not ready")),
            }
        }

        fn release(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn config(framerate: i64) -> CaptureConfig {
        CaptureSettings::new(2, 2, framerate)
            .validate()
            .expect("valid settings")
    }

    fn probe(frame: Option<Vec<u8>>) -> (Box<dyn FrameDevice>, Arc<Mutex<Vec<Instant>>>) {
        let reads = Arc::new(Mutex::new(Vec::new()));
        let device = ProbeDevice {
            reads: Arc::clone(&reads),
            frame,
        };
        (Box::new(device), reads)
    }

    #[test]
    fn failed_reads_are_spaced_by_backoff() -> Result<()> {
        let cfg = config(10);
        let (device, reads) = probe(None);
        let counters = Arc::new(SessionCounters::default());
        let slot = Arc::new(FrameSlot::new());
        let worker = CaptureWorker::spawn(device, Arc::clone(&slot), &cfg, Arc::clone(&counters))?;

        thread::sleep(Duration::from_millis(300));
        worker.stop()?;

        let reads = reads.lock().unwrap_or_else(|p| p.into_inner()).clone();
        assert!(reads.len() >= 2, "expected several retries, got {}", reads.len());
        for pair in reads.windows(2) {
            assert!(pair[1] - pair[0] >= cfg.backoff_interval());
        }
        assert_eq!(slot.resident(), 0);
        assert_eq!(counters.snapshot().read_failures, reads.len() as u64);
        Ok(())
    }

    #[test]
    fn fresh_slot_suppresses_device_reads() -> Result<()> {
        let cfg = config(10);
        let (device, reads) = probe(Some(vec![5; 12]));
        let counters = Arc::new(SessionCounters::default());
        let slot = Arc::new(FrameSlot::new());
        let worker = CaptureWorker::spawn(device, Arc::clone(&slot), &cfg, Arc::clone(&counters))?;

        thread::sleep(Duration::from_millis(200));
        worker.stop()?;

        // One read filled the slot; nothing drained it, so every later
        // iteration was skipped.
        assert_eq!(reads.lock().unwrap_or_else(|p| p.into_inner()).len(), 1);
        let stats = counters.snapshot();
        assert_eq!(stats.frames_published, 1);
        assert!(stats.captures_skipped >= 1);
        assert_eq!(slot.try_drain().map(|f| f.byte_len()), Some(12));
        Ok(())
    }

    #[test]
    fn wrong_sized_frames_are_not_published() -> Result<()> {
        let cfg = config(10);
        let (device, _reads) = probe(Some(vec![5; 3]));
        let counters = Arc::new(SessionCounters::default());
        let slot = Arc::new(FrameSlot::new());
        let worker = CaptureWorker::spawn(device, Arc::clone(&slot), &cfg, Arc::clone(&counters))?;

        thread::sleep(Duration::from_millis(100));
        worker.stop()?;

        assert!(!slot.is_fresh());
        assert_eq!(counters.snapshot().frames_published, 0);
        assert!(counters.snapshot().read_failures >= 1);
        Ok(())
    }

    #[test]
    fn exit_interrupts_backoff_sleep() -> Result<()> {
        // framerate 1: backoff is 400ms.
        let cfg = config(1);
        let (device, _reads) = probe(None);
        let worker = CaptureWorker::spawn(
            device,
            Arc::new(FrameSlot::new()),
            &cfg,
            Arc::new(SessionCounters::default()),
        )?;

        // Let the first read fail so the thread is inside its backoff.
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        worker.stop()?;

        assert!(started.elapsed() < cfg.backoff_interval());
        Ok(())
    }

    #[test]
    fn unclaimed_device_is_released_once() {
        struct Tracked(Arc<AtomicBool>);
        impl FrameDevice for Tracked {
            fn describe(&self) -> String {
                "tracked".to_string()
            }
            fn read_frame(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
                Ok(None)
            }
            fn release(&mut self) -> Result<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let handoff: Mutex<Option<Box<dyn FrameDevice>>> =
            Mutex::new(Some(Box::new(Tracked(Arc::clone(&released)))));

        assert!(release_unclaimed(&handoff));
        assert!(released.load(Ordering::SeqCst));
        assert!(!release_unclaimed(&handoff), "nothing left to release");
        assert!(take_device(&handoff).is_none());
    }

    #[test]
    fn panicking_device_reports_join_error() -> Result<()> {
        struct PanicDevice;
        impl FrameDevice for PanicDevice {
            fn describe(&self) -> String {
                "panics".to_string()
            }
            fn read_frame(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
                panic!("driver fault");
            }
            fn release(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let worker = CaptureWorker::spawn(
            Box::new(PanicDevice),
            Arc::new(FrameSlot::new()),
            &config(10),
            Arc::new(SessionCounters::default()),
        )?;
        while !worker.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }

        let err = worker.stop().err().expect("join should fail");
        assert!(err.reason.contains("driver fault"));
        Ok(())
    }
}
