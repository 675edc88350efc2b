use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the capture thread and the drain tick.
#[derive(Debug, Default)]
pub struct SessionCounters {
    read_attempts: AtomicU64,
    captured: AtomicU64,
    read_failures: AtomicU64,
    skipped: AtomicU64,
    published: AtomicU64,
    ticks: AtomicU64,
    emitted: AtomicU64,
    emit_failures: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn read_attempt(&self) {
        self.read_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn emit_failure(&self) {
        self.emit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            read_attempts: self.read_attempts.load(Ordering::Relaxed),
            frames_captured: self.captured.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            captures_skipped: self.skipped.load(Ordering::Relaxed),
            frames_published: self.published.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            records_emitted: self.emitted.load(Ordering::Relaxed),
            emit_failures: self.emit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Device reads started by the capture thread.
    pub read_attempts: u64,
    /// Reads that returned a full-size frame.
    pub frames_captured: u64,
    /// Reads that failed, timed out or returned a short buffer.
    pub read_failures: u64,
    /// Iterations that skipped the device because the slot was still fresh.
    pub captures_skipped: u64,
    /// Frames accepted into the slot.
    pub frames_published: u64,
    /// Drain tick invocations.
    pub ticks: u64,
    /// Records handed to the emitter successfully.
    pub records_emitted: u64,
    /// Records the emitter refused.
    pub emit_failures: u64,
}
