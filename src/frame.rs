//! Frames and the single-slot mailbox between the capture thread and the
//! drain tick.
//!
//! - `Frame`: one captured BGR image plus the instant it was captured.
//! - `FrameSlot`: holds at most one undrained frame. Publishing into a fresh
//!   slot is rejected, never queued and never overwritten.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// One captured frame. Pixel data is BGR, three bytes per pixel.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time, taken right after the device read returned.
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: SystemTime::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

struct SlotState {
    frame: Option<Frame>,
    fresh: bool,
}

/// Single-item mailbox shared by the capture thread and the drain tick.
///
/// `fresh` and the stored frame only change together under `state`'s lock.
/// The `fresh_hint` atomic mirrors the flag for the capture thread's
/// lock-free "consumer is behind" check; it is written only while the lock is
/// held, so it can lag but never disagree once the lock is released.
pub struct FrameSlot {
    state: Mutex<SlotState>,
    fresh_hint: AtomicBool,
}

impl FrameSlot {
    /// An empty slot, ready to accept the first capture.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                fresh: false,
            }),
            fresh_hint: AtomicBool::new(false),
        }
    }

    /// Store `frame` if the slot is not holding an undrained one.
    ///
    /// Returns false, dropping `frame`, when the previous frame has not been
    /// drained yet.
    #[must_use]
    pub fn try_publish(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if state.fresh {
            return false;
        }
        state.frame = Some(frame);
        state.fresh = true;
        self.fresh_hint.store(true, Ordering::Release);
        true
    }

    /// Take the undrained frame, if any. Draining an empty slot has no effect.
    pub fn try_drain(&self) -> Option<Frame> {
        let mut state = self.lock();
        if !state.fresh {
            return None;
        }
        state.fresh = false;
        self.fresh_hint.store(false, Ordering::Release);
        state.frame.take()
    }

    /// Lock-free peek at the freshness flag.
    pub fn is_fresh(&self) -> bool {
        self.fresh_hint.load(Ordering::Acquire)
    }

    /// Number of frames currently resident (0 or 1).
    pub fn resident(&self) -> usize {
        usize::from(self.lock().frame.is_some())
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere while holding the lock does not invalidate it.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 12], 2, 2)
    }

    #[test]
    fn publish_then_drain_hands_over_one_frame() {
        let slot = FrameSlot::new();
        assert!(!slot.is_fresh());

        assert!(slot.try_publish(frame(1)));
        assert!(slot.is_fresh());

        let drained = slot.try_drain().expect("frame available");
        assert_eq!(drained.data(), &[1u8; 12]);
        assert!(!slot.is_fresh());
        assert_eq!(slot.resident(), 0);
    }

    #[test]
    fn publish_into_fresh_slot_is_rejected() {
        let slot = FrameSlot::new();
        assert!(slot.try_publish(frame(1)));
        assert!(!slot.try_publish(frame(2)));

        // The first frame survives; the rejected one never overwrote it.
        assert_eq!(slot.try_drain().map(|f| f.data()[0]), Some(1));
    }

    #[test]
    fn draining_an_empty_slot_is_idempotent() {
        let slot = FrameSlot::new();
        for _ in 0..5 {
            assert!(slot.try_drain().is_none());
            assert!(!slot.is_fresh());
        }

        assert!(slot.try_publish(frame(3)));
        assert!(slot.try_drain().is_some());
        for _ in 0..5 {
            assert!(slot.try_drain().is_none());
        }
    }

    #[test]
    fn concurrent_handoff_never_duplicates_or_reorders() {
        const PUBLISH_ATTEMPTS: u32 = 20_000;

        let slot = Arc::new(FrameSlot::new());
        let producer_slot = Arc::clone(&slot);
        let producer = thread::spawn(move || {
            let mut published = Vec::new();
            for seq in 0..PUBLISH_ATTEMPTS {
                let data = seq.to_le_bytes().to_vec();
                if producer_slot.try_publish(Frame::new(data, 1, 1)) {
                    published.push(seq);
                }
                assert!(producer_slot.resident() <= 1);
            }
            published
        });

        let mut drained = Vec::new();
        while !producer.is_finished() || slot.is_fresh() {
            if let Some(frame) = slot.try_drain() {
                let bytes: [u8; 4] = frame.data().try_into().expect("4-byte payload");
                drained.push(u32::from_le_bytes(bytes));
            }
            assert!(slot.resident() <= 1);
        }
        let published = producer.join().expect("producer thread");
        if let Some(frame) = slot.try_drain() {
            let bytes: [u8; 4] = frame.data().try_into().expect("4-byte payload");
            drained.push(u32::from_le_bytes(bytes));
        }

        assert_eq!(drained, published);
        assert!(drained.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
