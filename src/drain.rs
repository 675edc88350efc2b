//! The drain tick: consumer half of the frame handoff.
//!
//! Runs on the host's scheduling context. Each tick takes at most one frame
//! out of the slot, stamps it and hands it to the emitter. Nothing here
//! blocks beyond the slot lock, which the capture thread only holds for a
//! pointer swap.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::emit::{Emitter, FrameRecord};
use crate::frame::FrameSlot;
use crate::scheduler::TickHandler;
use crate::stats::SessionCounters;

/// What a single tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// One record was handed to the emitter.
    Emitted,
    /// The slot held nothing undrained.
    Idle,
    /// A frame was drained but the emitter refused it; the frame is gone.
    Dropped,
    /// The owning session is gone; nothing was drained.
    Retired,
}

pub struct DrainTick {
    slot: Arc<FrameSlot>,
    emitter: Box<dyn Emitter>,
    counters: Arc<SessionCounters>,
    retired: Arc<AtomicBool>,
}

impl DrainTick {
    pub fn new(
        slot: Arc<FrameSlot>,
        emitter: Box<dyn Emitter>,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            slot,
            emitter,
            counters,
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that, once set, stops this tick for good. The session keeps it
    /// so a tick can be retired after it has been handed to the host.
    pub fn retired_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.retired)
    }

    /// Drain the slot once. Never fails: an empty slot is the normal case
    /// and an emitter error only costs this frame.
    pub fn collect(&mut self) -> TickOutcome {
        if self.retired.load(Ordering::SeqCst) {
            return TickOutcome::Retired;
        }
        self.counters.tick();
        let Some(frame) = self.slot.try_drain() else {
            return TickOutcome::Idle;
        };

        let record = FrameRecord::stamp(frame);
        match self.emitter.emit(record) {
            Ok(()) => {
                self.counters.emitted();
                TickOutcome::Emitted
            }
            Err(err) => {
                self.counters.emit_failure();
                log::warn!("dropping frame, emitter failed: {:#}", err);
                TickOutcome::Dropped
            }
        }
    }
}

impl TickHandler for DrainTick {
    fn on_tick(&mut self) -> Result<()> {
        self.collect();
        Ok(())
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::InMemoryEmitter;
    use crate::frame::Frame;
    use anyhow::anyhow;

    struct RefusingEmitter;

    impl Emitter for RefusingEmitter {
        fn emit(&mut self, _record: FrameRecord) -> Result<()> {
            Err(anyhow!("downstream full"))
        }
    }

    fn setup(emitter: Box<dyn Emitter>) -> (DrainTick, Arc<FrameSlot>, Arc<SessionCounters>) {
        let slot = Arc::new(FrameSlot::new());
        let counters = Arc::new(SessionCounters::default());
        let tick = DrainTick::new(Arc::clone(&slot), emitter, Arc::clone(&counters));
        (tick, slot, counters)
    }

    #[test]
    fn empty_slot_emits_nothing() {
        let emitter = InMemoryEmitter::new();
        let (mut tick, _slot, counters) = setup(Box::new(emitter.clone()));

        for _ in 0..10 {
            assert_eq!(tick.collect(), TickOutcome::Idle);
        }
        assert!(emitter.is_empty());
        assert_eq!(counters.snapshot().ticks, 10);
        assert_eq!(counters.snapshot().records_emitted, 0);
    }

    #[test]
    fn one_frame_is_emitted_exactly_once() {
        let emitter = InMemoryEmitter::new();
        let (mut tick, slot, counters) = setup(Box::new(emitter.clone()));

        assert!(slot.try_publish(Frame::new(vec![4; 12], 2, 2)));
        assert_eq!(tick.collect(), TickOutcome::Emitted);
        assert!(!slot.is_fresh());
        assert_eq!(tick.collect(), TickOutcome::Idle);

        let records = emitter.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frame, vec![4; 12]);
        assert_eq!((records[0].width, records[0].height), (2, 2));
        assert_eq!(counters.snapshot().records_emitted, 1);
    }

    #[test]
    fn retired_tick_leaves_the_slot_alone() {
        let emitter = InMemoryEmitter::new();
        let (mut tick, slot, counters) = setup(Box::new(emitter.clone()));
        let retired = tick.retired_flag();

        assert!(slot.try_publish(Frame::new(vec![2; 12], 2, 2)));
        retired.store(true, Ordering::SeqCst);

        assert!(tick.is_retired());
        assert_eq!(tick.collect(), TickOutcome::Retired);
        assert!(slot.is_fresh());
        assert!(emitter.is_empty());
        assert_eq!(counters.snapshot().ticks, 0);
    }

    #[test]
    fn emitter_failure_consumes_frame_without_error() -> Result<()> {
        let (mut tick, slot, counters) = setup(Box::new(RefusingEmitter));

        assert!(slot.try_publish(Frame::new(vec![1; 12], 2, 2)));
        tick.on_tick()?;

        assert!(!slot.is_fresh(), "slot must free up for the next capture");
        assert_eq!(counters.snapshot().emit_failures, 1);
        assert_eq!(tick.collect(), TickOutcome::Idle);
        Ok(())
    }
}
