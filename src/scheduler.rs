//! Host-side periodic scheduling.
//!
//! The host owns a single scheduling context that fires registered collectors
//! at their interval. Collectors run inline on that context, one after the
//! other, so they must return quickly and never block.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::RegistrationError;

const DEFAULT_CAPACITY: usize = 64;

/// Callback fired by the host scheduler on every tick.
pub trait TickHandler: Send {
    fn on_tick(&mut self) -> Result<()>;

    /// A retired handler is never fired again and the host drops it.
    fn is_retired(&self) -> bool {
        false
    }
}

/// Identifies a registered collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CollectorId(u64);

/// Registration surface the host offers to inputs.
pub trait Scheduler {
    /// Fire `handler` every `interval`, starting one interval from now.
    fn register(
        &mut self,
        interval: Duration,
        handler: Box<dyn TickHandler>,
    ) -> Result<CollectorId, RegistrationError>;

    /// Stop firing `id`. Returns false if it is unknown or already paused.
    fn pause(&mut self, id: CollectorId) -> bool;

    /// Fire `id` again, one interval from now. Returns false if it is unknown
    /// or not paused.
    fn resume(&mut self, id: CollectorId) -> bool;

    /// Remove `id` and give its handler back.
    fn unregister(&mut self, id: CollectorId) -> Option<Box<dyn TickHandler>>;
}

struct Collector {
    id: CollectorId,
    interval: Duration,
    next_due: Instant,
    paused: bool,
    handler: Box<dyn TickHandler>,
}

/// Single-threaded timer loop driving registered collectors.
pub struct HostLoop {
    collectors: Vec<Collector>,
    capacity: usize,
    next_id: u64,
}

impl HostLoop {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A loop that refuses registrations beyond `capacity` collectors.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            collectors: Vec::new(),
            capacity,
            next_id: 1,
        }
    }

    /// Registered collectors, not counting retired ones awaiting pruning.
    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Some(paused)` for a registered collector, None otherwise.
    pub fn is_paused(&self, id: CollectorId) -> Option<bool> {
        self.find(id).map(|c| c.paused)
    }

    /// Drop every collector whose handler has retired.
    pub fn prune_retired(&mut self) -> usize {
        let before = self.collectors.len();
        self.collectors.retain(|c| {
            let retired = c.handler.is_retired();
            if retired {
                log::debug!("pruning retired collector {:?}", c.id);
            }
            !retired
        });
        before - self.collectors.len()
    }

    /// Fire every unpaused collector whose deadline is at or before `now`.
    /// Returns how many fired.
    ///
    /// A collector that fell more than one interval behind is re-armed from
    /// `now`; missed ticks are not replayed.
    pub fn run_due(&mut self, now: Instant) -> usize {
        self.prune_retired();
        let mut fired = 0;
        for collector in self.collectors.iter_mut() {
            if collector.paused || collector.next_due > now {
                continue;
            }
            fire(collector);
            fired += 1;
            collector.next_due += collector.interval;
            if collector.next_due <= now {
                collector.next_due = now + collector.interval;
            }
        }
        fired
    }

    /// Fire `id` right away, ignoring its deadline. Paused collectors are not
    /// fired. Returns whether the handler ran.
    pub fn fire_now(&mut self, id: CollectorId) -> bool {
        self.prune_retired();
        match self.find_mut(id) {
            Some(collector) if !collector.paused => {
                fire(collector);
                true
            }
            _ => false,
        }
    }

    /// Earliest deadline among unpaused collectors.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.live()
            .filter(|c| !c.paused)
            .map(|c| c.next_due)
            .min()
    }

    /// Run collectors until `stop` is set, sleeping between deadlines but
    /// never longer than `max_idle` so `stop` is noticed promptly.
    pub fn run_until(&mut self, stop: &AtomicBool, max_idle: Duration) {
        self.run_while(max_idle, || !stop.load(Ordering::SeqCst));
    }

    /// Run collectors for as long as `keep_going` returns true. It is called
    /// once per wakeup, after due collectors have fired, and at most
    /// `max_idle` apart.
    pub fn run_while<F>(&mut self, max_idle: Duration, mut keep_going: F)
    where
        F: FnMut() -> bool,
    {
        loop {
            let now = Instant::now();
            self.run_due(now);
            if !keep_going() {
                break;
            }
            let wake = self
                .next_deadline()
                .map(|deadline| deadline.min(now + max_idle))
                .unwrap_or(now + max_idle);
            let now = Instant::now();
            if wake > now {
                std::thread::sleep(wake - now);
            }
        }
    }

    fn live(&self) -> impl Iterator<Item = &Collector> {
        self.collectors.iter().filter(|c| !c.handler.is_retired())
    }

    fn find(&self, id: CollectorId) -> Option<&Collector> {
        self.live().find(|c| c.id == id)
    }

    fn find_mut(&mut self, id: CollectorId) -> Option<&mut Collector> {
        self.collectors
            .iter_mut()
            .find(|c| c.id == id && !c.handler.is_retired())
    }
}

impl Default for HostLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for HostLoop {
    fn register(
        &mut self,
        interval: Duration,
        handler: Box<dyn TickHandler>,
    ) -> Result<CollectorId, RegistrationError> {
        if interval.is_zero() {
            return Err(RegistrationError::ZeroInterval);
        }
        if self.collectors.len() >= self.capacity {
            return Err(RegistrationError::CapacityExhausted(self.collectors.len()));
        }
        let id = CollectorId(self.next_id);
        self.next_id += 1;
        self.collectors.push(Collector {
            id,
            interval,
            next_due: Instant::now() + interval,
            paused: false,
            handler,
        });
        Ok(id)
    }

    fn pause(&mut self, id: CollectorId) -> bool {
        match self.find_mut(id) {
            Some(collector) if !collector.paused => {
                collector.paused = true;
                true
            }
            _ => false,
        }
    }

    fn resume(&mut self, id: CollectorId) -> bool {
        match self.find_mut(id) {
            Some(collector) if collector.paused => {
                collector.paused = false;
                collector.next_due = Instant::now() + collector.interval;
                true
            }
            _ => false,
        }
    }

    fn unregister(&mut self, id: CollectorId) -> Option<Box<dyn TickHandler>> {
        let index = self.collectors.iter().position(|c| c.id == id)?;
        Some(self.collectors.remove(index).handler)
    }
}

fn fire(collector: &mut Collector) {
    if let Err(err) = collector.handler.on_tick() {
        log::warn!("collector {:?} tick failed: {:#}", collector.id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    impl TickHandler for Counting {
        fn on_tick(&mut self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> (Box<dyn TickHandler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Box::new(Counting(Arc::clone(&count))), count)
    }

    #[test]
    fn fires_only_when_due() -> Result<()> {
        let mut host = HostLoop::new();
        let (handler, count) = counting();
        host.register(Duration::from_millis(100), handler)?;

        let start = Instant::now();
        assert_eq!(host.run_due(start), 0);
        assert_eq!(host.run_due(start + Duration::from_millis(150)), 1);
        assert_eq!(host.run_due(start + Duration::from_millis(160)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn late_collector_does_not_burst() -> Result<()> {
        let mut host = HostLoop::new();
        let (handler, count) = counting();
        host.register(Duration::from_millis(10), handler)?;

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(host.run_due(later), 1);
        assert_eq!(host.run_due(later), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn paused_collector_is_skipped_until_resumed() -> Result<()> {
        let mut host = HostLoop::new();
        let (handler, count) = counting();
        let id = host.register(Duration::from_millis(10), handler)?;

        assert!(host.pause(id));
        assert!(!host.pause(id), "already paused");
        assert_eq!(host.is_paused(id), Some(true));
        assert!(!host.fire_now(id));
        assert_eq!(host.run_due(Instant::now() + Duration::from_secs(1)), 0);
        assert_eq!(host.next_deadline(), None);

        assert!(host.resume(id));
        assert!(!host.resume(id), "already running");
        assert!(host.fire_now(id));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn rejects_zero_interval_and_overflow() {
        let mut host = HostLoop::with_capacity(1);
        let (a, _) = counting();
        let (b, _) = counting();
        let (c, _) = counting();

        assert_eq!(
            host.register(Duration::ZERO, a).err(),
            Some(RegistrationError::ZeroInterval)
        );
        assert!(host.register(Duration::from_millis(5), b).is_ok());
        assert_eq!(
            host.register(Duration::from_millis(5), c).err(),
            Some(RegistrationError::CapacityExhausted(1))
        );
    }

    #[test]
    fn unregister_returns_handler() -> Result<()> {
        let mut host = HostLoop::new();
        let (handler, _) = counting();
        let id = host.register(Duration::from_millis(5), handler)?;

        assert!(host.unregister(id).is_some());
        assert!(host.unregister(id).is_none());
        assert!(host.is_empty());
        assert!(!host.fire_now(id));
        Ok(())
    }

    struct Retiring(Arc<AtomicBool>);

    impl TickHandler for Retiring {
        fn on_tick(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_retired(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn retired_collectors_are_pruned() -> Result<()> {
        let mut host = HostLoop::new();
        let retired = Arc::new(AtomicBool::new(false));
        let retiring = Box::new(Retiring(Arc::clone(&retired)));
        let gone = host.register(Duration::from_millis(5), retiring)?;
        let (handler, count) = counting();
        let kept = host.register(Duration::from_millis(5), handler)?;
        assert_eq!(host.len(), 2);

        retired.store(true, Ordering::SeqCst);
        assert_eq!(host.len(), 1);
        assert_eq!(host.is_paused(gone), None);
        assert!(!host.pause(gone));
        assert!(!host.fire_now(gone));

        assert_eq!(host.run_due(Instant::now() + Duration::from_secs(1)), 1);
        assert!(host.unregister(gone).is_none(), "already pruned");
        assert!(host.fire_now(kept));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn run_while_consults_hook_each_pass() -> Result<()> {
        let mut host = HostLoop::new();
        let (handler, count) = counting();
        host.register(Duration::from_millis(2), handler)?;

        let mut passes = 0;
        host.run_while(Duration::from_millis(5), || {
            passes += 1;
            passes < 10
        });

        assert_eq!(passes, 10);
        assert!(count.load(Ordering::SeqCst) >= 1);
        Ok(())
    }

    #[test]
    fn run_until_stops_on_flag() -> Result<()> {
        let mut host = HostLoop::new();
        let (handler, count) = counting();
        host.register(Duration::from_millis(5), handler)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stopper = Arc::clone(&stop);
        let timer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            stopper.store(true, Ordering::SeqCst);
        });
        host.run_until(&stop, Duration::from_millis(20));
        timer.join().expect("timer thread");

        assert!(count.load(Ordering::SeqCst) >= 2);
        Ok(())
    }
}
