//! Simulated time and the scheduled-event seam to the simulator kernel.
//!
//! The kernel itself is external; the engine only needs `now`, `schedule`
//! and `cancel`. `EventScheduler` is the minimal in-crate implementation the
//! tests (and any embedding without a full kernel) drive by popping events
//! in timestamp order.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    fmt::Display,
    ops::{Add, AddAssign, Sub},
};

use parking_lot::Mutex;

use crate::queue_pair::QpKey;

/// A point in simulated time, in nanoseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(pub u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_micros(us: f64) -> Self {
        SimTime((us * 1000.0) as u64)
    }

    pub fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    pub fn nanos(self) -> u64 {
        self.0
    }
}

impl From<u64> for SimTime {
    fn from(ns: u64) -> Self {
        SimTime(ns)
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Congestion-control timer events the engine schedules on the kernel.
///
/// Events carry the QP key rather than a QP reference so that a fired event
/// for a destroyed QP resolves to a no-op lookup instead of dangling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// DCQCN alpha EWMA update
    UpdateAlpha(QpKey),
    /// DCQCN rate decrease check
    CheckRateDecrease(QpKey),
    /// DCQCN rate increase step
    RateIncrease(QpKey),
}

impl TimerEvent {
    pub fn qp_key(self) -> QpKey {
        match self {
            TimerEvent::UpdateAlpha(k)
            | TimerEvent::CheckRateDecrease(k)
            | TimerEvent::RateIncrease(k) => k,
        }
    }
}

/// Handle to a scheduled event, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    time: SimTime,
    id: u64,
}

// BinaryHeap is a max-heap; invert so the earliest slot pops first.
// Ties fire in scheduling order.
impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct SchedulerInner {
    now: SimTime,
    next_id: u64,
    queue: BinaryHeap<Slot>,
    // Cancellation is lazy: a popped slot missing from `live` is skipped.
    live: HashMap<u64, TimerEvent>,
}

/// Timestamp-ordered event queue standing in for the simulator kernel.
#[derive(Debug, Default)]
pub struct EventScheduler {
    inner: Mutex<SchedulerInner>,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.inner.lock().now
    }

    /// Schedules `ev` to fire `delay` after the current time.
    pub fn schedule(&self, delay: SimTime, ev: TimerEvent) -> EventId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let time = inner.now + delay;
        inner.queue.push(Slot { time, id });
        inner.live.insert(id, ev);
        EventId(id)
    }

    /// Cancels a previously scheduled event. Unknown or already-fired ids
    /// are ignored.
    pub fn cancel(&self, id: EventId) {
        self.inner.lock().live.remove(&id.0);
    }

    /// Pops the earliest live event, advancing simulated time to it.
    pub fn pop(&self) -> Option<(SimTime, TimerEvent)> {
        let mut inner = self.inner.lock();
        while let Some(slot) = inner.queue.pop() {
            if let Some(ev) = inner.live.remove(&slot.id) {
                inner.now = slot.time;
                return Some((slot.time, ev));
            }
        }
        None
    }

    /// Advances simulated time without firing anything. Time never moves
    /// backwards.
    pub fn advance_to(&self, t: SimTime) {
        let mut inner = self.inner.lock();
        if t > inner.now {
            inner.now = t;
        }
    }

    /// Number of events still scheduled.
    pub fn pending(&self) -> usize {
        self.inner.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_time_order() {
        let sched = EventScheduler::new();
        let _a = sched.schedule(SimTime(30), TimerEvent::UpdateAlpha(1));
        let _b = sched.schedule(SimTime(10), TimerEvent::RateIncrease(2));
        let _c = sched.schedule(SimTime(20), TimerEvent::CheckRateDecrease(3));

        assert_eq!(sched.pop(), Some((SimTime(10), TimerEvent::RateIncrease(2))));
        assert_eq!(
            sched.pop(),
            Some((SimTime(20), TimerEvent::CheckRateDecrease(3)))
        );
        assert_eq!(sched.pop(), Some((SimTime(30), TimerEvent::UpdateAlpha(1))));
        assert_eq!(sched.pop(), None);
        assert_eq!(sched.now(), SimTime(30));
    }

    #[test]
    fn ties_fire_in_schedule_order() {
        let sched = EventScheduler::new();
        let _a = sched.schedule(SimTime(5), TimerEvent::UpdateAlpha(1));
        let _b = sched.schedule(SimTime(5), TimerEvent::UpdateAlpha(2));
        assert_eq!(sched.pop(), Some((SimTime(5), TimerEvent::UpdateAlpha(1))));
        assert_eq!(sched.pop(), Some((SimTime(5), TimerEvent::UpdateAlpha(2))));
    }

    #[test]
    fn cancelled_events_do_not_fire() {
        let sched = EventScheduler::new();
        let a = sched.schedule(SimTime(10), TimerEvent::UpdateAlpha(1));
        let _b = sched.schedule(SimTime(20), TimerEvent::RateIncrease(1));
        sched.cancel(a);
        assert_eq!(sched.pending(), 1);
        assert_eq!(sched.pop(), Some((SimTime(20), TimerEvent::RateIncrease(1))));
        assert_eq!(sched.pop(), None);
    }

    #[test]
    fn delays_stack_on_current_time() {
        let sched = EventScheduler::new();
        let _a = sched.schedule(SimTime(10), TimerEvent::UpdateAlpha(1));
        assert!(sched.pop().is_some());
        let _b = sched.schedule(SimTime(10), TimerEvent::UpdateAlpha(1));
        assert_eq!(sched.pop(), Some((SimTime(20), TimerEvent::UpdateAlpha(1))));
    }
}
