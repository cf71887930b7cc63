//! Timer service: delayed and periodic message delivery.
//!
//! Three engines share one interface: a hashed timer wheel, a binary heap
//! and a sorted list. One timer thread owns the chosen engine and delivers
//! due messages through `deliver_from_timer`, which never blocks (a full
//! mchain surfaces as a dropped delivery). A panic on the timer thread is
//! unrecoverable: it is logged and the process aborts.

use crate::error::{Error, Result};
use crate::mbox::MboxRef;
use crate::message::MessageRef;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Engine selection, made in environment params.
#[derive(Debug, Clone, Copy)]
pub enum TimerEngineKind {
    /// Hashed wheel; best for very many timers of similar horizon.
    Wheel {
        wheel_size: usize,
        granularity: Duration,
    },
    /// Binary heap; a good general-purpose default.
    Heap,
    /// Sorted list; best for few timers with monotone delays.
    List,
}

impl Default for TimerEngineKind {
    fn default() -> Self {
        TimerEngineKind::Wheel {
            wheel_size: 512,
            granularity: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimerStats {
    pub single_shot: usize,
    pub periodic: usize,
}

struct TimerHandle {
    active: AtomicBool,
}

/// Cancellation handle of a scheduled timer.
///
/// Dropping the last clone cancels the timer: a pending entry only fires
/// while at least one id is alive. Use [`TimerId::release`] to cancel
/// explicitly.
#[derive(Clone)]
pub struct TimerId {
    handle: Arc<TimerHandle>,
}

impl TimerId {
    pub fn release(&self) {
        self.handle.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.handle.active.load(Ordering::Acquire)
    }
}

enum TimerRef {
    /// Anonymous single-shot timer keeps itself alive.
    Owned(Arc<TimerHandle>),
    /// Cancellable timer; dies with its last `TimerId`.
    Shared(Weak<TimerHandle>),
}

struct TimerEntry {
    live: TimerRef,
    mbox: MboxRef,
    message: MessageRef,
    at: Instant,
    period: Option<Duration>,
}

impl TimerEntry {
    fn is_live(&self) -> bool {
        match &self.live {
            TimerRef::Owned(handle) => handle.active.load(Ordering::Acquire),
            TimerRef::Shared(weak) => weak
                .upgrade()
                .map(|handle| handle.active.load(Ordering::Acquire))
                .unwrap_or(false),
        }
    }
}

trait TimerEngine: Send {
    fn add(&mut self, entry: TimerEntry);
    fn nearest(&self) -> Option<Instant>;
    fn take_due(&mut self, now: Instant, out: &mut Vec<TimerEntry>);
    fn counts(&self) -> TimerStats;
}

struct WheelEngine {
    start: Instant,
    granularity: Duration,
    slots: Vec<Vec<(u64, TimerEntry)>>,
    /// Next tick to be processed.
    cursor: u64,
    len: usize,
}

impl WheelEngine {
    fn new(wheel_size: usize, granularity: Duration) -> Self {
        let wheel_size = wheel_size.max(2);
        Self {
            start: Instant::now(),
            granularity: granularity.max(Duration::from_millis(1)),
            slots: (0..wheel_size).map(|_| Vec::new()).collect(),
            cursor: 0,
            len: 0,
        }
    }

    fn tick_of(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.start);
        (elapsed.as_nanos() / self.granularity.as_nanos().max(1)) as u64
    }
}

impl TimerEngine for WheelEngine {
    fn add(&mut self, entry: TimerEntry) {
        let tick = self.tick_of(entry.at).max(self.cursor);
        let slot = (tick % self.slots.len() as u64) as usize;
        self.slots[slot].push((tick, entry));
        self.len += 1;
    }

    fn nearest(&self) -> Option<Instant> {
        if self.len == 0 {
            return None;
        }
        let mut best: Option<u64> = None;
        for slot in &self.slots {
            for (tick, _) in slot {
                if best.map(|b| *tick < b).unwrap_or(true) {
                    best = Some(*tick);
                }
            }
        }
        best.map(|tick| {
            let offset_ns = self.granularity.as_nanos() as u64 * tick;
            self.start + Duration::from_nanos(offset_ns)
        })
    }

    fn take_due(&mut self, now: Instant, out: &mut Vec<TimerEntry>) {
        let now_tick = self.tick_of(now);
        while self.cursor <= now_tick {
            let slot = (self.cursor % self.slots.len() as u64) as usize;
            let mut idx = 0;
            while idx < self.slots[slot].len() {
                if self.slots[slot][idx].0 <= now_tick {
                    let (_, entry) = self.slots[slot].swap_remove(idx);
                    out.push(entry);
                    self.len -= 1;
                } else {
                    idx += 1;
                }
            }
            self.cursor += 1;
        }
    }

    fn counts(&self) -> TimerStats {
        let mut stats = TimerStats::default();
        for slot in &self.slots {
            for (_, entry) in slot {
                if entry.period.is_some() {
                    stats.periodic += 1;
                } else {
                    stats.single_shot += 1;
                }
            }
        }
        stats
    }
}

struct HeapItem {
    at: Instant,
    seq: u64,
    entry: TimerEntry,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline wins.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct HeapEngine {
    heap: BinaryHeap<HeapItem>,
    seq: u64,
}

impl TimerEngine for HeapEngine {
    fn add(&mut self, entry: TimerEntry) {
        self.seq += 1;
        self.heap.push(HeapItem {
            at: entry.at,
            seq: self.seq,
            entry,
        });
    }

    fn nearest(&self) -> Option<Instant> {
        self.heap.peek().map(|item| item.at)
    }

    fn take_due(&mut self, now: Instant, out: &mut Vec<TimerEntry>) {
        while let Some(item) = self.heap.peek() {
            if item.at > now {
                break;
            }
            let item = self.heap.pop().expect("peeked item exists");
            out.push(item.entry);
        }
    }

    fn counts(&self) -> TimerStats {
        let mut stats = TimerStats::default();
        for item in self.heap.iter() {
            if item.entry.period.is_some() {
                stats.periodic += 1;
            } else {
                stats.single_shot += 1;
            }
        }
        stats
    }
}

#[derive(Default)]
struct ListEngine {
    entries: VecDeque<TimerEntry>,
}

impl TimerEngine for ListEngine {
    fn add(&mut self, entry: TimerEntry) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.at > entry.at)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    fn nearest(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.at)
    }

    fn take_due(&mut self, now: Instant, out: &mut Vec<TimerEntry>) {
        while let Some(front) = self.entries.front() {
            if front.at > now {
                break;
            }
            out.push(self.entries.pop_front().expect("front exists"));
        }
    }

    fn counts(&self) -> TimerStats {
        let mut stats = TimerStats::default();
        for entry in &self.entries {
            if entry.period.is_some() {
                stats.periodic += 1;
            } else {
                stats.single_shot += 1;
            }
        }
        stats
    }
}

impl TimerEngineKind {
    fn create(self) -> Box<dyn TimerEngine> {
        match self {
            TimerEngineKind::Wheel {
                wheel_size,
                granularity,
            } => Box::new(WheelEngine::new(wheel_size, granularity)),
            TimerEngineKind::Heap => Box::new(HeapEngine::default()),
            TimerEngineKind::List => Box::new(ListEngine::default()),
        }
    }
}

struct TimerInner {
    engine: Box<dyn TimerEngine>,
    stopped: bool,
}

struct TimerShared {
    inner: Mutex<TimerInner>,
    signal: Condvar,
}

pub(crate) struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub(crate) fn start(kind: TimerEngineKind) -> Self {
        let shared = Arc::new(TimerShared {
            inner: Mutex::new(TimerInner {
                engine: kind.create(),
                stopped: false,
            }),
            signal: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("conclave-timer".to_string())
            .spawn(move || timer_thread(thread_shared))
            .expect("cannot start timer thread");
        Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// Schedules a delayed (and optionally periodic) delivery. The timer
    /// stays pending only while the returned id is alive.
    pub(crate) fn schedule(
        &self,
        mbox: MboxRef,
        message: MessageRef,
        delay: Duration,
        period: Option<Duration>,
    ) -> Result<TimerId> {
        if period.is_some() && message.is_mutable() {
            return Err(Error::MutablePeriodic);
        }
        let handle = Arc::new(TimerHandle {
            active: AtomicBool::new(true),
        });
        self.add_entry(TimerEntry {
            live: TimerRef::Shared(Arc::downgrade(&handle)),
            mbox,
            message,
            at: Instant::now() + delay,
            period: period.filter(|p| !p.is_zero()),
        })?;
        Ok(TimerId { handle })
    }

    /// Fire-and-forget single delivery; no cancellation id.
    pub(crate) fn single_shot(
        &self,
        mbox: MboxRef,
        message: MessageRef,
        delay: Duration,
    ) -> Result<()> {
        self.add_entry(TimerEntry {
            live: TimerRef::Owned(Arc::new(TimerHandle {
                active: AtomicBool::new(true),
            })),
            mbox,
            message,
            at: Instant::now() + delay,
            period: None,
        })
    }

    fn add_entry(&self, entry: TimerEntry) -> Result<()> {
        let mut inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.stopped {
            return Err(Error::ShuttingDown);
        }
        inner.engine.add(entry);
        self.shared.signal.notify_one();
        Ok(())
    }

    pub(crate) fn stats(&self) -> TimerStats {
        let inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.engine.counts()
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.stopped = true;
            self.shared.signal.notify_all();
        }
        let handle = {
            let mut thread = self.thread.lock().unwrap_or_else(|e| e.into_inner());
            thread.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn timer_thread(shared: Arc<TimerShared>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| timer_loop(&shared)));
    if outcome.is_err() {
        log::error!("panic inside the timer thread; correct behavior cannot be restored");
        std::process::abort();
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut due: Vec<TimerEntry> = Vec::new();
    let mut reschedule: Vec<TimerEntry> = Vec::new();
    let mut guard = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if guard.stopped {
            return;
        }

        let now = Instant::now();
        guard.engine.take_due(now, &mut due);
        if !due.is_empty() {
            drop(guard);
            for mut entry in due.drain(..) {
                if !entry.is_live() {
                    continue;
                }
                if let Err(err) = entry.mbox.deliver_from_timer(Arc::clone(&entry.message)) {
                    log::warn!("timer delivery failed: {err}");
                }
                if let Some(period) = entry.period {
                    entry.at = now + period;
                    reschedule.push(entry);
                }
            }
            guard = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            for entry in reschedule.drain(..) {
                guard.engine.add(entry);
            }
            continue;
        }

        match guard.engine.nearest() {
            Some(at) => {
                let now = Instant::now();
                if at <= now {
                    continue;
                }
                let (g, _) = shared
                    .signal
                    .wait_timeout(guard, at - now)
                    .unwrap_or_else(|e| e.into_inner());
                guard = g;
            }
            None => {
                guard = shared
                    .signal
                    .wait(guard)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}
