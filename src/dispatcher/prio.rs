//! Priority-aware dispatchers.
//!
//! Three disciplines over agent priorities: strictly ordered (always the
//! highest non-empty priority first, one thread), quoted round-robin
//! (per-priority quotas on one thread) and one-per-priority (a dedicated
//! thread per priority level). Priorities preempt only at handler
//! boundaries, never mid-handler.

use crate::agent::{AgentRef, Priority};
use crate::dispatcher::{
    activate_agent_on_queue, drain_queue_worker, process_demand, ActivityTracker, DemandQueue,
    DispBinder, Dispatcher, DispatcherParams, EventQueue, QueueStats, WorkThread,
    WorkThreadFactory, WorkerActivity,
};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::sink::Demand;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

struct PrioInner {
    queues: [VecDeque<Demand>; Priority::COUNT],
    total: usize,
    closed: bool,
}

/// Demand storage partitioned by priority.
struct PrioQueue {
    inner: Mutex<PrioInner>,
    available: Condvar,
}

impl PrioQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PrioInner {
                queues: std::array::from_fn(|_| VecDeque::new()),
                total: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    fn push_demand(&self, demand: Demand) -> Result<()> {
        let prio = demand.receiver().priority().index();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(Error::ShuttingDown);
        }
        inner.queues[prio].push_back(demand);
        inner.total += 1;
        self.available.notify_one();
        Ok(())
    }

    /// Blocks for the demand with the highest priority.
    fn pop_highest(&self) -> Option<Demand> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.total > 0 {
                for prio in (0..Priority::COUNT).rev() {
                    if let Some(demand) = inner.queues[prio].pop_front() {
                        inner.total -= 1;
                        return Some(demand);
                    }
                }
            }
            if inner.closed {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn try_pop(&self, prio: usize) -> Option<Demand> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let demand = inner.queues[prio].pop_front();
        if demand.is_some() {
            inner.total -= 1;
        }
        demand
    }

    /// Blocks until any demand is available; `false` once closed and empty.
    fn wait_nonempty(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.total > 0 {
                return true;
            }
            if inner.closed {
                return false;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        self.available.notify_all();
    }

    fn stats(&self) -> Vec<QueueStats> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .queues
            .iter()
            .enumerate()
            .map(|(prio, queue)| QueueStats {
                queue: format!("p{prio}"),
                demands: queue.len(),
            })
            .collect()
    }
}

impl EventQueue for PrioQueue {
    fn push(&self, demand: Demand) -> Result<()> {
        self.push_demand(demand)
    }

    fn push_evt_start(&self, demand: Demand) -> Result<()> {
        self.push_demand(demand)
    }

    fn push_evt_finish(&self, demand: Demand) {
        if self.push_demand(demand).is_err() {
            log::warn!("evt_finish lost: priority dispatcher is shutting down");
        }
    }
}

struct SharedQueueBinder {
    queue: Arc<dyn EventQueue>,
}

impl DispBinder for SharedQueueBinder {
    fn preallocate(&self, _env: &Environment, _agent: &AgentRef) -> Result<()> {
        Ok(())
    }

    fn bind(&self, agent: &AgentRef) {
        activate_agent_on_queue(agent, Arc::clone(&self.queue));
    }

    fn unbind(&self, _agent: &AgentRef) {}
}

/// Processes all demands of the highest priority before anything lower.
pub struct StrictlyOrderedDispatcher {
    name: String,
    queue: Arc<PrioQueue>,
    tracker: Arc<ActivityTracker>,
    factory: Arc<dyn WorkThreadFactory>,
    worker: Mutex<Option<Box<dyn WorkThread>>>,
}

impl StrictlyOrderedDispatcher {
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: DispatcherParams,
    ) -> Result<Arc<Self>> {
        let queue = PrioQueue::new();
        let tracker = ActivityTracker::new(params.track_activity, params.clock);
        let factory = env.work_thread_factory();

        let mut thread = factory.acquire(env)?;
        let worker_queue = Arc::clone(&queue);
        let worker_tracker = Arc::clone(&tracker);
        thread.start(Box::new(move || loop {
            let waited = worker_tracker.mark();
            let Some(demand) = worker_queue.pop_highest() else {
                worker_tracker.wait_finished(waited);
                return;
            };
            worker_tracker.wait_finished(waited);
            let worked = worker_tracker.mark();
            process_demand(demand);
            worker_tracker.work_finished(worked);
        }))?;

        let dispatcher = Arc::new(Self {
            name: name.into(),
            queue,
            tracker,
            factory,
            worker: Mutex::new(Some(thread)),
        });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }
}

impl Dispatcher for StrictlyOrderedDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        Arc::new(SharedQueueBinder {
            queue: Arc::clone(&self.queue) as _,
        })
    }

    fn shutdown(&self) {
        self.queue.close();
        let thread = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some(mut thread) = thread {
            let _ = thread.join();
            self.factory.release(thread);
        }
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        self.queue.stats()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        vec![WorkerActivity {
            worker: format!("{}/worker", self.name),
            stats: self.tracker.snapshot(),
        }]
    }
}

pub struct QuotedRoundRobinParams {
    /// Demands processed per priority per round.
    pub default_quote: usize,
    /// Per-priority overrides.
    pub quotes: Vec<(Priority, usize)>,
    pub common: DispatcherParams,
}

impl Default for QuotedRoundRobinParams {
    fn default() -> Self {
        Self {
            default_quote: 4,
            quotes: Vec::new(),
            common: DispatcherParams::default(),
        }
    }
}

/// One thread cycling from the highest priority downwards, processing at
/// most the configured quota per priority per round.
pub struct QuotedRoundRobinDispatcher {
    name: String,
    queue: Arc<PrioQueue>,
    tracker: Arc<ActivityTracker>,
    factory: Arc<dyn WorkThreadFactory>,
    worker: Mutex<Option<Box<dyn WorkThread>>>,
}

impl QuotedRoundRobinDispatcher {
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: QuotedRoundRobinParams,
    ) -> Result<Arc<Self>> {
        let mut quotas = [params.default_quote.max(1); Priority::COUNT];
        for (prio, quote) in &params.quotes {
            quotas[prio.index()] = (*quote).max(1);
        }

        let queue = PrioQueue::new();
        let tracker = ActivityTracker::new(params.common.track_activity, params.common.clock);
        let factory = env.work_thread_factory();

        let mut thread = factory.acquire(env)?;
        let worker_queue = Arc::clone(&queue);
        let worker_tracker = Arc::clone(&tracker);
        thread.start(Box::new(move || loop {
            let mut processed_any = false;
            for prio in (0..Priority::COUNT).rev() {
                for _ in 0..quotas[prio] {
                    let Some(demand) = worker_queue.try_pop(prio) else {
                        break;
                    };
                    let worked = worker_tracker.mark();
                    process_demand(demand);
                    worker_tracker.work_finished(worked);
                    processed_any = true;
                }
            }
            if !processed_any {
                let waited = worker_tracker.mark();
                let alive = worker_queue.wait_nonempty();
                worker_tracker.wait_finished(waited);
                if !alive {
                    return;
                }
            }
        }))?;

        let dispatcher = Arc::new(Self {
            name: name.into(),
            queue,
            tracker,
            factory,
            worker: Mutex::new(Some(thread)),
        });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }
}

impl Dispatcher for QuotedRoundRobinDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        Arc::new(SharedQueueBinder {
            queue: Arc::clone(&self.queue) as _,
        })
    }

    fn shutdown(&self) {
        self.queue.close();
        let thread = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some(mut thread) = thread {
            let _ = thread.join();
            self.factory.release(thread);
        }
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        self.queue.stats()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        vec![WorkerActivity {
            worker: format!("{}/worker", self.name),
            stats: self.tracker.snapshot(),
        }]
    }
}

struct PrioRoutingQueue {
    queues: [Arc<DemandQueue>; Priority::COUNT],
}

impl EventQueue for PrioRoutingQueue {
    fn push(&self, demand: Demand) -> Result<()> {
        let prio = demand.receiver().priority().index();
        self.queues[prio].push_demand(demand)
    }

    fn push_evt_start(&self, demand: Demand) -> Result<()> {
        self.push(demand)
    }

    fn push_evt_finish(&self, demand: Demand) {
        let prio = demand.receiver().priority().index();
        self.queues[prio].push_evt_finish(demand);
    }
}

/// A dedicated worker thread per priority level.
pub struct OnePerPrioDispatcher {
    name: String,
    queues: [Arc<DemandQueue>; Priority::COUNT],
    trackers: Vec<Arc<ActivityTracker>>,
    factory: Arc<dyn WorkThreadFactory>,
    workers: Mutex<Vec<Box<dyn WorkThread>>>,
}

impl OnePerPrioDispatcher {
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: DispatcherParams,
    ) -> Result<Arc<Self>> {
        let factory = env.work_thread_factory();
        let queues: [Arc<DemandQueue>; Priority::COUNT] =
            std::array::from_fn(|_| DemandQueue::new(params.queue_lock));

        let mut trackers = Vec::with_capacity(Priority::COUNT);
        let mut workers = Vec::with_capacity(Priority::COUNT);
        for queue in &queues {
            let tracker = ActivityTracker::new(params.track_activity, Arc::clone(&params.clock));
            let mut thread = factory.acquire(env)?;
            let worker_queue = Arc::clone(queue);
            let worker_tracker = Arc::clone(&tracker);
            thread.start(Box::new(move || {
                drain_queue_worker(worker_queue, worker_tracker)
            }))?;
            trackers.push(tracker);
            workers.push(thread);
        }

        let dispatcher = Arc::new(Self {
            name: name.into(),
            queues,
            trackers,
            factory,
            workers: Mutex::new(workers),
        });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }
}

impl Dispatcher for OnePerPrioDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        Arc::new(SharedQueueBinder {
            queue: Arc::new(PrioRoutingQueue {
                queues: std::array::from_fn(|idx| Arc::clone(&self.queues[idx])),
            }) as _,
        })
    }

    fn shutdown(&self) {
        for queue in &self.queues {
            queue.close();
        }
        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };
        for mut thread in workers {
            let _ = thread.join();
            self.factory.release(thread);
        }
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        self.queues
            .iter()
            .enumerate()
            .map(|(prio, queue)| QueueStats {
                queue: format!("p{prio}"),
                demands: queue.len(),
            })
            .collect()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        self.trackers
            .iter()
            .enumerate()
            .map(|(prio, tracker)| WorkerActivity {
                worker: format!("{}/p{prio}", self.name),
                stats: tracker.snapshot(),
            })
            .collect()
    }
}
