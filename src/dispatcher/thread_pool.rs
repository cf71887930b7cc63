//! Thread-pool dispatcher: N workers over a queue of agent queues.
//!
//! Each agent (or each cooperation, in cooperation-FIFO mode) has its own
//! demand queue; any idle worker picks a non-empty agent queue from the
//! ready list and drains up to `max_demands_at_once` demands from it before
//! moving on. The scheduling is work-conserving and approximately FIFO
//! across agent queues: a queue with remaining demands re-enters the tail
//! of the ready list after its batch.

use crate::agent::{AgentId, AgentRef};
use crate::coop::CoopId;
use crate::dispatcher::{
    activate_agent_on_queue, process_demand, ActivityTracker, DispBinder, Dispatcher,
    DispatcherParams, EventQueue, QueueStats, WorkThread, WorkThreadFactory, WorkerActivity,
};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::sink::Demand;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};

/// FIFO mode of a thread-pool binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFifo {
    /// Each agent gets its own queue.
    Individual,
    /// Agents of one cooperation share a queue, preserving the relative
    /// order of their events.
    Cooperation,
}

pub struct ThreadPoolParams {
    pub threads: usize,
    pub fifo: PoolFifo,
    pub max_demands_at_once: usize,
    pub common: DispatcherParams,
}

impl Default for ThreadPoolParams {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            fifo: PoolFifo::Cooperation,
            max_demands_at_once: 4,
            common: DispatcherParams::default(),
        }
    }
}

struct PoolState {
    ready: VecDeque<Arc<PoolQueue>>,
    closed: bool,
}

pub(crate) struct PoolCore {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                ready: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    fn schedule(&self, queue: Arc<PoolQueue>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        state.ready.push_back(queue);
        self.available.notify_one();
        Ok(())
    }

    /// Reserves ready-list capacity so a later schedule cannot allocate.
    fn reserve_slot(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let needed = state.ready.len() + 1;
        let current_len = state.ready.len();
        if state.ready.capacity() < needed {
            state.ready.reserve(needed - current_len);
        }
    }

    fn next_ready(&self) -> Option<Arc<PoolQueue>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(queue) = state.ready.pop_front() {
                return Some(queue);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.ready.clear();
        self.available.notify_all();
    }
}

struct FinishSlot {
    demand: Option<Demand>,
    requested: bool,
}

struct PoolQueueInner {
    demands: VecDeque<Demand>,
    scheduled: bool,
}

/// Demand queue of one agent (or cooperation) inside a pool.
pub(crate) struct PoolQueue {
    label: String,
    core: Arc<PoolCore>,
    inner: Mutex<PoolQueueInner>,
    /// Preallocated `evt_finish` storage for the nef flavor.
    finish: Mutex<FinishSlot>,
    max_at_once: usize,
    self_weak: Weak<PoolQueue>,
}

impl PoolQueue {
    pub(crate) fn new(label: String, core: Arc<PoolCore>, max_at_once: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            label,
            core,
            inner: Mutex::new(PoolQueueInner {
                demands: VecDeque::new(),
                scheduled: false,
            }),
            finish: Mutex::new(FinishSlot {
                demand: None,
                requested: false,
            }),
            max_at_once: max_at_once.max(1),
            self_weak: weak.clone(),
        })
    }

    fn schedule_self(&self) -> Result<()> {
        let me = self
            .self_weak
            .upgrade()
            .expect("pool queue is alive while scheduled");
        self.core.schedule(me)
    }

    fn push_demand(&self, demand: Demand) -> Result<()> {
        let need_schedule = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.demands.push_back(demand);
            if inner.scheduled {
                false
            } else {
                inner.scheduled = true;
                true
            }
        };
        if need_schedule {
            if let Err(err) = self.schedule_self() {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.scheduled = false;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stores the finish demand in the preallocated slot; used by the
    /// nef-thread-pool binding so the push cannot allocate.
    pub(crate) fn push_finish_preallocated(&self, demand: Demand) {
        {
            let mut slot = self.finish.lock().unwrap_or_else(|e| e.into_inner());
            slot.demand = Some(demand);
            slot.requested = true;
        }
        let need_schedule = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.scheduled {
                false
            } else {
                inner.scheduled = true;
                true
            }
        };
        if need_schedule {
            if self.schedule_self().is_err() {
                log::warn!("evt_finish for '{}' lost: pool is shutting down", self.label);
            }
        }
    }

    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .demands
            .len()
    }

    /// Drains one batch on the calling worker. Returns after at most
    /// `max_at_once` demands, rescheduling itself when demands remain.
    fn run_batch(&self) {
        let mut processed = 0usize;
        loop {
            enum Step {
                Run(Demand),
                Requeue,
                Done,
            }
            let step = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if processed < self.max_at_once {
                    match inner.demands.pop_front() {
                        Some(demand) => Step::Run(demand),
                        None => {
                            let finish = {
                                let mut slot =
                                    self.finish.lock().unwrap_or_else(|e| e.into_inner());
                                if slot.requested {
                                    slot.requested = false;
                                    slot.demand.take()
                                } else {
                                    None
                                }
                            };
                            match finish {
                                Some(demand) => Step::Run(demand),
                                None => {
                                    inner.scheduled = false;
                                    Step::Done
                                }
                            }
                        }
                    }
                } else if inner.demands.is_empty() {
                    inner.scheduled = false;
                    Step::Done
                } else {
                    Step::Requeue
                }
            };
            match step {
                Step::Run(demand) => {
                    process_demand(demand);
                    processed += 1;
                }
                Step::Requeue => {
                    if self.schedule_self().is_err() {
                        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                        inner.scheduled = false;
                    }
                    return;
                }
                Step::Done => return,
            }
        }
    }
}

impl EventQueue for PoolQueue {
    fn push(&self, demand: Demand) -> Result<()> {
        self.push_demand(demand)
    }

    fn push_evt_start(&self, demand: Demand) -> Result<()> {
        self.push_demand(demand)
    }

    fn push_evt_finish(&self, demand: Demand) {
        if self.push_demand(demand).is_err() {
            log::warn!("evt_finish for '{}' lost: pool is shutting down", self.label);
        }
    }
}

fn pool_worker(core: Arc<PoolCore>, tracker: Arc<ActivityTracker>) {
    loop {
        let waited = tracker.mark();
        let Some(queue) = core.next_ready() else {
            tracker.wait_finished(waited);
            return;
        };
        tracker.wait_finished(waited);

        let worked = tracker.mark();
        queue.run_batch();
        tracker.work_finished(worked);
    }
}

enum QueueKey {
    Agent(AgentId),
    Coop(CoopId),
}

struct QueueSlot {
    queue: Arc<PoolQueue>,
    agents: usize,
}

pub(crate) struct PoolQueues {
    by_agent: HashMap<AgentId, QueueSlot>,
    by_coop: HashMap<CoopId, QueueSlot>,
}

/// Shared implementation of the plain and nef pool dispatchers.
pub(crate) struct PoolRuntime {
    pub name: String,
    pub core: Arc<PoolCore>,
    pub fifo: PoolFifo,
    pub max_demands_at_once: usize,
    pub factory: Arc<dyn WorkThreadFactory>,
    pub trackers: Vec<Arc<ActivityTracker>>,
    pub workers: Mutex<Vec<Box<dyn WorkThread>>>,
    pub queues: Mutex<PoolQueues>,
}

impl PoolRuntime {
    pub(crate) fn create(
        env: &Environment,
        name: String,
        params: ThreadPoolParams,
    ) -> Result<Arc<Self>> {
        let core = PoolCore::new();
        let factory = env.work_thread_factory();
        let threads = params.threads.max(1);

        let mut trackers = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let tracker = ActivityTracker::new(
                params.common.track_activity,
                Arc::clone(&params.common.clock),
            );
            let mut thread = factory.acquire(env)?;
            let worker_core = Arc::clone(&core);
            let worker_tracker = Arc::clone(&tracker);
            thread.start(Box::new(move || pool_worker(worker_core, worker_tracker)))?;
            trackers.push(tracker);
            workers.push(thread);
        }

        Ok(Arc::new(Self {
            name,
            core,
            fifo: params.fifo,
            max_demands_at_once: params.max_demands_at_once,
            factory,
            trackers,
            workers: Mutex::new(workers),
            queues: Mutex::new(PoolQueues {
                by_agent: HashMap::new(),
                by_coop: HashMap::new(),
            }),
        }))
    }

    fn key_for(&self, agent: &AgentRef) -> QueueKey {
        match self.fifo {
            PoolFifo::Cooperation => match agent.coop_id() {
                Some(coop) => QueueKey::Coop(coop),
                None => QueueKey::Agent(agent.id()),
            },
            PoolFifo::Individual => QueueKey::Agent(agent.id()),
        }
    }

    pub(crate) fn attach(&self, agent: &AgentRef) -> Arc<PoolQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let slot = match self.key_for(agent) {
            QueueKey::Agent(id) => queues.by_agent.entry(id).or_insert_with(|| QueueSlot {
                queue: PoolQueue::new(
                    format!("agent_{id}"),
                    Arc::clone(&self.core),
                    self.max_demands_at_once,
                ),
                agents: 0,
            }),
            QueueKey::Coop(id) => queues.by_coop.entry(id).or_insert_with(|| QueueSlot {
                queue: PoolQueue::new(
                    format!("coop_{id}"),
                    Arc::clone(&self.core),
                    self.max_demands_at_once,
                ),
                agents: 0,
            }),
        };
        slot.agents += 1;
        self.core.reserve_slot();
        Arc::clone(&slot.queue)
    }

    pub(crate) fn lookup(&self, agent: &AgentRef) -> Option<Arc<PoolQueue>> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        match self.key_for(agent) {
            QueueKey::Agent(id) => queues.by_agent.get(&id).map(|s| Arc::clone(&s.queue)),
            QueueKey::Coop(id) => queues.by_coop.get(&id).map(|s| Arc::clone(&s.queue)),
        }
    }

    pub(crate) fn detach(&self, agent: &AgentRef) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        match self.key_for(agent) {
            QueueKey::Agent(id) => {
                if let Some(slot) = queues.by_agent.get_mut(&id) {
                    slot.agents -= 1;
                    if slot.agents == 0 {
                        queues.by_agent.remove(&id);
                    }
                }
            }
            QueueKey::Coop(id) => {
                if let Some(slot) = queues.by_coop.get_mut(&id) {
                    slot.agents -= 1;
                    if slot.agents == 0 {
                        queues.by_coop.remove(&id);
                    }
                }
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        self.core.close();
        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };
        for mut thread in workers {
            let _ = thread.join();
            self.factory.release(thread);
        }
    }

    pub(crate) fn queue_stats(&self) -> Vec<QueueStats> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .by_agent
            .values()
            .chain(queues.by_coop.values())
            .map(|slot| QueueStats {
                queue: slot.queue.label.clone(),
                demands: slot.queue.len(),
            })
            .collect()
    }

    pub(crate) fn activity_stats(&self) -> Vec<WorkerActivity> {
        self.trackers
            .iter()
            .enumerate()
            .map(|(idx, tracker)| WorkerActivity {
                worker: format!("{}/worker_{idx}", self.name),
                stats: tracker.snapshot(),
            })
            .collect()
    }
}

pub struct ThreadPoolDispatcher {
    runtime: Arc<PoolRuntime>,
}

impl ThreadPoolDispatcher {
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: ThreadPoolParams,
    ) -> Result<Arc<Self>> {
        let runtime = PoolRuntime::create(env, name.into(), params)?;
        let dispatcher = Arc::new(Self { runtime });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }
}

impl Dispatcher for ThreadPoolDispatcher {
    fn name(&self) -> &str {
        &self.runtime.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        Arc::new(PoolBinder {
            runtime: Arc::clone(&self.runtime),
            preallocate_finish: false,
        })
    }

    fn shutdown(&self) {
        self.runtime.shutdown();
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        self.runtime.queue_stats()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        self.runtime.activity_stats()
    }
}

pub(crate) struct PoolBinder {
    pub runtime: Arc<PoolRuntime>,
    /// When set, `push_evt_finish` uses the preallocated slot (the nef
    /// contract).
    pub preallocate_finish: bool,
}

struct NefQueueHandle {
    queue: Arc<PoolQueue>,
}

impl EventQueue for NefQueueHandle {
    fn push(&self, demand: Demand) -> Result<()> {
        self.queue.push(demand)
    }

    fn push_evt_start(&self, demand: Demand) -> Result<()> {
        self.queue.push_evt_start(demand)
    }

    fn push_evt_finish(&self, demand: Demand) {
        self.queue.push_finish_preallocated(demand);
    }
}

impl DispBinder for PoolBinder {
    fn preallocate(&self, _env: &Environment, agent: &AgentRef) -> Result<()> {
        self.runtime.attach(agent);
        Ok(())
    }

    fn bind(&self, agent: &AgentRef) {
        let Some(queue) = self.runtime.lookup(agent) else {
            log::error!("thread_pool bind without preallocation");
            std::process::abort();
        };
        if self.preallocate_finish {
            activate_agent_on_queue(agent, Arc::new(NefQueueHandle { queue }) as _);
        } else {
            activate_agent_on_queue(agent, queue as _);
        }
    }

    fn unbind(&self, agent: &AgentRef) {
        self.runtime.detach(agent);
    }
}
