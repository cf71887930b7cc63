//! Advanced thread pool honoring handler thread-safety hints.
//!
//! Several thread-safe handlers of one agent may run in parallel on
//! different workers; a not-thread-safe handler obtains exclusive access to
//! its agent queue. Each queue moves through a small worker-occupancy state
//! machine: idle, N thread-safe runners, or one exclusive runner.

use crate::agent::{AgentId, AgentRef};
use crate::dispatcher::{
    activate_agent_on_queue, process_demand, ActivityTracker, DispBinder, Dispatcher,
    DispatcherParams, EventQueue, QueueStats, WorkThread, WorkThreadFactory, WorkerActivity,
};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::sink::Demand;
use crate::subscription::ThreadSafety;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};

pub struct AdvThreadPoolParams {
    pub threads: usize,
    pub common: DispatcherParams,
}

impl Default for AdvThreadPoolParams {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            common: DispatcherParams::default(),
        }
    }
}

struct AdvState {
    ready: VecDeque<Arc<AdvQueue>>,
    closed: bool,
}

struct AdvCore {
    state: Mutex<AdvState>,
    available: Condvar,
}

impl AdvCore {
    fn schedule(&self, queue: Arc<AdvQueue>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        state.ready.push_back(queue);
        self.available.notify_one();
        Ok(())
    }

    fn next_ready(&self) -> Option<Arc<AdvQueue>> {
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

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.ready.clear();
        self.available.notify_all();
    }
}

struct AdvInner {
    demands: VecDeque<Demand>,
    /// Workers currently running thread-safe handlers of this agent.
    active_safe: usize,
    /// A worker runs a not-thread-safe handler.
    exclusive: bool,
    /// A worker is inspecting the front demand; others must stand back.
    resolving: bool,
    scheduled: bool,
}

struct AdvQueue {
    label: String,
    core: Arc<AdvCore>,
    inner: Mutex<AdvInner>,
    self_weak: Weak<AdvQueue>,
}

enum WorkItem {
    Run { demand: Demand, exclusive: bool, requeue: bool },
    Blocked,
}

impl AdvQueue {
    fn new(label: String, core: Arc<AdvCore>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            label,
            core,
            inner: Mutex::new(AdvInner {
                demands: VecDeque::new(),
                active_safe: 0,
                exclusive: false,
                resolving: false,
                scheduled: false,
            }),
            self_weak: weak.clone(),
        })
    }

    fn schedule_self(&self) -> Result<()> {
        let me = self
            .self_weak
            .upgrade()
            .expect("adv queue is alive while scheduled");
        self.core.schedule(me)
    }

    fn push_demand(&self, demand: Demand) -> Result<()> {
        let need_schedule = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.demands.push_back(demand);
            if inner.scheduled || inner.resolving {
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

    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .demands
            .len()
    }

    /// Takes the front demand out for safety inspection, classifies it and
    /// either starts it or puts it back to wait for the running handlers.
    fn acquire_work(&self) -> Option<WorkItem> {
        let demand = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.resolving {
                inner.scheduled = false;
                return None;
            }
            match inner.demands.pop_front() {
                Some(demand) => {
                    inner.resolving = true;
                    demand
                }
                None => {
                    inner.scheduled = false;
                    return None;
                }
            }
        };

        // The handler lookup touches the agent's subscription storage, so
        // it must happen outside the queue lock.
        let safety = demand.receiver().demand_thread_safety(&demand);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.resolving = false;
        match safety {
            ThreadSafety::Safe if !inner.exclusive => {
                inner.active_safe += 1;
                let requeue = !inner.demands.is_empty();
                if !requeue {
                    inner.scheduled = false;
                }
                Some(WorkItem::Run {
                    demand,
                    exclusive: false,
                    requeue,
                })
            }
            ThreadSafety::Exclusive if inner.active_safe == 0 && !inner.exclusive => {
                inner.exclusive = true;
                inner.scheduled = false;
                Some(WorkItem::Run {
                    demand,
                    exclusive: true,
                    requeue: false,
                })
            }
            _ => {
                inner.demands.push_front(demand);
                inner.scheduled = false;
                Some(WorkItem::Blocked)
            }
        }
    }

    fn work_completed(&self, exclusive: bool) {
        let kick = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if exclusive {
                inner.exclusive = false;
            } else {
                inner.active_safe -= 1;
            }
            let kick = inner.active_safe == 0
                && !inner.exclusive
                && !inner.resolving
                && !inner.scheduled
                && !inner.demands.is_empty();
            if kick {
                inner.scheduled = true;
            }
            kick
        };
        if kick && self.schedule_self().is_err() {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.scheduled = false;
        }
    }
}

impl EventQueue for AdvQueue {
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

fn adv_worker(core: Arc<AdvCore>, tracker: Arc<ActivityTracker>) {
    loop {
        let waited = tracker.mark();
        let Some(queue) = core.next_ready() else {
            tracker.wait_finished(waited);
            return;
        };
        tracker.wait_finished(waited);

        match queue.acquire_work() {
            Some(WorkItem::Run {
                demand,
                exclusive,
                requeue,
            }) => {
                if requeue {
                    // Let other workers join in on the remaining demands.
                    let _ = queue.schedule_self();
                }
                let worked = tracker.mark();
                process_demand(demand);
                tracker.work_finished(worked);
                queue.work_completed(exclusive);
            }
            Some(WorkItem::Blocked) | None => {}
        }
    }
}

pub struct AdvThreadPoolDispatcher {
    name: String,
    core: Arc<AdvCore>,
    factory: Arc<dyn WorkThreadFactory>,
    trackers: Vec<Arc<ActivityTracker>>,
    workers: Mutex<Vec<Box<dyn WorkThread>>>,
    queues: Mutex<HashMap<AgentId, Arc<AdvQueue>>>,
    self_weak: Weak<Self>,
}

impl AdvThreadPoolDispatcher {
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: AdvThreadPoolParams,
    ) -> Result<Arc<Self>> {
        let core = Arc::new(AdvCore {
            state: Mutex::new(AdvState {
                ready: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });
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
            thread.start(Box::new(move || adv_worker(worker_core, worker_tracker)))?;
            trackers.push(tracker);
            workers.push(thread);
        }

        let name = name.into();
        let dispatcher = Arc::new_cyclic(|weak| Self {
            name,
            core,
            factory,
            trackers,
            workers: Mutex::new(workers),
            queues: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
        });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }
}

impl Dispatcher for AdvThreadPoolDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        let dispatcher = self
            .self_weak
            .upgrade()
            .expect("dispatcher is owned by the environment");
        Arc::new(AdvPoolBinder { dispatcher })
    }

    fn shutdown(&self) {
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

    fn queue_stats(&self) -> Vec<QueueStats> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .values()
            .map(|queue| QueueStats {
                queue: queue.label.clone(),
                demands: queue.len(),
            })
            .collect()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
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

struct AdvPoolBinder {
    dispatcher: Arc<AdvThreadPoolDispatcher>,
}

impl DispBinder for AdvPoolBinder {
    fn preallocate(&self, _env: &Environment, agent: &AgentRef) -> Result<()> {
        let mut queues = self
            .dispatcher
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        queues.insert(
            agent.id(),
            AdvQueue::new(
                format!("agent_{}", agent.id()),
                Arc::clone(&self.dispatcher.core),
            ),
        );
        Ok(())
    }

    fn bind(&self, agent: &AgentRef) {
        let queue = {
            let queues = self
                .dispatcher
                .queues
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            queues.get(&agent.id()).map(Arc::clone)
        };
        match queue {
            Some(queue) => activate_agent_on_queue(agent, queue as _),
            None => {
                log::error!("adv_thread_pool bind without preallocation");
                std::process::abort();
            }
        }
    }

    fn unbind(&self, agent: &AgentRef) {
        let mut queues = self
            .dispatcher
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        queues.remove(&agent.id());
    }
}
