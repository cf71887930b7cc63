//! Dispatchers: scheduling engines that own worker threads and event
//! queues.
//!
//! Every dispatcher implements one contract: it accepts execution demands
//! through [`EventQueue`] and hands out a [`DispBinder`] that binds agents
//! to its queues in two phases (preallocate, then activate). Queue waiting
//! is pluggable per dispatcher instance, and each worker optionally tracks
//! its working/waiting time.

mod active_group;
mod active_obj;
mod adv_thread_pool;
mod nef_thread_pool;
mod one_thread;
mod prio;
mod thread_pool;

pub use active_group::ActiveGroupDispatcher;
pub use active_obj::ActiveObjDispatcher;
pub use adv_thread_pool::{AdvThreadPoolDispatcher, AdvThreadPoolParams};
pub use nef_thread_pool::NefThreadPoolDispatcher;
pub use one_thread::OneThreadDispatcher;
pub use prio::{
    OnePerPrioDispatcher, QuotedRoundRobinDispatcher, QuotedRoundRobinParams,
    StrictlyOrderedDispatcher,
};
pub use thread_pool::{PoolFifo, ThreadPoolDispatcher, ThreadPoolParams};

use crate::agent::{AgentRef, ExceptionReaction};
use crate::clock::{Clock, MonotonicClock};
use crate::coop::DeregReason;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::sink::Demand;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

/// Sink into which a dispatcher accepts execution demands for an agent.
pub trait EventQueue: Send + Sync {
    fn push(&self, demand: Demand) -> Result<()>;

    fn push_evt_start(&self, demand: Demand) -> Result<()>;

    /// Must not fail: deregistration relies on the finish demand always
    /// reaching the queue.
    fn push_evt_finish(&self, demand: Demand);
}

/// Two-phase binding of an agent to a dispatcher.
pub trait DispBinder: Send + Sync {
    /// Allocates the resources the agent will need (queues, threads).
    /// Failures here roll back the whole cooperation registration.
    fn preallocate(&self, env: &Environment, agent: &AgentRef) -> Result<()>;

    /// Activates the binding. Does not fail; a dispatcher that cannot
    /// accept the agent at this point aborts the process.
    fn bind(&self, agent: &AgentRef);

    /// Releases whatever `preallocate` acquired.
    fn unbind(&self, agent: &AgentRef);
}

/// Introspection surface every dispatcher provides to the runtime-stats
/// controller.
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;

    fn binder(&self) -> Arc<dyn DispBinder>;

    /// Stops workers and closes queues. Idempotent.
    fn shutdown(&self);

    fn queue_stats(&self) -> Vec<QueueStats>;

    fn activity_stats(&self) -> Vec<WorkerActivity>;
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub queue: String,
    pub demands: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityStats {
    pub working_ns: u64,
    pub working_events: u64,
    pub waiting_ns: u64,
    pub waiting_events: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerActivity {
    pub worker: String,
    pub stats: ActivityStats,
}

/// How a worker waits on an empty queue.
#[derive(Debug, Clone, Copy)]
pub enum QueueLockPolicy {
    /// Park on a condvar immediately.
    Simple,
    /// Spin for a bounded number of attempts, then park.
    Combined { spin_attempts: u32 },
}

impl Default for QueueLockPolicy {
    fn default() -> Self {
        QueueLockPolicy::Combined { spin_attempts: 512 }
    }
}

/// Common tuning for dispatcher instances.
pub struct DispatcherParams {
    pub queue_lock: QueueLockPolicy,
    pub track_activity: bool,
    pub clock: Arc<dyn Clock>,
}

impl Default for DispatcherParams {
    fn default() -> Self {
        Self {
            queue_lock: QueueLockPolicy::default(),
            track_activity: false,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

/// An OS thread acquired from a [`WorkThreadFactory`].
pub trait WorkThread: Send {
    fn start(&mut self, body: Box<dyn FnOnce() + Send + 'static>) -> Result<()>;

    fn join(&mut self) -> Result<()>;
}

/// Replaceable source of worker threads, allowing the host application to
/// pool, pin or instrument them.
pub trait WorkThreadFactory: Send + Sync {
    fn acquire(&self, env: &Environment) -> Result<Box<dyn WorkThread>>;

    fn release(&self, thread: Box<dyn WorkThread>);
}

/// Default factory backed by `std::thread`.
pub struct StdWorkThreadFactory;

struct StdWorkThread {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WorkThread for StdWorkThread {
    fn start(&mut self, body: Box<dyn FnOnce() + Send + 'static>) -> Result<()> {
        let handle = std::thread::Builder::new()
            .name("conclave-worker".to_string())
            .spawn(body)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker thread terminated by panic");
            }
        }
        Ok(())
    }
}

impl WorkThreadFactory for StdWorkThreadFactory {
    fn acquire(&self, _env: &Environment) -> Result<Box<dyn WorkThread>> {
        Ok(Box::new(StdWorkThread { handle: None }))
    }

    fn release(&self, _thread: Box<dyn WorkThread>) {}
}

/// Per-worker activity accounting.
pub(crate) struct ActivityTracker {
    enabled: bool,
    clock: Arc<dyn Clock>,
    stats: Mutex<ActivityStats>,
}

impl ActivityTracker {
    pub(crate) fn new(enabled: bool, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            clock,
            stats: Mutex::new(ActivityStats::default()),
        })
    }

    pub(crate) fn mark(&self) -> u64 {
        if self.enabled {
            self.clock.now()
        } else {
            0
        }
    }

    pub(crate) fn work_finished(&self, started: u64) {
        if !self.enabled {
            return;
        }
        let elapsed = self.clock.now().saturating_sub(started);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.working_ns += elapsed;
        stats.working_events += 1;
    }

    pub(crate) fn wait_finished(&self, started: u64) {
        if !self.enabled {
            return;
        }
        let elapsed = self.clock.now().saturating_sub(started);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.waiting_ns += elapsed;
        stats.waiting_events += 1;
    }

    pub(crate) fn snapshot(&self) -> ActivityStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct DemandQueueInner {
    demands: VecDeque<Demand>,
    closed: bool,
}

/// FIFO demand queue with a pluggable wait policy; the shared building
/// block of the single-queue dispatchers.
pub(crate) struct DemandQueue {
    inner: Mutex<DemandQueueInner>,
    available: Condvar,
    policy: QueueLockPolicy,
}

impl DemandQueue {
    pub(crate) fn new(policy: QueueLockPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(DemandQueueInner {
                demands: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            policy,
        })
    }

    pub(crate) fn push_demand(&self, demand: Demand) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Err(Error::ShuttingDown);
        }
        inner.demands.push_back(demand);
        self.available.notify_one();
        Ok(())
    }

    fn push_finish_demand(&self, demand: Demand) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            log::warn!("evt_finish demand pushed to a closed dispatcher queue");
        }
        inner.demands.push_back(demand);
        self.available.notify_one();
    }

    /// Blocks for the next demand; `None` once the queue is closed and
    /// drained.
    pub(crate) fn pop(&self) -> Option<Demand> {
        if let QueueLockPolicy::Combined { spin_attempts } = self.policy {
            for _ in 0..spin_attempts {
                if let Ok(mut inner) = self.inner.try_lock() {
                    if let Some(demand) = inner.demands.pop_front() {
                        return Some(demand);
                    }
                    if inner.closed {
                        return None;
                    }
                }
                std::hint::spin_loop();
            }
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(demand) = inner.demands.pop_front() {
                return Some(demand);
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

    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        self.available.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .demands
            .len()
    }
}

impl EventQueue for DemandQueue {
    fn push(&self, demand: Demand) -> Result<()> {
        self.push_demand(demand)
    }

    fn push_evt_start(&self, demand: Demand) -> Result<()> {
        self.push_demand(demand)
    }

    fn push_evt_finish(&self, demand: Demand) {
        self.push_finish_demand(demand);
    }
}

/// Runs one demand with the panic boundary around the handler.
pub(crate) fn process_demand(demand: Demand) {
    let receiver = demand.receiver().clone();
    let outcome = catch_unwind(AssertUnwindSafe(move || demand.execute()));
    if outcome.is_err() {
        handle_handler_panic(receiver);
    }
}

fn handle_handler_panic(agent: AgentRef) {
    log::error!("panic escaped an event handler of agent {}", agent.id());
    match agent.exception_reaction() {
        ExceptionReaction::Ignore => {}
        ExceptionReaction::ShutdownEnvironment => agent.environment().stop(),
        ExceptionReaction::DeregisterCoop => {
            if let Some(coop) = agent.coop_id() {
                let _ = agent
                    .environment()
                    .deregister_coop_by_id(coop, DeregReason::UnhandledException);
            }
        }
        ExceptionReaction::Abort | ExceptionReaction::Inherit => std::process::abort(),
    }
}

/// Standard worker loop over one [`DemandQueue`].
pub(crate) fn drain_queue_worker(queue: Arc<DemandQueue>, tracker: Arc<ActivityTracker>) {
    loop {
        let waited = tracker.mark();
        let Some(demand) = queue.pop() else {
            tracker.wait_finished(waited);
            return;
        };
        tracker.wait_finished(waited);

        let worked = tracker.mark();
        process_demand(demand);
        tracker.work_finished(worked);
    }
}

/// Second-phase activation helper: by contract this cannot fail, so a
/// refusal from the dispatcher is a fatal inconsistency.
pub(crate) fn activate_agent_on_queue(agent: &AgentRef, queue: Arc<dyn EventQueue>) {
    if let Err(err) = agent.bind_queue(queue) {
        log::error!("cannot activate agent on dispatcher queue: {err}");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demand_queue_closes_and_drains() {
        let queue = DemandQueue::new(QueueLockPolicy::Simple);
        assert_eq!(queue.len(), 0);
        queue.close();
        assert!(queue.pop().is_none());
    }
}
