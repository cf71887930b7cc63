//! Cooperations: groups of agents registered and deregistered as a unit.
//!
//! Registration is atomic from the caller's point of view: agents are
//! defined, bound to their dispatchers in two phases and started, or the
//! whole operation rolls back and no agent of the cooperation ever runs.
//! Deregistration is cooperative: every agent drains its queue and runs
//! `evt_finish`, after which a dedicated worker thread performs the final
//! teardown so destructors never run under the registry lock.

use crate::agent::{Agent, AgentObj, AgentOptions, AgentRef, AgentRuntime, ExceptionReaction};
use crate::dispatcher::DispBinder;
use crate::env::Environment;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

pub type CoopId = u64;

/// Why a cooperation was deregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregReason {
    /// Explicit deregistration by user code.
    Normal,
    /// Environment shutdown.
    Shutdown,
    /// The parent cooperation is being deregistered.
    ParentDeregistration,
    /// A panic escaped an event handler.
    UnhandledException,
    /// User-defined reason code.
    User(u32),
}

pub type RegNotificator = Box<dyn Fn(&Environment, &str) + Send + Sync>;
pub type DeregNotificator = Box<dyn Fn(&Environment, &str, DeregReason) + Send + Sync>;

/// Listener installed in environment params, notified about every
/// registration and deregistration.
pub trait CoopListener: Send + Sync {
    fn on_registered(&self, _name: &str) {}
    fn on_deregistered(&self, _name: &str, _reason: DeregReason) {}
}

/// A cooperation under construction.
///
/// Created by [`Environment::create_coop`], populated with agents and handed
/// to [`Environment::register_coop`].
pub struct Coop {
    pub(crate) id: CoopId,
    pub(crate) name: Arc<str>,
    pub(crate) env: Environment,
    pub(crate) parent: Option<String>,
    pub(crate) default_binder: Arc<dyn DispBinder>,
    pub(crate) agents: Vec<(AgentRef, Arc<dyn DispBinder>)>,
    pub(crate) disposers: Vec<Box<dyn FnOnce() + Send>>,
    pub(crate) reg_notificators: Vec<RegNotificator>,
    pub(crate) dereg_notificators: Vec<DeregNotificator>,
    pub(crate) exception_reaction: ExceptionReaction,
}

impl Coop {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes this cooperation a child of `parent`; the parent finalizes
    /// only after this cooperation has been fully deregistered.
    pub fn set_parent(&mut self, parent: impl Into<String>) {
        self.parent = Some(parent.into());
    }

    /// Replaces the binder used by agents added without an explicit one.
    pub fn set_default_binder(&mut self, binder: Arc<dyn DispBinder>) {
        self.default_binder = binder;
    }

    pub fn set_exception_reaction(&mut self, reaction: ExceptionReaction) {
        self.exception_reaction = reaction;
    }

    pub fn add_agent<A: Agent>(&mut self, agent: A) -> AgentRef {
        self.add_agent_full(agent, AgentOptions::default(), None)
    }

    pub fn add_agent_cfg<A: Agent>(&mut self, agent: A, options: AgentOptions) -> AgentRef {
        self.add_agent_full(agent, options, None)
    }

    pub fn add_agent_with_binder<A: Agent>(
        &mut self,
        agent: A,
        binder: Arc<dyn DispBinder>,
    ) -> AgentRef {
        self.add_agent_full(agent, AgentOptions::default(), Some(binder))
    }

    pub fn add_agent_full<A: Agent>(
        &mut self,
        agent: A,
        options: AgentOptions,
        binder: Option<Arc<dyn DispBinder>>,
    ) -> AgentRef {
        let boxed: Box<dyn AgentObj> = Box::new(agent);
        let agent_ref = AgentRuntime::create(&self.env, boxed, options);
        let binder = binder.unwrap_or_else(|| Arc::clone(&self.default_binder));
        self.agents.push((agent_ref.clone(), binder));
        agent_ref
    }

    /// Keeps `resource` alive until the cooperation is destroyed.
    pub fn take_under_control<T: Send + 'static>(&mut self, resource: T) {
        self.disposers.push(Box::new(move || drop(resource)));
    }

    pub fn add_reg_notificator(&mut self, notificator: RegNotificator) {
        self.reg_notificators.push(notificator);
    }

    pub fn add_dereg_notificator(&mut self, notificator: DeregNotificator) {
        self.dereg_notificators.push(notificator);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoopStatus {
    Registered,
    Deregistering,
}

pub(crate) struct CoopRuntime {
    id: CoopId,
    name: Arc<str>,
    env: Environment,
    registry: Weak<CoopRegistry>,
    parent: Option<Arc<CoopRuntime>>,
    agents: Vec<(AgentRef, Arc<dyn DispBinder>)>,
    /// Live agents plus live child cooperations.
    usage: AtomicUsize,
    status: Mutex<CoopStatus>,
    dereg_reason: Mutex<Option<DeregReason>>,
    disposers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    reg_notificators: Vec<RegNotificator>,
    dereg_notificators: Vec<DeregNotificator>,
    exception_reaction: ExceptionReaction,
    children: Mutex<HashSet<CoopId>>,
}

impl CoopRuntime {
    pub(crate) fn id(&self) -> CoopId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn exception_reaction(&self) -> ExceptionReaction {
        match self.exception_reaction {
            ExceptionReaction::Inherit => match &self.parent {
                Some(parent) => parent.exception_reaction(),
                None => self.env.default_exception_reaction(),
            },
            other => other,
        }
    }

    pub(crate) fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Called when one of the cooperation's agents has executed its
    /// `evt_finish` demand (or when a child finalized).
    pub(crate) fn agent_finished(self: &Arc<Self>) {
        if self.usage.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(registry) = self.registry.upgrade() {
                registry.enqueue_final_dereg(Arc::clone(self));
            }
        }
    }

    fn child_registered(&self, child: CoopId) {
        self.usage.fetch_add(1, Ordering::AcqRel);
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(child);
    }

    fn child_finalized(self: &Arc<Self>, child: CoopId) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&child);
        self.agent_finished();
    }

    /// Initiates deregistration: pushes `evt_finish` to every agent and
    /// cascades to child cooperations. Idempotent.
    fn initiate_deregistration(self: &Arc<Self>, reason: DeregReason) {
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *status != CoopStatus::Registered {
                return;
            }
            *status = CoopStatus::Deregistering;
        }
        *self.dereg_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);

        let children: Vec<CoopId> = {
            let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            children.iter().copied().collect()
        };
        if let Some(registry) = self.registry.upgrade() {
            for child in children {
                registry.deregister_by_id(child, DeregReason::ParentDeregistration);
            }
        }

        for (agent, _) in &self.agents {
            if !agent.push_evt_finish() {
                // Agent was never bound; account for it directly.
                self.agent_finished();
            }
        }
    }

    /// Final teardown, run on the dedicated deregistration thread.
    fn finalize(self: &Arc<Self>) {
        for (agent, binder) in self.agents.iter().rev() {
            binder.unbind(agent);
            agent.unbind_queue();
            agent.destroy_subscriptions();
        }

        let disposers = {
            let mut disposers = self.disposers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *disposers)
        };
        for disposer in disposers {
            disposer();
        }

        let reason = self
            .dereg_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(DeregReason::Normal);
        for notificator in &self.dereg_notificators {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                notificator(&self.env, &self.name, reason)
            }));
            if outcome.is_err() {
                log::error!("panic in dereg notificator for coop '{}'", self.name);
            }
        }

        if let Some(parent) = &self.parent {
            parent.child_finalized(self.id);
        }
    }
}

struct RegistryState {
    coops: HashMap<CoopId, Arc<CoopRuntime>>,
    by_name: HashMap<Arc<str>, CoopId>,
    shutdown: bool,
}

/// Registry of all registered cooperations plus the final-deregistration
/// pipeline.
pub(crate) struct CoopRegistry {
    state: Mutex<RegistryState>,
    empty_cv: Condvar,
    final_queue: Mutex<VecDeque<Arc<CoopRuntime>>>,
    final_cv: Condvar,
    final_stop: AtomicBool,
    final_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CoopRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                coops: HashMap::new(),
                by_name: HashMap::new(),
                shutdown: false,
            }),
            empty_cv: Condvar::new(),
            final_queue: Mutex::new(VecDeque::new()),
            final_cv: Condvar::new(),
            final_stop: AtomicBool::new(false),
            final_thread: Mutex::new(None),
        })
    }

    /// Starts the final-deregistration worker thread.
    pub(crate) fn start(self: &Arc<Self>, env: &Environment) {
        let registry = Arc::clone(self);
        let env = env.downgrade();
        let handle = std::thread::Builder::new()
            .name("conclave-coop-dereg".to_string())
            .spawn(move || registry.final_dereg_loop(env))
            .expect("cannot start coop deregistration thread");
        *self.final_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn final_dereg_loop(&self, env: crate::env::WeakEnv) {
        loop {
            let coop = {
                let mut queue = self.final_queue.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if let Some(coop) = queue.pop_front() {
                        break Some(coop);
                    }
                    if self.final_stop.load(Ordering::Acquire) {
                        break None;
                    }
                    queue = self
                        .final_cv
                        .wait(queue)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };
            let Some(coop) = coop else {
                return;
            };

            coop.finalize();

            let remaining = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.coops.remove(&coop.id);
                state.by_name.remove(&coop.name);
                let remaining = state.coops.len();
                if remaining == 0 {
                    self.empty_cv.notify_all();
                }
                remaining
            };

            let reason = coop
                .dereg_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .unwrap_or(DeregReason::Normal);
            if let Some(env) = env.upgrade() {
                env.notify_coop_deregistered(&coop.name, reason, remaining);
            }
        }
    }

    fn enqueue_final_dereg(&self, coop: Arc<CoopRuntime>) {
        let mut queue = self.final_queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(coop);
        self.final_cv.notify_one();
    }

    /// Atomic registration per the two-phase binding protocol.
    pub(crate) fn register(self: &Arc<Self>, coop: Coop) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            return Err(Error::ShuttingDown);
        }
        if state.by_name.contains_key(&coop.name) {
            return Err(Error::CoopNameInUse(coop.name.to_string()));
        }
        if coop.agents.is_empty() {
            return Err(Error::EmptyCoop(coop.name.to_string()));
        }
        let parent = match &coop.parent {
            Some(parent_name) => {
                let id = state
                    .by_name
                    .get(parent_name.as_str())
                    .copied()
                    .ok_or_else(|| Error::CoopNotFound(parent_name.clone()))?;
                Some(Arc::clone(&state.coops[&id]))
            }
            None => None,
        };

        let runtime = Arc::new(CoopRuntime {
            id: coop.id,
            name: Arc::clone(&coop.name),
            env: coop.env.clone(),
            registry: Arc::downgrade(self),
            parent,
            agents: coop.agents,
            usage: AtomicUsize::new(0),
            status: Mutex::new(CoopStatus::Registered),
            dereg_reason: Mutex::new(None),
            disposers: Mutex::new(coop.disposers),
            reg_notificators: coop.reg_notificators,
            dereg_notificators: coop.dereg_notificators,
            exception_reaction: coop.exception_reaction,
            children: Mutex::new(HashSet::new()),
        });
        runtime
            .usage
            .store(runtime.agents.len(), Ordering::Release);
        for (agent, _) in &runtime.agents {
            agent.set_coop(&runtime);
        }

        // Stage 1: agent definition. Failures roll back cleanly.
        for (idx, (agent, _)) in runtime.agents.iter().enumerate() {
            if let Err(err) = agent.run_define() {
                for (agent, _) in &runtime.agents[..=idx] {
                    agent.destroy_subscriptions();
                }
                return Err(Error::RegistrationFailed(format!(
                    "agent definition failed in coop '{}': {err}",
                    runtime.name
                )));
            }
        }

        // Stage 2: resource preallocation on the dispatchers. Failures
        // unbind in reverse order.
        for (idx, (agent, binder)) in runtime.agents.iter().enumerate() {
            if let Err(err) = binder.preallocate(&runtime.env, agent) {
                for (agent, binder) in runtime.agents[..idx].iter().rev() {
                    binder.unbind(agent);
                }
                for (agent, _) in &runtime.agents {
                    agent.destroy_subscriptions();
                }
                return Err(Error::RegistrationFailed(format!(
                    "dispatcher binding failed in coop '{}': {err}",
                    runtime.name
                )));
            }
        }

        // Stage 3: activation. By contract this stage does not fail; the
        // binder aborts the process if the dispatcher refuses the queue.
        for (agent, binder) in &runtime.agents {
            binder.bind(agent);
        }

        state
            .by_name
            .insert(Arc::clone(&runtime.name), runtime.id);
        state.coops.insert(runtime.id, Arc::clone(&runtime));
        if let Some(parent) = &runtime.parent {
            parent.child_registered(runtime.id);
        }
        drop(state);

        for notificator in &runtime.reg_notificators {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                notificator(&runtime.env, &runtime.name)
            }));
            if outcome.is_err() {
                log::error!("panic in reg notificator for coop '{}'", runtime.name);
            }
        }
        runtime.env.notify_coop_registered(&runtime.name);
        Ok(())
    }

    pub(crate) fn deregister_by_name(&self, name: &str, reason: DeregReason) -> Result<()> {
        let coop = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let id = state
                .by_name
                .get(name)
                .copied()
                .ok_or_else(|| Error::CoopNotFound(name.to_string()))?;
            Arc::clone(&state.coops[&id])
        };
        coop.initiate_deregistration(reason);
        Ok(())
    }

    pub(crate) fn deregister_by_id(&self, id: CoopId, reason: DeregReason) {
        let coop = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.coops.get(&id).map(Arc::clone)
        };
        if let Some(coop) = coop {
            coop.initiate_deregistration(reason);
        }
    }

    /// Switches to shutting-down state and deregisters everything.
    pub(crate) fn initiate_total_deregistration(&self) {
        let coops: Vec<Arc<CoopRuntime>> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
            state.coops.values().cloned().collect()
        };
        for coop in coops {
            coop.initiate_deregistration(DeregReason::Shutdown);
        }
    }

    /// Blocks until every cooperation has been finally deregistered.
    pub(crate) fn wait_all_deregistered(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.coops.is_empty() {
            state = self
                .empty_cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.coops.is_empty()
    }

    pub(crate) fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let coops = state.coops.len();
        let agents = state.coops.values().map(|c| c.agent_count()).sum();
        (coops, agents)
    }

    /// Stops the final-deregistration thread. All cooperations must already
    /// be deregistered.
    pub(crate) fn shutdown(&self) {
        self.final_stop.store(true, Ordering::Release);
        self.final_cv.notify_all();
        let handle = {
            let mut thread = self.final_thread.lock().unwrap_or_else(|e| e.into_inner());
            thread.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
