//! Agents: lifecycle, subscriptions and the event execution path.
//!
//! An agent is a user struct implementing [`Agent`], owned by a cooperation
//! and executed by a dispatcher. The runtime around it owns the subscription
//! storage, the state chart, the direct mbox and the binding to an event
//! queue. Handlers always run on the worker thread that currently owns the
//! agent; only handlers registered as thread-safe may share it.

mod state;

pub use state::{History, State};
pub(crate) use state::{StateChart, StateHook, DEADLETTER_STATE};
pub use state::StateId;

use crate::coop::{CoopId, CoopRuntime, DeregReason};
use crate::dispatcher::EventQueue;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::limits::{LimitGuard, Limits, LimitStorage};
use crate::mbox::{MboxId, MboxKind, MboxRef};
use crate::message::{Envelope, MessageRef};
use crate::sink::{Demand, MessageSink, SinkId};
use crate::subscription::{
    EventHandler, HandlerAction, SubscrKey, SubscriptionRecord, SubscriptionStorage, ThreadSafety,
};
use crate::timer::TimerId;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

pub type AgentId = u64;

const MAX_TRANSFER_HOPS: usize = 16;
const MAX_HOOK_CHAIN: usize = 64;

/// User-implemented actor.
///
/// All three callbacks default to no-ops. `so_define_agent` is the place to
/// declare limits, build states and create subscriptions; it runs during
/// cooperation registration, before the agent is bound to its dispatcher.
pub trait Agent: Send + 'static {
    fn so_define_agent(&mut self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// First event of the agent, runs exactly once before any handler.
    fn so_evt_start(&mut self, _ctx: &AgentContext) {}

    /// Last event of the agent, runs exactly once after all handlers.
    fn so_evt_finish(&mut self, _ctx: &AgentContext) {}
}

pub(crate) trait AgentObj: Agent {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Agent> AgentObj for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Agent priority, used by the priority-aware dispatchers. `P0` is the
/// lowest and the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

impl Priority {
    pub const LOWEST: Priority = Priority::P0;
    pub const HIGHEST: Priority = Priority::P7;
    pub const COUNT: usize = 8;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Priority> {
        use Priority::*;
        [P0, P1, P2, P3, P4, P5, P6, P7].get(index).copied()
    }
}

/// Reaction to a panic escaping an event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionReaction {
    /// Terminate the process.
    Abort,
    /// Initiate environment shutdown.
    ShutdownEnvironment,
    /// Deregister the agent's cooperation.
    DeregisterCoop,
    /// Log and keep going.
    Ignore,
    /// Use the cooperation's reaction (and transitively the environment's).
    Inherit,
}

/// Per-agent tuning applied at creation.
#[derive(Default)]
pub struct AgentOptions {
    pub(crate) priority: Priority,
    pub(crate) storage: Option<crate::subscription::StorageFactory>,
    pub(crate) exception_reaction: Option<ExceptionReaction>,
}

impl AgentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn subscription_storage(mut self, factory: crate::subscription::StorageFactory) -> Self {
        self.storage = Some(factory);
        self
    }

    pub fn exception_reaction(mut self, reaction: ExceptionReaction) -> Self {
        self.exception_reaction = Some(reaction);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentStatus {
    Created,
    Defined,
    Working,
    Finished,
}

/// Internal message carrying a state time-limit expiration.
struct TimeLimitExpired {
    state: StateId,
    epoch: u64,
}

enum QueueState {
    /// Not yet bound; demands are deferred and replayed after `evt_start`.
    Detached(Vec<Demand>),
    Bound(Arc<dyn EventQueue>),
    Closed,
}

struct AgentInner {
    status: AgentStatus,
    chart: StateChart,
    current_state: StateId,
    storage: Box<dyn SubscriptionStorage>,
    limits: Option<Arc<LimitStorage>>,
    state_timers: HashMap<StateId, TimerId>,
}

pub(crate) struct AgentRuntime {
    id: AgentId,
    env: Environment,
    priority: Priority,
    exception_reaction: ExceptionReaction,
    brain: RwLock<Box<dyn AgentObj>>,
    inner: Mutex<AgentInner>,
    queue: Mutex<QueueState>,
    direct_mbox: OnceLock<MboxRef>,
    sink: OnceLock<Arc<dyn MessageSink>>,
    coop: OnceLock<Weak<CoopRuntime>>,
}

// Safety: the agent object behind `brain` crosses threads only through the
// RwLock. Ordinary handlers and the lifecycle callbacks take the write
// lock, so they own the agent exclusively. The read lock is taken solely
// for handlers registered via `event_shared`/`event_signal_shared`, whose
// registration requires the concrete agent type to be `Sync`.
unsafe impl Sync for AgentRuntime {}

/// Shared handle to an agent.
///
/// A queued execution demand holds one, which keeps the receiver alive until
/// the demand is processed.
#[derive(Clone)]
pub struct AgentRef(pub(crate) Arc<AgentRuntime>);

impl PartialEq for AgentRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for AgentRef {}

impl std::fmt::Debug for AgentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRef").field("id", &self.0.id).finish()
    }
}

struct AgentSink {
    id: SinkId,
    agent: Weak<AgentRuntime>,
}

impl MessageSink for AgentSink {
    fn sink_id(&self) -> SinkId {
        self.id
    }

    fn push(&self, mbox_id: MboxId, message: MessageRef, limit: Option<LimitGuard>) -> Result<()> {
        let Some(agent) = self.agent.upgrade() else {
            return Ok(());
        };
        let demand = Demand::message(AgentRef(Arc::clone(&agent)), mbox_id, message, limit);
        let queue = {
            let mut state = agent.queue.lock().unwrap_or_else(|e| e.into_inner());
            match &mut *state {
                QueueState::Detached(deferred) => {
                    deferred.push(demand);
                    return Ok(());
                }
                QueueState::Bound(q) => Arc::clone(q),
                QueueState::Closed => {
                    log::trace!("demand for finished agent {} dropped", agent.id);
                    return Ok(());
                }
            }
        };
        queue.push(demand)
    }
}

impl AgentRuntime {
    pub(crate) fn create(
        env: &Environment,
        agent: Box<dyn AgentObj>,
        options: AgentOptions,
    ) -> AgentRef {
        let id = env.next_agent_id();
        let storage = options
            .storage
            .unwrap_or_else(|| env.default_storage_factory())
            .create();
        let runtime = Arc::new(AgentRuntime {
            id,
            env: env.clone(),
            priority: options.priority,
            exception_reaction: options
                .exception_reaction
                .unwrap_or(ExceptionReaction::Inherit),
            brain: RwLock::new(agent),
            inner: Mutex::new(AgentInner {
                status: AgentStatus::Created,
                chart: StateChart::new(),
                current_state: 0,
                storage,
                limits: None,
                state_timers: HashMap::new(),
            }),
            queue: Mutex::new(QueueState::Detached(Vec::new())),
            direct_mbox: OnceLock::new(),
            sink: OnceLock::new(),
            coop: OnceLock::new(),
        });

        let sink: Arc<dyn MessageSink> = Arc::new(AgentSink {
            id,
            agent: Arc::downgrade(&runtime),
        });
        let direct = env.create_direct_mbox(&sink);
        // State time limits are delivered through the direct mbox; the
        // subscription exists for the whole agent lifetime so a limit
        // installed during definition is already routable.
        if let Err(err) = direct.subscribe_event_handler(
            TypeId::of::<TimeLimitExpired>(),
            std::any::type_name::<TimeLimitExpired>(),
            None,
            Arc::clone(&sink),
        ) {
            log::error!("cannot install the time-limit route: {err}");
        }
        let _ = runtime.sink.set(sink);
        let _ = runtime.direct_mbox.set(direct);
        AgentRef(runtime)
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, AgentInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sink_ref(&self) -> Arc<dyn MessageSink> {
        Arc::clone(self.sink.get().expect("sink is set at creation"))
    }

    fn direct(&self) -> MboxRef {
        Arc::clone(self.direct_mbox.get().expect("direct mbox is set at creation"))
    }

    fn create_subscription(
        &self,
        mbox: MboxRef,
        type_id: TypeId,
        type_name: &'static str,
        state: StateId,
        handler: EventHandler,
    ) -> Result<()> {
        let mut inner = self.inner();
        let key = SubscrKey {
            mbox_id: mbox.id(),
            type_id,
            state,
        };
        if inner.storage.has(&key) {
            return Err(Error::DuplicateSubscription(format!(
                "mbox {} / {type_name} / state {state}",
                mbox.id()
            )));
        }
        let first_for_type = inner.storage.count_for_type(key.mbox_id, type_id) == 0;
        let limit = if first_for_type {
            inner.limits.as_ref().and_then(|l| l.find(type_id))
        } else {
            None
        };
        inner.storage.insert(SubscriptionRecord {
            key,
            mbox: Arc::clone(&mbox),
            type_name,
            handler: Arc::new(handler),
        });
        if first_for_type {
            if let Err(err) =
                mbox.subscribe_event_handler(type_id, type_name, limit, self.sink_ref())
            {
                inner.storage.remove(&key);
                return Err(err);
            }
        }
        Ok(())
    }

    fn drop_subscription(&self, mbox: &MboxRef, type_id: TypeId, state: StateId) {
        let mut inner = self.inner();
        let key = SubscrKey {
            mbox_id: mbox.id(),
            type_id,
            state,
        };
        if inner.storage.remove(&key).is_some()
            && inner.storage.count_for_type(key.mbox_id, type_id) == 0
        {
            mbox.unsubscribe_event_handlers(type_id, self.id);
        }
    }

    fn drop_subscription_for_all_states(&self, mbox: &MboxRef, type_id: TypeId) {
        let mut inner = self.inner();
        let mbox_id = mbox.id();
        let removed = inner.storage.remove_all_states(mbox_id, type_id);
        let deadletter_left = inner.storage.has(&SubscrKey {
            mbox_id,
            type_id,
            state: DEADLETTER_STATE,
        });
        if !removed.is_empty() && !deadletter_left {
            mbox.unsubscribe_event_handlers(type_id, self.id);
        }
    }

    /// Resolves the handler for `(mbox, type)` against the current state
    /// chain; falls back to the deadletter handler.
    fn resolve_handler(
        &self,
        mbox_id: MboxId,
        type_id: TypeId,
    ) -> Option<(Arc<EventHandler>, bool)> {
        let inner = self.inner();
        for state in inner.chart.path_to_root(inner.current_state) {
            let key = SubscrKey {
                mbox_id,
                type_id,
                state,
            };
            if let Some(record) = inner.storage.find(&key) {
                return Some((Arc::clone(&record.handler), false));
            }
        }
        let key = SubscrKey {
            mbox_id,
            type_id,
            state: DEADLETTER_STATE,
        };
        inner
            .storage
            .find(&key)
            .map(|record| (Arc::clone(&record.handler), true))
    }

    /// Structural part of a state change. Hooks are collected into `ctx`
    /// and run by the caller while it holds the agent.
    fn change_state_core(&self, ctx: &AgentContext, target: State) -> Result<()> {
        let mut inner = self.inner();
        if !inner.chart.is_valid(target.id) {
            return Err(Error::UnknownState);
        }
        let plan = inner.chart.plan_transition(inner.current_state, target.id)?;
        if plan.is_noop() {
            return Ok(());
        }
        let old_leaf = inner.current_state;
        inner.chart.record_history(old_leaf);

        for &s in &plan.exited {
            if let Some(timer) = inner.state_timers.remove(&s) {
                timer.release();
            }
            if let Some(hook) = inner.chart.node(s).on_exit.clone() {
                ctx.push_hook(hook);
            }
        }
        for &s in &plan.entered {
            let (epoch, on_enter, time_limit) = {
                let node = inner.chart.node_mut(s);
                node.activation_epoch += 1;
                (node.activation_epoch, node.on_enter.clone(), node.time_limit)
            };
            if let Some(hook) = on_enter {
                ctx.push_hook(hook);
            }
            if let Some((duration, _)) = time_limit {
                let message = Envelope::immutable(TimeLimitExpired { state: s, epoch });
                match self.env.timer().schedule(self.direct(), message, duration, None) {
                    Ok(timer) => {
                        inner.state_timers.insert(s, timer);
                    }
                    Err(err) => {
                        log::error!("cannot install state time limit: {err}");
                    }
                }
            }
        }
        inner.current_state = plan.new_leaf;
        Ok(())
    }

    fn apply_pending(&self, brain: &mut dyn AgentObj, ctx: &AgentContext) {
        let mut iterations = 0usize;
        while let Some(hook) = ctx.take_hook() {
            iterations += 1;
            if iterations > MAX_HOOK_CHAIN {
                log::error!("state enter/exit hook chain is too long; remaining hooks dropped");
                ctx.clear_hooks();
                return;
            }
            hook(brain.as_any_mut(), ctx);
        }
    }

    fn handle_time_limit(self: &Arc<Self>, expired: &TimeLimitExpired) {
        let target = {
            let inner = self.inner();
            if !inner.chart.is_valid(expired.state) {
                return;
            }
            let node = inner.chart.node(expired.state);
            let still_active = node.activation_epoch == expired.epoch
                && inner
                    .chart
                    .path_to_root(inner.current_state)
                    .contains(&expired.state);
            match (still_active, node.time_limit) {
                (true, Some((_, target))) => target,
                _ => return,
            }
        };
        let agent = AgentRef(Arc::clone(self));
        let ctx = AgentContext::new(agent, Phase::Event);
        if let Err(err) = ctx.change_state(State { id: target }) {
            log::error!("state time limit transition failed: {err}");
            return;
        }
        let mut brain = self.brain.write().unwrap_or_else(|e| e.into_inner());
        self.apply_pending(&mut **brain, &ctx);
    }

    fn trace_deadletter(&self, mbox_id: MboxId, message: &MessageRef, handled: bool) {
        if let Some(core) = self.env.tracer_core() {
            core.emit(&crate::trace::TraceEvent {
                op: if handled {
                    "deadletter.handled"
                } else {
                    "deadletter.dropped"
                },
                mbox_id,
                mbox_name: "",
                msg_type: message.type_name(),
                agent: Some(self.id),
                extra: None,
            });
        }
    }
}

impl AgentRef {
    pub fn id(&self) -> AgentId {
        self.0.id
    }

    /// The agent's direct MPSC mbox.
    pub fn direct_mbox(&self) -> MboxRef {
        self.0.direct()
    }

    pub(crate) fn priority(&self) -> Priority {
        self.0.priority
    }

    pub(crate) fn environment(&self) -> &Environment {
        &self.0.env
    }

    pub(crate) fn coop_id(&self) -> Option<CoopId> {
        self.0
            .coop
            .get()
            .and_then(Weak::upgrade)
            .map(|coop| coop.id())
    }

    pub(crate) fn set_coop(&self, coop: &Arc<CoopRuntime>) {
        let _ = self.0.coop.set(Arc::downgrade(coop));
    }

    pub(crate) fn exception_reaction(&self) -> ExceptionReaction {
        match self.0.exception_reaction {
            ExceptionReaction::Inherit => self
                .0
                .coop
                .get()
                .and_then(Weak::upgrade)
                .map(|coop| coop.exception_reaction())
                .unwrap_or_else(|| self.0.env.default_exception_reaction()),
            other => other,
        }
    }

    /// Runs `so_define_agent` during cooperation registration.
    pub(crate) fn run_define(&self) -> Result<()> {
        let ctx = AgentContext::new(self.clone(), Phase::Define);
        let define_result = {
            let mut brain = self.0.brain.write().unwrap_or_else(|e| e.into_inner());
            let result = brain.so_define_agent(&ctx);
            self.0.apply_pending(&mut **brain, &ctx);
            result
        };
        define_result?;

        let mut inner = self.0.inner();
        inner.status = AgentStatus::Defined;
        Ok(())
    }

    /// Installs the event queue, pushes `evt_start` and replays demands
    /// that arrived while the agent was being registered.
    pub(crate) fn bind_queue(&self, queue: Arc<dyn EventQueue>) -> Result<()> {
        let deferred = {
            let mut state = self.0.queue.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, QueueState::Bound(Arc::clone(&queue))) {
                QueueState::Detached(deferred) => deferred,
                other => {
                    *state = other;
                    return Err(Error::NotBound);
                }
            }
        };
        queue.push_evt_start(Demand::evt_start(self.clone()))?;
        for demand in deferred {
            queue.push(demand)?;
        }
        Ok(())
    }

    pub(crate) fn push_evt_finish(&self) -> bool {
        let queue = {
            let state = self.0.queue.lock().unwrap_or_else(|e| e.into_inner());
            match &*state {
                QueueState::Bound(q) => Arc::clone(q),
                _ => return false,
            }
        };
        queue.push_evt_finish(Demand::evt_finish(self.clone()));
        true
    }

    pub(crate) fn unbind_queue(&self) {
        let mut state = self.0.queue.lock().unwrap_or_else(|e| e.into_inner());
        *state = QueueState::Closed;
    }

    /// Unsubscribes every live `(mbox, type)` pair exactly once and releases
    /// remaining state timers. Runs during final deregistration.
    pub(crate) fn destroy_subscriptions(&self) {
        let mut inner = self.0.inner();
        for (_, timer) in inner.state_timers.drain() {
            timer.release();
        }
        let records = inner.storage.drain();
        drop(inner);

        let mut seen: Vec<(MboxId, TypeId)> = Vec::new();
        for record in records {
            let pair = (record.key.mbox_id, record.key.type_id);
            if !seen.contains(&pair) {
                seen.push(pair);
                record.mbox.unsubscribe_event_handlers(record.key.type_id, self.0.id);
            }
        }
    }

    pub(crate) fn run_evt_start(&self) {
        {
            let mut inner = self.0.inner();
            inner.status = AgentStatus::Working;
        }
        let ctx = AgentContext::new(self.clone(), Phase::Event);
        let mut brain = self.0.brain.write().unwrap_or_else(|e| e.into_inner());
        brain.so_evt_start(&ctx);
        self.0.apply_pending(&mut **brain, &ctx);
    }

    pub(crate) fn run_evt_finish(&self) {
        // The cooperation must learn about the finished agent even when the
        // finish handler panics.
        struct FinishGuard(Option<Arc<CoopRuntime>>);
        impl Drop for FinishGuard {
            fn drop(&mut self) {
                if let Some(coop) = self.0.take() {
                    coop.agent_finished();
                }
            }
        }
        let _guard = FinishGuard(self.0.coop.get().and_then(Weak::upgrade));

        let ctx = AgentContext::new(self.clone(), Phase::Event);
        {
            let mut brain = self.0.brain.write().unwrap_or_else(|e| e.into_inner());
            brain.so_evt_finish(&ctx);
            self.0.apply_pending(&mut **brain, &ctx);
        }
        let mut inner = self.0.inner();
        inner.status = AgentStatus::Finished;
    }

    pub(crate) fn exec_message(&self, mbox_id: MboxId, message: &MessageRef) {
        {
            let inner = self.0.inner();
            if inner.status != AgentStatus::Working {
                return;
            }
        }

        if message.type_id() == TypeId::of::<TimeLimitExpired>() {
            if let Some(expired) = message.downcast_ref::<TimeLimitExpired>() {
                self.0.handle_time_limit(expired);
            }
            return;
        }

        let mut hops = 0usize;
        loop {
            let Some((handler, is_deadletter)) =
                self.0.resolve_handler(mbox_id, message.type_id())
            else {
                self.0.trace_deadletter(mbox_id, message, false);
                return;
            };
            if is_deadletter {
                self.0.trace_deadletter(mbox_id, message, true);
            }

            match &handler.action {
                HandlerAction::Exclusive(run) => {
                    let ctx = AgentContext::new(self.clone(), Phase::Event);
                    let mut brain = self.0.brain.write().unwrap_or_else(|e| e.into_inner());
                    run(brain.as_any_mut(), &ctx, message);
                    self.0.apply_pending(&mut **brain, &ctx);
                    return;
                }
                HandlerAction::Shared(run) => {
                    let ctx = AgentContext::new(self.clone(), Phase::SharedEvent);
                    let brain = self.0.brain.read().unwrap_or_else(|e| e.into_inner());
                    run(brain.as_any(), &ctx, message);
                    return;
                }
                HandlerAction::JustSwitchTo(target) => {
                    self.switch_and_apply(*target);
                    return;
                }
                HandlerAction::TransferTo(target) => {
                    hops += 1;
                    if hops > MAX_TRANSFER_HOPS {
                        log::error!(
                            "transfer_to_state loop detected; msg_type: {}",
                            message.type_name()
                        );
                        return;
                    }
                    self.switch_and_apply(*target);
                    // Search again in the new state chain.
                    continue;
                }
            }
        }
    }

    fn switch_and_apply(&self, target: State) {
        let ctx = AgentContext::new(self.clone(), Phase::Event);
        if let Err(err) = ctx.change_state(target) {
            log::error!("state switch failed: {err}");
            return;
        }
        let mut brain = self.0.brain.write().unwrap_or_else(|e| e.into_inner());
        self.0.apply_pending(&mut **brain, &ctx);
    }

    /// Thread-safety of the next demand, used by the adv-thread-pool.
    pub(crate) fn demand_thread_safety(&self, demand: &Demand) -> ThreadSafety {
        use crate::sink::DemandKind;
        match demand.kind {
            DemandKind::EvtStart | DemandKind::EvtFinish => ThreadSafety::Exclusive,
            DemandKind::Message => match &demand.message {
                Some(message) => self
                    .0
                    .resolve_handler(demand.mbox_id, message.type_id())
                    .map(|(handler, _)| handler.thread_safety())
                    .unwrap_or(ThreadSafety::Exclusive),
                None => ThreadSafety::Exclusive,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Define,
    Event,
    SharedEvent,
}

/// Handle given to every agent callback.
///
/// Wraps the agent's runtime and exposes the authoring surface:
/// subscriptions, state operations and environment access. Contexts are
/// created per callback invocation and never escape the worker thread.
pub struct AgentContext {
    agent: AgentRef,
    phase: Phase,
    pending: RefCell<VecDeque<StateHook>>,
}

impl AgentContext {
    fn new(agent: AgentRef, phase: Phase) -> Self {
        Self {
            agent,
            phase,
            pending: RefCell::new(VecDeque::new()),
        }
    }

    fn push_hook(&self, hook: StateHook) {
        self.pending.borrow_mut().push_back(hook);
    }

    fn take_hook(&self) -> Option<StateHook> {
        self.pending.borrow_mut().pop_front()
    }

    fn clear_hooks(&self) {
        self.pending.borrow_mut().clear();
    }

    fn require_define(&self) -> Result<()> {
        if self.phase == Phase::Define {
            Ok(())
        } else {
            Err(Error::NotInDefinition)
        }
    }

    pub fn agent(&self) -> &AgentRef {
        &self.agent
    }

    pub fn environment(&self) -> Environment {
        self.agent.0.env.clone()
    }

    pub fn direct_mbox(&self) -> MboxRef {
        self.agent.0.direct()
    }

    /// Declares the agent's message limits. Allowed only during definition
    /// and only before the first subscription.
    pub fn define_limits(&self, limits: Limits) -> Result<()> {
        self.require_define()?;
        let mut inner = self.agent.0.inner();
        if inner.limits.is_some() || inner.storage.len() != 0 {
            return Err(Error::LimitsFrozen);
        }
        inner.limits = LimitStorage::build(limits)?;
        Ok(())
    }

    /// Starts building a new state.
    pub fn state(&self, name: impl Into<String>) -> StateBuilder<'_> {
        StateBuilder {
            ctx: self,
            name: name.into(),
            parent: None,
            history: History::None,
        }
    }

    /// Declares `child` as the substate entered when activation reaches the
    /// composite `parent`.
    pub fn set_initial_substate(&self, parent: State, child: State) -> Result<()> {
        self.require_define()?;
        let mut inner = self.agent.0.inner();
        inner.chart.set_initial(parent.id, child.id)
    }

    pub fn on_enter<A, F>(&self, state: State, hook: F) -> Result<()>
    where
        A: Agent,
        F: Fn(&mut A, &AgentContext) + Send + Sync + 'static,
    {
        self.set_hook(state, true, hook)
    }

    pub fn on_exit<A, F>(&self, state: State, hook: F) -> Result<()>
    where
        A: Agent,
        F: Fn(&mut A, &AgentContext) + Send + Sync + 'static,
    {
        self.set_hook(state, false, hook)
    }

    fn set_hook<A, F>(&self, state: State, enter: bool, hook: F) -> Result<()>
    where
        A: Agent,
        F: Fn(&mut A, &AgentContext) + Send + Sync + 'static,
    {
        self.require_define()?;
        let mut inner = self.agent.0.inner();
        if !inner.chart.is_valid(state.id) {
            return Err(Error::UnknownState);
        }
        let wrapped: StateHook = Arc::new(move |agent, ctx| {
            if let Some(agent) = agent.downcast_mut::<A>() {
                hook(agent, ctx);
            }
        });
        let node = inner.chart.node_mut(state.id);
        if enter {
            node.on_enter = Some(wrapped);
        } else {
            node.on_exit = Some(wrapped);
        }
        Ok(())
    }

    /// Limits the time the agent may stay in `state`; on expiry the agent
    /// switches to `target`. A stale expiration after the state was left is
    /// ignored.
    pub fn set_state_time_limit(
        &self,
        state: State,
        duration: Duration,
        target: State,
    ) -> Result<()> {
        self.require_define()?;
        let mut inner = self.agent.0.inner();
        if !inner.chart.is_valid(state.id) || !inner.chart.is_valid(target.id) {
            return Err(Error::UnknownState);
        }
        inner.chart.node_mut(state.id).time_limit = Some((duration, target.id));
        Ok(())
    }

    /// Switches the agent to `target`.
    ///
    /// The structural change is immediate; enter/exit hooks run after the
    /// current handler returns and always before the next handler dispatch.
    pub fn change_state(&self, target: State) -> Result<()> {
        if self.phase == Phase::SharedEvent {
            return Err(Error::StateChangeFromSharedHandler);
        }
        self.agent.0.change_state_core(self, target)
    }

    pub fn current_state(&self) -> State {
        let inner = self.agent.0.inner();
        State {
            id: inner.current_state,
        }
    }

    /// True when `state` is the current state or an ancestor of it.
    pub fn is_in_state(&self, state: State) -> bool {
        let inner = self.agent.0.inner();
        inner
            .chart
            .path_to_root(inner.current_state)
            .contains(&state.id)
    }

    pub fn state_name(&self, state: State) -> Result<String> {
        let inner = self.agent.0.inner();
        if !inner.chart.is_valid(state.id) {
            return Err(Error::UnknownState);
        }
        Ok(inner.chart.full_name(state.id))
    }

    /// Starts a subscription on the given mbox in the default state.
    pub fn subscribe(&self, mbox: &MboxRef) -> Subscribe<'_> {
        Subscribe {
            ctx: self,
            mbox: Arc::clone(mbox),
            state: 0,
        }
    }

    /// Subscription on the agent's direct mbox.
    pub fn subscribe_self(&self) -> Subscribe<'_> {
        Subscribe {
            ctx: self,
            mbox: self.agent.0.direct(),
            state: 0,
        }
    }

    /// Installs a deadletter handler for `(mbox, M)`: it runs when a message
    /// arrives and no state in the current chain has a subscription.
    pub fn subscribe_deadletter<A, M, F>(&self, mbox: &MboxRef, handler: F) -> Result<()>
    where
        A: Agent,
        M: Send + Sync + 'static,
        F: Fn(&mut A, &AgentContext, &M) + Send + Sync + 'static,
    {
        let action = HandlerAction::Exclusive(Box::new(move |agent, ctx, envelope| {
            let Some(agent) = agent.downcast_mut::<A>() else {
                return;
            };
            let Some(message) = envelope.downcast_ref::<M>() else {
                return;
            };
            handler(agent, ctx, message);
        }));
        self.agent.0.create_subscription(
            Arc::clone(mbox),
            TypeId::of::<M>(),
            std::any::type_name::<M>(),
            DEADLETTER_STATE,
            EventHandler { action },
        )
    }

    pub fn drop_deadletter_handler<M: 'static>(&self, mbox: &MboxRef) {
        self.agent
            .0
            .drop_subscription(mbox, TypeId::of::<M>(), DEADLETTER_STATE);
    }

    pub fn has_subscription<M: 'static>(&self, mbox: &MboxRef, state: State) -> bool {
        let inner = self.agent.0.inner();
        inner.storage.has(&SubscrKey {
            mbox_id: mbox.id(),
            type_id: TypeId::of::<M>(),
            state: state.id,
        })
    }

    /// Removes the subscription for `(mbox, M, state)`.
    ///
    /// Demands already queued before the call may still fire; no new
    /// delivery of the triple will reach the agent afterwards.
    pub fn drop_subscription<M: 'static>(&self, mbox: &MboxRef, state: State) {
        self.agent
            .0
            .drop_subscription(mbox, TypeId::of::<M>(), state.id);
    }

    pub fn drop_subscription_for_all_states<M: 'static>(&self, mbox: &MboxRef) {
        self.agent
            .0
            .drop_subscription_for_all_states(mbox, TypeId::of::<M>());
    }

    /// Installs a delivery filter for messages of type `M` on an MPMC mbox.
    pub fn set_delivery_filter<M, F>(&self, mbox: &MboxRef, filter: F) -> Result<()>
    where
        M: Send + Sync + 'static,
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        mbox.set_delivery_filter(
            TypeId::of::<M>(),
            Box::new(move |envelope| envelope.downcast_ref::<M>().map(&filter).unwrap_or(false)),
            self.agent.0.id,
        )
    }

    pub fn drop_delivery_filter<M: 'static>(&self, mbox: &MboxRef) {
        mbox.drop_delivery_filter(TypeId::of::<M>(), self.agent.0.id);
    }

    /// Deregisters the agent's own cooperation.
    pub fn deregister_coop(&self) -> Result<()> {
        let coop = self
            .agent
            .0
            .coop
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::NotBound)?;
        self.environment().deregister_coop_by_id(coop.id(), DeregReason::Normal)
    }
}

/// Builder for a new state, usable only during agent definition.
pub struct StateBuilder<'a> {
    ctx: &'a AgentContext,
    name: String,
    parent: Option<State>,
    history: History,
}

impl StateBuilder<'_> {
    pub fn child_of(mut self, parent: State) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn shallow_history(mut self) -> Self {
        self.history = History::Shallow;
        self
    }

    pub fn deep_history(mut self) -> Self {
        self.history = History::Deep;
        self
    }

    pub fn build(self) -> Result<State> {
        self.ctx.require_define()?;
        let mut inner = self.ctx.agent.0.inner();
        let id = inner
            .chart
            .add_state(self.name, self.parent.map(|s| s.id), self.history)?;
        Ok(State { id })
    }
}

/// Subscription builder returned by [`AgentContext::subscribe`].
pub struct Subscribe<'a> {
    ctx: &'a AgentContext,
    mbox: MboxRef,
    state: StateId,
}

impl<'a> Subscribe<'a> {
    /// Restricts the subscription to `state` instead of the default state.
    pub fn in_state(mut self, state: State) -> Self {
        self.state = state.id;
        self
    }

    fn install<M: 'static>(self, action: HandlerAction) -> Result<Self> {
        self.ctx.agent.0.create_subscription(
            Arc::clone(&self.mbox),
            TypeId::of::<M>(),
            std::any::type_name::<M>(),
            self.state,
            EventHandler { action },
        )?;
        Ok(self)
    }

    /// Subscribes an ordinary event handler.
    pub fn event<A, M, F>(self, handler: F) -> Result<Self>
    where
        A: Agent,
        M: Send + Sync + 'static,
        F: Fn(&mut A, &AgentContext, &M) + Send + Sync + 'static,
    {
        self.install::<M>(HandlerAction::Exclusive(Box::new(
            move |agent, ctx, envelope| {
                let Some(agent) = agent.downcast_mut::<A>() else {
                    return;
                };
                let Some(message) = envelope.downcast_ref::<M>() else {
                    return;
                };
                handler(agent, ctx, message);
            },
        )))
    }

    /// Subscribes a handler for a mutable message. Only valid on MPSC
    /// mboxes (such as the agent's direct mbox) and on mchains.
    pub fn event_mut<A, M, F>(self, handler: F) -> Result<Self>
    where
        A: Agent,
        M: Send + 'static,
        F: Fn(&mut A, &AgentContext, &mut M) + Send + Sync + 'static,
    {
        if self.mbox.kind() == MboxKind::MultiProducerMultiConsumer {
            return Err(Error::MutableOnMpmc);
        }
        self.install::<M>(HandlerAction::Exclusive(Box::new(
            move |agent, ctx, envelope| {
                let Some(agent) = agent.downcast_mut::<A>() else {
                    return;
                };
                envelope.with_mut(|message: &mut M| handler(agent, ctx, message));
            },
        )))
    }

    /// Subscribes a signal handler.
    pub fn event_signal<A, S, F>(self, handler: F) -> Result<Self>
    where
        A: Agent,
        S: 'static,
        F: Fn(&mut A, &AgentContext) + Send + Sync + 'static,
    {
        self.install::<S>(HandlerAction::Exclusive(Box::new(
            move |agent, ctx, _envelope| {
                if let Some(agent) = agent.downcast_mut::<A>() {
                    handler(agent, ctx);
                }
            },
        )))
    }

    /// Subscribes a thread-safe handler: it takes the agent by shared
    /// reference and may run concurrently with other thread-safe handlers
    /// on the adv-thread-pool dispatcher.
    pub fn event_shared<A, M, F>(self, handler: F) -> Result<Self>
    where
        A: Agent + Sync,
        M: Send + Sync + 'static,
        F: Fn(&A, &AgentContext, &M) + Send + Sync + 'static,
    {
        self.install::<M>(HandlerAction::Shared(Box::new(
            move |agent, ctx, envelope| {
                let Some(agent) = agent.downcast_ref::<A>() else {
                    return;
                };
                let Some(message) = envelope.downcast_ref::<M>() else {
                    return;
                };
                handler(agent, ctx, message);
            },
        )))
    }

    /// Thread-safe signal handler.
    pub fn event_signal_shared<A, S, F>(self, handler: F) -> Result<Self>
    where
        A: Agent + Sync,
        S: 'static,
        F: Fn(&A, &AgentContext) + Send + Sync + 'static,
    {
        self.install::<S>(HandlerAction::Shared(Box::new(
            move |agent, ctx, _envelope| {
                if let Some(agent) = agent.downcast_ref::<A>() {
                    handler(agent, ctx);
                }
            },
        )))
    }

    /// On arrival of `M`, switch to `target` and search for the handler
    /// again in the new state chain.
    pub fn transfer_to_state<M: 'static>(self, target: State) -> Result<Self> {
        self.install::<M>(HandlerAction::TransferTo(target))
    }

    /// On arrival of `M`, just switch to `target`; the event is consumed.
    pub fn just_switch_to<M: 'static>(self, target: State) -> Result<Self> {
        self.install::<M>(HandlerAction::JustSwitchTo(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_and_indexing() {
        assert!(Priority::P7 > Priority::P0);
        assert_eq!(Priority::HIGHEST.index(), 7);
        assert_eq!(Priority::from_index(3), Some(Priority::P3));
        assert_eq!(Priority::from_index(8), None);
        assert_eq!(Priority::default(), Priority::P0);
    }
}
