//! The environment: process-wide root owning the default dispatcher, the
//! timer service, the cooperation registry and the stats controller.
//!
//! There are no hidden globals: everything reachable by agents flows
//! through [`Environment`] handles. [`launch`] constructs the environment,
//! runs the user's init function on the calling thread and then blocks
//! until [`Environment::stop`] is called or, with autoshutdown enabled, the
//! last cooperation is deregistered.

use crate::agent::ExceptionReaction;
use crate::clock::{Clock, MonotonicClock};
use crate::coop::{Coop, CoopId, CoopListener, CoopRegistry, DeregReason};
use crate::dispatcher::{
    DispBinder, Dispatcher, DispatcherParams, OneThreadDispatcher, QueueLockPolicy,
    StdWorkThreadFactory, WorkThreadFactory,
};
use crate::error::Result;
use crate::mbox::{MboxId, MboxRef, MpmcMbox, MpscMbox};
use crate::mchain::{ChainParams, Mchain, MchainRef};
use crate::message::MessageRef;
use crate::sink::MessageSink;
use crate::stats::StatsController;
use crate::subscription::StorageFactory;
use crate::timer::{TimerEngineKind, TimerService, TimerStats};
use crate::trace::{MboxTracing, TraceFilter, Tracer, TracerCore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

pub type DispatcherFactory = Box<dyn FnOnce(&Environment) -> Result<Arc<dyn Dispatcher>> + Send>;

/// Tuning applied once, at environment construction.
pub struct EnvironmentParams {
    tracer: Option<Box<dyn Tracer>>,
    trace_filter: Option<TraceFilter>,
    thread_factory: Arc<dyn WorkThreadFactory>,
    timer_engine: TimerEngineKind,
    storage_factory: StorageFactory,
    exception_reaction: ExceptionReaction,
    autoshutdown: bool,
    coop_listener: Option<Arc<dyn CoopListener>>,
    queue_lock: QueueLockPolicy,
    track_activity: bool,
    clock: Arc<dyn Clock>,
    stats_period: Duration,
    stats_on: bool,
    named_dispatchers: Vec<(String, DispatcherFactory)>,
}

impl Default for EnvironmentParams {
    fn default() -> Self {
        Self {
            tracer: None,
            trace_filter: None,
            thread_factory: Arc::new(StdWorkThreadFactory),
            timer_engine: TimerEngineKind::default(),
            storage_factory: StorageFactory::default(),
            exception_reaction: ExceptionReaction::Abort,
            autoshutdown: true,
            coop_listener: None,
            queue_lock: QueueLockPolicy::default(),
            track_activity: false,
            clock: Arc::new(MonotonicClock::new()),
            stats_period: Duration::from_secs(2),
            stats_on: false,
            named_dispatchers: Vec::new(),
        }
    }
}

impl EnvironmentParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables message delivery tracing; every mbox created afterwards is
    /// built in its traced flavor.
    pub fn tracer(mut self, tracer: Box<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn trace_filter(mut self, filter: TraceFilter) -> Self {
        self.trace_filter = Some(filter);
        self
    }

    pub fn work_thread_factory(mut self, factory: Arc<dyn WorkThreadFactory>) -> Self {
        self.thread_factory = factory;
        self
    }

    pub fn timer_engine(mut self, engine: TimerEngineKind) -> Self {
        self.timer_engine = engine;
        self
    }

    /// Default subscription-storage implementation for new agents.
    pub fn subscription_storage(mut self, factory: StorageFactory) -> Self {
        self.storage_factory = factory;
        self
    }

    /// Environment-wide reaction to a panic escaping an event handler.
    pub fn exception_reaction(mut self, reaction: ExceptionReaction) -> Self {
        self.exception_reaction = reaction;
        self
    }

    /// Keeps the environment running after the last cooperation is gone.
    pub fn disable_autoshutdown(mut self) -> Self {
        self.autoshutdown = false;
        self
    }

    pub fn coop_listener(mut self, listener: Arc<dyn CoopListener>) -> Self {
        self.coop_listener = Some(listener);
        self
    }

    /// Wait policy of the default dispatcher's queue.
    pub fn queue_lock(mut self, policy: QueueLockPolicy) -> Self {
        self.queue_lock = policy;
        self
    }

    pub fn track_activity(mut self, track: bool) -> Self {
        self.track_activity = track;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats_period(mut self, period: Duration) -> Self {
        self.stats_period = period;
        self
    }

    /// Starts runtime-stats distribution right away.
    pub fn turn_stats_on(mut self) -> Self {
        self.stats_on = true;
        self
    }

    /// Registers a named dispatcher; the factory runs during environment
    /// construction.
    pub fn add_dispatcher(mut self, name: impl Into<String>, factory: DispatcherFactory) -> Self {
        self.named_dispatchers.push((name.into(), factory));
        self
    }
}

struct EnvStatus {
    stop_requested: bool,
}

pub(crate) struct EnvInner {
    mbox_ids: AtomicU64,
    agent_ids: AtomicU64,
    coop_ids: AtomicU64,
    tracer: Option<Arc<TracerCore>>,
    thread_factory: Arc<dyn WorkThreadFactory>,
    storage_factory: StorageFactory,
    exception_reaction: ExceptionReaction,
    autoshutdown: bool,
    coop_listener: Option<Arc<dyn CoopListener>>,
    registry: Arc<CoopRegistry>,
    timer: TimerService,
    dispatchers: Mutex<Vec<Arc<dyn Dispatcher>>>,
    named_dispatchers: Mutex<HashMap<String, Arc<dyn Dispatcher>>>,
    default_binder: OnceLock<Arc<dyn DispBinder>>,
    named_mboxes: Mutex<HashMap<String, MboxRef>>,
    stats: OnceLock<StatsController>,
    status: Mutex<EnvStatus>,
    status_changed: Condvar,
}

/// Weak environment handle held by mboxes and infrastructure threads.
#[derive(Clone)]
pub(crate) struct WeakEnv(Weak<EnvInner>);

impl WeakEnv {
    pub(crate) fn upgrade(&self) -> Option<Environment> {
        self.0.upgrade().map(|inner| Environment { inner })
    }

    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(Weak::new())
    }
}

/// Shared handle to the environment.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    fn build(params: EnvironmentParams) -> Result<Environment> {
        let tracer = params
            .tracer
            .map(|tracer| Arc::new(TracerCore::new(tracer, params.trace_filter)));

        let inner = Arc::new(EnvInner {
            mbox_ids: AtomicU64::new(1),
            agent_ids: AtomicU64::new(1),
            coop_ids: AtomicU64::new(1),
            tracer,
            thread_factory: params.thread_factory,
            storage_factory: params.storage_factory,
            exception_reaction: params.exception_reaction,
            autoshutdown: params.autoshutdown,
            coop_listener: params.coop_listener,
            registry: CoopRegistry::new(),
            timer: TimerService::start(params.timer_engine),
            dispatchers: Mutex::new(Vec::new()),
            named_dispatchers: Mutex::new(HashMap::new()),
            default_binder: OnceLock::new(),
            named_mboxes: Mutex::new(HashMap::new()),
            stats: OnceLock::new(),
            status: Mutex::new(EnvStatus {
                stop_requested: false,
            }),
            status_changed: Condvar::new(),
        });
        let env = Environment { inner };

        env.inner.registry.start(&env);

        let default_dispatcher = OneThreadDispatcher::create(
            &env,
            "default",
            DispatcherParams {
                queue_lock: params.queue_lock,
                track_activity: params.track_activity,
                clock: Arc::clone(&params.clock),
            },
        )?;
        let _ = env.inner.default_binder.set(default_dispatcher.binder());

        for (name, factory) in params.named_dispatchers {
            let dispatcher = factory(&env)?;
            let mut named = env
                .inner
                .named_dispatchers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            named.insert(name, dispatcher);
        }

        let stats_mbox = env.create_mbox();
        let controller = StatsController::new(env.downgrade(), stats_mbox, params.stats_period);
        if params.stats_on {
            controller.turn_on();
        }
        let _ = env.inner.stats.set(controller);

        Ok(env)
    }

    pub(crate) fn downgrade(&self) -> WeakEnv {
        WeakEnv(Arc::downgrade(&self.inner))
    }

    fn mbox_tracing(&self) -> MboxTracing {
        MboxTracing::new(self.inner.tracer.clone())
    }

    pub(crate) fn tracer_core(&self) -> Option<Arc<TracerCore>> {
        self.inner.tracer.clone()
    }

    pub(crate) fn next_mbox_id(&self) -> MboxId {
        self.inner.mbox_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_agent_id(&self) -> u64 {
        self.inner.agent_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn work_thread_factory(&self) -> Arc<dyn WorkThreadFactory> {
        Arc::clone(&self.inner.thread_factory)
    }

    pub(crate) fn default_storage_factory(&self) -> StorageFactory {
        self.inner.storage_factory
    }

    pub(crate) fn default_exception_reaction(&self) -> ExceptionReaction {
        match self.inner.exception_reaction {
            ExceptionReaction::Inherit => ExceptionReaction::Abort,
            other => other,
        }
    }

    pub(crate) fn timer(&self) -> &TimerService {
        &self.inner.timer
    }

    pub(crate) fn register_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        let mut dispatchers = self
            .inner
            .dispatchers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        dispatchers.push(dispatcher);
    }

    pub(crate) fn dispatchers(&self) -> Vec<Arc<dyn Dispatcher>> {
        self.inner
            .dispatchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn create_direct_mbox(&self, sink: &Arc<dyn MessageSink>) -> MboxRef {
        Arc::new(MpscMbox::new(
            self.next_mbox_id(),
            self.downgrade(),
            self.mbox_tracing(),
            sink,
        ))
    }

    pub(crate) fn notify_coop_registered(&self, name: &str) {
        if let Some(listener) = &self.inner.coop_listener {
            listener.on_registered(name);
        }
    }

    pub(crate) fn notify_coop_deregistered(
        &self,
        name: &str,
        reason: DeregReason,
        remaining: usize,
    ) {
        if let Some(listener) = &self.inner.coop_listener {
            listener.on_deregistered(name, reason);
        }
        if remaining == 0 && self.inner.autoshutdown {
            self.stop();
        }
    }

    pub(crate) fn coop_counts(&self) -> (usize, usize) {
        self.inner.registry.counts()
    }

    pub(crate) fn timer_stats(&self) -> TimerStats {
        self.inner.timer.stats()
    }

    /// Low-level timer scheduling: delivers `message` to `mbox` after
    /// `delay`, then every `period` until the returned id is released.
    pub fn schedule_timer(
        &self,
        mbox: MboxRef,
        message: MessageRef,
        delay: Duration,
        period: Option<Duration>,
    ) -> Result<crate::timer::TimerId> {
        self.inner.timer.schedule(mbox, message, delay, period)
    }

    /// Anonymous single-shot timer without a cancellation id.
    pub fn single_timer(&self, mbox: MboxRef, message: MessageRef, delay: Duration) -> Result<()> {
        self.inner.timer.single_shot(mbox, message, delay)
    }

    /// Creates an anonymous MPMC mbox.
    pub fn create_mbox(&self) -> MboxRef {
        Arc::new(MpmcMbox::new(
            self.next_mbox_id(),
            None,
            self.downgrade(),
            self.mbox_tracing(),
        ))
    }

    /// Returns the named mbox, creating it on first use.
    pub fn create_named_mbox(&self, name: impl AsRef<str>) -> MboxRef {
        let name = name.as_ref();
        let mut named = self
            .inner
            .named_mboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(mbox) = named.get(name) {
            return Arc::clone(mbox);
        }
        let shared: Arc<str> = Arc::from(name);
        let mbox: MboxRef = Arc::new(MpmcMbox::new(
            self.next_mbox_id(),
            Some(Arc::clone(&shared)),
            self.downgrade(),
            self.mbox_tracing(),
        ));
        named.insert(name.to_string(), Arc::clone(&mbox));
        mbox
    }

    pub fn create_mchain(&self, params: ChainParams) -> MchainRef {
        Mchain::new(
            self.next_mbox_id(),
            self.downgrade(),
            params,
            self.mbox_tracing(),
        )
    }

    /// Starts building a cooperation bound to the default dispatcher.
    pub fn create_coop(&self, name: impl Into<String>) -> Coop {
        let binder = Arc::clone(
            self.inner
                .default_binder
                .get()
                .expect("default dispatcher exists after construction"),
        );
        Coop {
            id: self.inner.coop_ids.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.into()),
            env: self.clone(),
            parent: None,
            default_binder: binder,
            agents: Vec::new(),
            disposers: Vec::new(),
            reg_notificators: Vec::new(),
            dereg_notificators: Vec::new(),
            exception_reaction: ExceptionReaction::Inherit,
        }
    }

    /// Cooperation with a generated unique name.
    pub fn create_coop_autoname(&self) -> Coop {
        let mut coop = self.create_coop("");
        coop.name = Arc::from(format!("__auto_{}", coop.id));
        coop
    }

    /// Atomically registers the cooperation: all agents defined, bound and
    /// started, or none.
    pub fn register_coop(&self, coop: Coop) -> Result<()> {
        self.inner.registry.register(coop)
    }

    pub fn deregister_coop(&self, name: &str, reason: DeregReason) -> Result<()> {
        self.inner.registry.deregister_by_name(name, reason)
    }

    pub(crate) fn deregister_coop_by_id(&self, id: CoopId, reason: DeregReason) -> Result<()> {
        self.inner.registry.deregister_by_id(id, reason);
        Ok(())
    }

    /// Looks up a dispatcher registered in environment params.
    pub fn named_dispatcher(&self, name: &str) -> Option<Arc<dyn Dispatcher>> {
        self.inner
            .named_dispatchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(Arc::clone)
    }

    /// Runtime statistics controller.
    pub fn stats(&self) -> &StatsController {
        self.inner
            .stats
            .get()
            .expect("stats controller exists after construction")
    }

    /// Requests environment shutdown; `launch` then deregisters every
    /// cooperation and joins the infrastructure.
    pub fn stop(&self) {
        let mut status = self.inner.status.lock().unwrap_or_else(|e| e.into_inner());
        status.stop_requested = true;
        self.inner.status_changed.notify_all();
    }

    fn wait_stop_requested(&self) {
        let mut status = self.inner.status.lock().unwrap_or_else(|e| e.into_inner());
        while !status.stop_requested {
            status = self
                .inner
                .status_changed
                .wait(status)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn run_to_completion(&self) {
        self.wait_stop_requested();

        self.inner.registry.initiate_total_deregistration();
        self.inner.registry.wait_all_deregistered();

        if let Some(stats) = self.inner.stats.get() {
            stats.shutdown();
        }
        self.inner.timer.shutdown();

        let dispatchers = {
            let mut dispatchers = self
                .inner
                .dispatchers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *dispatchers)
        };
        for dispatcher in dispatchers.iter().rev() {
            dispatcher.shutdown();
        }

        self.inner.registry.shutdown();
    }
}

/// Builds an environment with default parameters, runs `init` on the
/// calling thread and blocks until shutdown completes.
pub fn launch<F>(init: F) -> Result<()>
where
    F: FnOnce(&Environment) -> Result<()>,
{
    launch_with(EnvironmentParams::default(), init)
}

/// [`launch`] with explicit environment parameters.
///
/// After `init` returns, the call blocks until [`Environment::stop`] is
/// invoked or, with autoshutdown enabled, the last cooperation has been
/// deregistered. On return no framework-owned thread remains.
pub fn launch_with<F>(params: EnvironmentParams, init: F) -> Result<()>
where
    F: FnOnce(&Environment) -> Result<()>,
{
    let env = Environment::build(params)?;
    let init_result = init(&env);
    if init_result.is_err() {
        env.stop();
    }
    env.run_to_completion();
    init_result
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}
