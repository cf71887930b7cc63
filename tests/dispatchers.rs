use conclave::dispatcher::{
    ActiveObjDispatcher, AdvThreadPoolDispatcher, AdvThreadPoolParams, Dispatcher,
    DispatcherParams, NefThreadPoolDispatcher, PoolFifo, StrictlyOrderedDispatcher,
    ThreadPoolDispatcher, ThreadPoolParams,
};
use conclave::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct Work(u32);
struct Finish;

/// Tracks how many handlers of a group run at the same time.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PoolWorker {
    gauge: Arc<Gauge>,
    handled: Arc<AtomicUsize>,
    expected: usize,
}

impl Agent for PoolWorker {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event(|this: &mut PoolWorker, ctx, _msg: &Work| {
                this.gauge.enter();
                std::thread::sleep(Duration::from_millis(10));
                this.gauge.leave();
                if this.handled.fetch_add(1, Ordering::SeqCst) + 1 == this.expected {
                    ctx.environment().stop();
                }
            })?;
        Ok(())
    }
}

#[test]
fn thread_pool_cooperation_fifo_serializes_one_coop() {
    const PER_AGENT: usize = 10;
    let gauge = Arc::new(Gauge::default());
    let handled = Arc::new(AtomicUsize::new(0));

    {
        let gauge = Arc::clone(&gauge);
        let handled = Arc::clone(&handled);
        launch(move |env| {
            let pool = ThreadPoolDispatcher::create(
                env,
                "pool",
                ThreadPoolParams {
                    threads: 4,
                    fifo: PoolFifo::Cooperation,
                    max_demands_at_once: 2,
                    common: DispatcherParams::default(),
                },
            )?;

            let mut coop = env.create_coop("pool_users");
            coop.set_default_binder(pool.binder());
            let a = coop.add_agent(PoolWorker {
                gauge: Arc::clone(&gauge),
                handled: Arc::clone(&handled),
                expected: PER_AGENT * 2,
            });
            let b = coop.add_agent(PoolWorker {
                gauge,
                handled,
                expected: PER_AGENT * 2,
            });
            env.register_coop(coop)?;

            for i in 0..PER_AGENT as u32 {
                send(&a, Work(i))?;
                send(&b, Work(i))?;
            }
            Ok(())
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(handled.load(Ordering::SeqCst), PER_AGENT * 2);
    // Cooperation FIFO: both agents share one queue, handlers never overlap.
    assert_eq!(gauge.max.load(Ordering::SeqCst), 1);
}

#[test]
fn active_obj_runs_agents_on_distinct_threads() {
    const PER_AGENT: usize = 5;
    let gauge = Arc::new(Gauge::default());
    let handled = Arc::new(AtomicUsize::new(0));

    {
        let gauge = Arc::clone(&gauge);
        let handled = Arc::clone(&handled);
        launch(move |env| {
            let disp = ActiveObjDispatcher::create(env, "active", DispatcherParams::default())?;

            let mut coop = env.create_coop("active_users");
            coop.set_default_binder(disp.binder());
            let a = coop.add_agent(PoolWorker {
                gauge: Arc::clone(&gauge),
                handled: Arc::clone(&handled),
                expected: PER_AGENT * 2,
            });
            let b = coop.add_agent(PoolWorker {
                gauge,
                handled,
                expected: PER_AGENT * 2,
            });
            env.register_coop(coop)?;

            for i in 0..PER_AGENT as u32 {
                send(&a, Work(i))?;
                send(&b, Work(i))?;
            }
            Ok(())
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(handled.load(Ordering::SeqCst), PER_AGENT * 2);
    // Two agents, two threads: the handlers overlapped at least once.
    assert!(gauge.max.load(Ordering::SeqCst) >= 2);
}

struct SharedWorker {
    gauge: Arc<Gauge>,
    handled: Arc<AtomicUsize>,
    expected: usize,
}

impl Agent for SharedWorker {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event_shared(|this: &SharedWorker, ctx, _msg: &Work| {
                this.gauge.enter();
                std::thread::sleep(Duration::from_millis(20));
                this.gauge.leave();
                if this.handled.fetch_add(1, Ordering::SeqCst) + 1 == this.expected {
                    ctx.environment().stop();
                }
            })?;
        Ok(())
    }
}

#[test]
fn adv_thread_pool_runs_thread_safe_handlers_in_parallel() {
    const TOTAL: usize = 6;
    let gauge = Arc::new(Gauge::default());
    let handled = Arc::new(AtomicUsize::new(0));

    {
        let gauge = Arc::clone(&gauge);
        let handled = Arc::clone(&handled);
        launch(move |env| {
            let disp = AdvThreadPoolDispatcher::create(
                env,
                "adv",
                AdvThreadPoolParams {
                    threads: 4,
                    common: DispatcherParams::default(),
                },
            )?;

            let mut coop = env.create_coop("adv_users");
            coop.set_default_binder(disp.binder());
            let worker = coop.add_agent(SharedWorker {
                gauge,
                handled,
                expected: TOTAL,
            });
            env.register_coop(coop)?;

            for i in 0..TOTAL as u32 {
                send(&worker, Work(i))?;
            }
            Ok(())
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(handled.load(Ordering::SeqCst), TOTAL);
    // One agent, but thread-safe handlers of it ran concurrently.
    assert!(gauge.max.load(Ordering::SeqCst) >= 2);
}

struct NefWorker {
    finished: Arc<AtomicUsize>,
}

impl Agent for NefWorker {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event(|_this: &mut NefWorker, ctx, _msg: &Work| {
                ctx.deregister_coop().unwrap();
            })?;
        Ok(())
    }

    fn so_evt_finish(&mut self, _ctx: &AgentContext) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn nef_thread_pool_always_delivers_evt_finish() {
    let finished = Arc::new(AtomicUsize::new(0));

    {
        let finished = Arc::clone(&finished);
        launch(move |env| {
            let disp = NefThreadPoolDispatcher::create(
                env,
                "nef",
                ThreadPoolParams {
                    threads: 2,
                    fifo: PoolFifo::Individual,
                    max_demands_at_once: 1,
                    common: DispatcherParams::default(),
                },
            )?;

            let mut coop = env.create_coop("nef_users");
            coop.set_default_binder(disp.binder());
            let worker = coop.add_agent(NefWorker { finished });
            env.register_coop(coop)?;

            send(&worker, Work(0))
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

struct Blocker {
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl Agent for Blocker {
    fn so_evt_start(&mut self, _ctx: &AgentContext) {
        let (flag, cv) = &*self.gate;
        let mut open = flag.lock().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !*open {
            let timeout = deadline.saturating_duration_since(Instant::now());
            let (guard, result) = cv.wait_timeout(open, timeout).unwrap();
            open = guard;
            if result.timed_out() {
                break;
            }
        }
    }
}

struct PrioWorker {
    tag: u8,
    order: Arc<Mutex<Vec<u8>>>,
    total: usize,
}

impl Agent for PrioWorker {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event(|this: &mut PrioWorker, ctx, _msg: &Work| {
                let mut order = this.order.lock().unwrap();
                order.push(this.tag);
                if order.len() == this.total {
                    ctx.environment().stop();
                }
            })?;
        Ok(())
    }
}

#[test]
fn strictly_ordered_dispatcher_prefers_higher_priorities() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));

    {
        let order = Arc::clone(&order);
        let gate = Arc::clone(&gate);
        launch(move |env| {
            let disp = StrictlyOrderedDispatcher::create(
                env,
                "strict",
                DispatcherParams::default(),
            )?;

            let mut coop = env.create_coop("strict_users");
            coop.set_default_binder(disp.binder());
            // The low-priority blocker holds the single worker while the
            // backlog is built up.
            let blocker = coop.add_agent_cfg(
                Blocker {
                    gate: Arc::clone(&gate),
                },
                AgentOptions::new().priority(Priority::P0),
            );
            let low = coop.add_agent_cfg(
                PrioWorker {
                    tag: 0,
                    order: Arc::clone(&order),
                    total: 2,
                },
                AgentOptions::new().priority(Priority::P1),
            );
            let high = coop.add_agent_cfg(
                PrioWorker {
                    tag: 7,
                    order,
                    total: 2,
                },
                AgentOptions::new().priority(Priority::P7),
            );
            env.register_coop(coop)?;
            let _ = blocker;

            // Enqueue low first, then high, while the worker is blocked.
            send(&low, Work(0))?;
            send(&high, Work(0))?;

            let (flag, cv) = &*gate;
            *flag.lock().unwrap() = true;
            cv.notify_all();
            Ok(())
        })
        .expect("environment shuts down normally");
    }

    // Despite arrival order, the higher priority ran first.
    assert_eq!(*order.lock().unwrap(), vec![7, 0]);
}

struct CountingFactory {
    inner: conclave::dispatcher::StdWorkThreadFactory,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl conclave::dispatcher::WorkThreadFactory for CountingFactory {
    fn acquire(
        &self,
        env: &Environment,
    ) -> Result<Box<dyn conclave::dispatcher::WorkThread>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(env)
    }

    fn release(&self, thread: Box<dyn conclave::dispatcher::WorkThread>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.inner.release(thread);
    }
}

struct Oneshot;

impl Agent for Oneshot {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event_signal::<Oneshot, Finish, _>(|_this, ctx| {
                ctx.deregister_coop().unwrap();
            })?;
        Ok(())
    }
}

#[test]
fn custom_work_thread_factory_supplies_every_worker() {
    let acquired = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));

    {
        let factory = Arc::new(CountingFactory {
            inner: conclave::dispatcher::StdWorkThreadFactory,
            acquired: Arc::clone(&acquired),
            released: Arc::clone(&released),
        });
        launch_with(
            EnvironmentParams::new().work_thread_factory(factory),
            |env| {
                let disp = ActiveObjDispatcher::create(env, "counted", DispatcherParams::default())?;
                let mut coop = env.create_coop("counted_users");
                coop.set_default_binder(disp.binder());
                let agent = coop.add_agent(Oneshot);
                env.register_coop(coop)?;
                send_signal::<Finish>(&agent)
            },
        )
        .expect("environment shuts down normally");
    }

    // Default dispatcher worker plus the active-object worker.
    assert!(acquired.load(Ordering::SeqCst) >= 2);
    assert_eq!(
        acquired.load(Ordering::SeqCst),
        released.load(Ordering::SeqCst)
    );
}
