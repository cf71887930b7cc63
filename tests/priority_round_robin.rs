use conclave::dispatcher::{Dispatcher, DispatcherParams, QuotedRoundRobinDispatcher, QuotedRoundRobinParams};
use conclave::prelude::*;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

// The top-priority lane carries the keeper's and the p7 worker's start
// events in addition to the ten jobs; the quota covers all of them so one
// round drains a whole lane.
const QUOTE: usize = 12;
const PER_PRIO: usize = 10;

struct Job;

/// Holds the single worker inside its start event until the whole backlog
/// has been enqueued.
struct GateKeeper {
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl Agent for GateKeeper {
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

struct Leveled {
    tag: u8,
    order: Arc<Mutex<Vec<u8>>>,
    total: usize,
}

impl Agent for Leveled {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event_signal::<Leveled, Job, _>(|this, ctx| {
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
fn quoted_round_robin_processes_whole_quotas_per_priority() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));

    {
        let order = Arc::clone(&order);
        let gate = Arc::clone(&gate);
        launch(move |env| {
            let disp = QuotedRoundRobinDispatcher::create(
                env,
                "rr",
                QuotedRoundRobinParams {
                    default_quote: QUOTE,
                    quotes: Vec::new(),
                    common: DispatcherParams::default(),
                },
            )?;

            let mut coop = env.create_coop("leveled");
            coop.set_default_binder(disp.binder());
            // The keeper has the highest priority, so its start event is
            // the first demand the worker takes; it then blocks the worker
            // while the backlog is enqueued below it.
            coop.add_agent_cfg(
                GateKeeper {
                    gate: Arc::clone(&gate),
                },
                AgentOptions::new().priority(Priority::P7),
            );
            let p7 = coop.add_agent_cfg(
                Leveled {
                    tag: 7,
                    order: Arc::clone(&order),
                    total: PER_PRIO * 3,
                },
                AgentOptions::new().priority(Priority::P7),
            );
            let p6 = coop.add_agent_cfg(
                Leveled {
                    tag: 6,
                    order: Arc::clone(&order),
                    total: PER_PRIO * 3,
                },
                AgentOptions::new().priority(Priority::P6),
            );
            let p5 = coop.add_agent_cfg(
                Leveled {
                    tag: 5,
                    order,
                    total: PER_PRIO * 3,
                },
                AgentOptions::new().priority(Priority::P5),
            );
            env.register_coop(coop)?;

            // Alternate the three priorities while the worker is held.
            for _ in 0..PER_PRIO {
                send_signal::<Job>(&p7)?;
                send_signal::<Job>(&p6)?;
                send_signal::<Job>(&p5)?;
            }

            let (flag, cv) = &*gate;
            *flag.lock().unwrap() = true;
            cv.notify_all();
            Ok(())
        })
        .expect("environment shuts down normally");
    }

    let order = order.lock().unwrap();
    assert_eq!(order.len(), PER_PRIO * 3);
    // One full quota per priority, highest first, despite the alternating
    // enqueue order.
    assert!(order[..PER_PRIO].iter().all(|tag| *tag == 7));
    assert!(order[PER_PRIO..PER_PRIO * 2].iter().all(|tag| *tag == 6));
    assert!(order[PER_PRIO * 2..].iter().all(|tag| *tag == 5));
}
