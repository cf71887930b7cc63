use conclave::limits::transformed;
use conclave::prelude::*;
use conclave::MboxRef;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const TOTAL: u32 = 15;
const LIMIT: usize = 10;

struct Reply(u32);
struct LogMessage(u32);

struct Generator {
    consumer: MboxRef,
}

impl Agent for Generator {
    fn so_evt_start(&mut self, _ctx: &AgentContext) {
        // All replies leave in one burst, before the consumer's worker gets
        // a chance to drain anything.
        for seq in 0..TOTAL {
            send(&self.consumer, Reply(seq)).expect("delivery succeeds");
        }
    }
}

struct Consumer {
    logger_mbox: MboxRef,
    seen: Arc<Mutex<Vec<u32>>>,
    done: Arc<AtomicUsize>,
}

impl Agent for Consumer {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        let logger_mbox = Arc::clone(&self.logger_mbox);
        ctx.define_limits(Limits::new().limit_then_transform::<Reply, _>(
            LIMIT,
            move |reply: &Reply| transformed(Arc::clone(&logger_mbox), LogMessage(reply.0)),
        ))?;

        ctx.subscribe_self()
            .event(|this: &mut Consumer, ctx, reply: &Reply| {
                this.seen.lock().unwrap().push(reply.0);
                if this.done.fetch_add(1, Ordering::SeqCst) + 1 == TOTAL as usize {
                    ctx.deregister_coop().unwrap();
                }
            })?;
        Ok(())
    }
}

struct Logger {
    seen: Arc<Mutex<Vec<u32>>>,
    done: Arc<AtomicUsize>,
}

impl Agent for Logger {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        let mbox = ctx.environment().create_named_mbox("overlimit_log");
        ctx.subscribe(&mbox)
            .event(|this: &mut Logger, ctx, log: &LogMessage| {
                this.seen.lock().unwrap().push(log.0);
                if this.done.fetch_add(1, Ordering::SeqCst) + 1 == TOTAL as usize {
                    ctx.deregister_coop().unwrap();
                }
            })?;
        Ok(())
    }
}

#[test]
fn overlimit_replies_are_transformed_into_log_messages() {
    let consumer_seen = Arc::new(Mutex::new(Vec::new()));
    let logger_seen = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    {
        let consumer_seen = Arc::clone(&consumer_seen);
        let logger_seen = Arc::clone(&logger_seen);
        let done = Arc::clone(&done);
        launch(move |env| {
            let logger_mbox = env.create_named_mbox("overlimit_log");

            let mut coop = env.create_coop("overlimit");
            coop.add_agent(Logger {
                seen: logger_seen,
                done: Arc::clone(&done),
            });
            let consumer = coop.add_agent(Consumer {
                logger_mbox,
                seen: consumer_seen,
                done,
            });
            coop.add_agent(Generator {
                consumer: consumer.direct_mbox(),
            });
            env.register_coop(coop)
        })
        .expect("environment shuts down normally");
    }

    let consumer_seen = consumer_seen.lock().unwrap();
    let logger_seen = logger_seen.lock().unwrap();

    // The first LIMIT replies reach the consumer, the overflow lands at the
    // logger, both streams in send order.
    assert_eq!(*consumer_seen, (0..LIMIT as u32).collect::<Vec<_>>());
    assert_eq!(
        *logger_seen,
        (LIMIT as u32..TOTAL).collect::<Vec<_>>()
    );
}
