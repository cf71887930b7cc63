use conclave::prelude::*;
use conclave::{send_message, Envelope, MboxRef};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Seq(u32);
struct Bump(u32);
struct Unknown(u32);
struct Finish;

struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
    total: u32,
}

impl Agent for Recorder {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event(|this: &mut Recorder, ctx, msg: &Seq| {
                this.seen.lock().unwrap().push(msg.0);
                if this.seen.lock().unwrap().len() == this.total as usize {
                    ctx.deregister_coop().unwrap();
                }
            })?;
        Ok(())
    }
}

#[test]
fn same_producer_same_mbox_is_fifo() {
    const N: u32 = 200;
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = Arc::clone(&seen);
        launch(move |env| {
            let mut coop = env.create_coop("fifo");
            let recorder = coop.add_agent(Recorder { seen, total: N });
            env.register_coop(coop)?;

            for i in 0..N {
                send(&recorder, Seq(i))?;
            }
            Ok(())
        })
        .expect("environment shuts down normally");
    }

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..N).collect::<Vec<_>>());
}

struct Mutator {
    result: Arc<AtomicUsize>,
}

impl Agent for Mutator {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event_mut(|this: &mut Mutator, ctx, msg: &mut Bump| {
                // The handler is the only observer and may mutate freely.
                msg.0 += 1;
                this.result.store(msg.0 as usize, Ordering::SeqCst);
                ctx.deregister_coop().unwrap();
            })?;
        Ok(())
    }
}

#[test]
fn mutable_messages_are_single_owner() {
    let result = Arc::new(AtomicUsize::new(0));

    {
        let result = Arc::clone(&result);
        launch(move |env| {
            let mut coop = env.create_coop("mutable");
            let mutator = coop.add_agent(Mutator { result });
            env.register_coop(coop)?;

            // A mutable envelope with more than one reference is rejected.
            let chain = env.create_mchain(ChainParams::unbounded());
            let envelope = Envelope::mutable(Bump(0));
            let extra_ref = Arc::clone(&envelope);
            assert!(matches!(
                send_message(&chain, envelope),
                Err(Error::MutableNotUnique)
            ));
            drop(extra_ref);

            // Sending a mutable message into a multi-consumer mbox fails.
            let mpmc = env.create_mbox();
            assert!(matches!(
                send_mutable(&mpmc, Bump(0)),
                Err(Error::MutableOnMpmc)
            ));

            send_mutable(&mutator, Bump(41))
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(result.load(Ordering::SeqCst), 42);
}

struct Letterbox {
    regular: Arc<AtomicUsize>,
    dead: Arc<AtomicUsize>,
    board: MboxRef,
}

impl Agent for Letterbox {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        let board = Arc::clone(&self.board);
        ctx.subscribe(&board)
            .event(|this: &mut Letterbox, _ctx, _msg: &Seq| {
                this.regular.fetch_add(1, Ordering::SeqCst);
            })?;
        ctx.subscribe_deadletter(&board, |this: &mut Letterbox, _ctx, msg: &Unknown| {
            this.dead.fetch_add(msg.0 as usize, Ordering::SeqCst);
        })?;
        ctx.subscribe_self()
            .event_signal::<Letterbox, Finish, _>(|_this, ctx| {
                ctx.deregister_coop().unwrap();
            })?;

        assert!(ctx.has_subscription::<Seq>(&board, State::default_state()));
        Ok(())
    }
}

#[test]
fn deadletter_handler_catches_unmatched_messages() {
    let regular = Arc::new(AtomicUsize::new(0));
    let dead = Arc::new(AtomicUsize::new(0));

    {
        let regular = Arc::clone(&regular);
        let dead = Arc::clone(&dead);
        launch(move |env| {
            let board = env.create_mbox();
            let mut coop = env.create_coop("letters");
            let agent = coop.add_agent(Letterbox {
                regular,
                dead,
                board: Arc::clone(&board),
            });
            env.register_coop(coop)?;

            send(&board, Seq(1))?;
            send(&board, Unknown(5))?;
            send_signal::<Finish>(&agent)
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(regular.load(Ordering::SeqCst), 1);
    assert_eq!(dead.load(Ordering::SeqCst), 5);
}

struct Dropper {
    seen: Arc<AtomicUsize>,
    board: MboxRef,
}

struct DropNow;

impl Agent for Dropper {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        let board = Arc::clone(&self.board);
        ctx.subscribe(&board)
            .event(|this: &mut Dropper, _ctx, _msg: &Seq| {
                this.seen.fetch_add(1, Ordering::SeqCst);
            })?;
        ctx.subscribe_self()
            .event_signal::<Dropper, DropNow, _>(move |_this, ctx| {
                ctx.drop_subscription::<Seq>(&board, State::default_state());
                assert!(!ctx.has_subscription::<Seq>(&board, State::default_state()));
                // Delivered after the drop: no subscription left, silently
                // discarded.
                send(&board, Seq(2)).unwrap();
                send_signal::<Finish>(ctx.agent()).unwrap();
            })?
            .event_signal::<Dropper, Finish, _>(|_this, ctx| {
                ctx.deregister_coop().unwrap();
            })?;
        Ok(())
    }
}

#[test]
fn dropped_subscription_stops_new_deliveries() {
    let seen = Arc::new(AtomicUsize::new(0));

    {
        let seen = Arc::clone(&seen);
        launch(move |env| {
            let board = env.create_mbox();
            let mut coop = env.create_coop("dropper");
            let agent = coop.add_agent(Dropper {
                seen,
                board: Arc::clone(&board),
            });
            env.register_coop(coop)?;

            send(&board, Seq(1))?;
            send_signal::<DropNow>(&agent)
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

struct Filtered {
    seen: Arc<Mutex<Vec<u32>>>,
    board: MboxRef,
}

impl Agent for Filtered {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        let board = Arc::clone(&self.board);
        ctx.subscribe(&board)
            .event(|this: &mut Filtered, ctx, msg: &Seq| {
                this.seen.lock().unwrap().push(msg.0);
                if msg.0 == 7 {
                    ctx.deregister_coop().unwrap();
                }
            })?;
        ctx.set_delivery_filter::<Seq, _>(&board, |msg| msg.0 % 2 == 0 || msg.0 == 7)?;

        // Filters are rejected on MPSC mboxes.
        let direct = ctx.direct_mbox();
        assert!(matches!(
            ctx.set_delivery_filter::<Seq, _>(&direct, |_| true),
            Err(Error::DeliveryFilterOnMpsc)
        ));
        Ok(())
    }
}

#[test]
fn delivery_filter_rejects_before_enqueue() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let seen = Arc::clone(&seen);
        launch(move |env| {
            let board = env.create_mbox();
            let mut coop = env.create_coop("filtered");
            coop.add_agent(Filtered {
                seen,
                board: Arc::clone(&board),
            });
            env.register_coop(coop)?;

            for i in 1..=6 {
                send(&board, Seq(i))?;
            }
            send(&board, Seq(7))
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6, 7]);
}
