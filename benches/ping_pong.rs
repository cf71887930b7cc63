use conclave::prelude::*;
use conclave::{receive, MboxRef, MchainRef};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::mpsc;
use std::thread::JoinHandle;

struct Ping;
struct Pong;

struct Echo {
    replies: MchainRef,
}

impl Agent for Echo {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        ctx.subscribe_self()
            .event_signal::<Echo, Ping, _>(|this, _ctx| {
                send_signal::<Pong>(&this.replies).expect("reply chain accepts");
            })?;
        Ok(())
    }
}

/// Starts a live environment on a background thread and returns its handle.
fn spawn_environment() -> (Environment, JoinHandle<()>) {
    let (env_tx, env_rx) = mpsc::channel();
    let runner = std::thread::spawn(move || {
        launch_with(EnvironmentParams::new().disable_autoshutdown(), move |env| {
            env_tx.send(env.clone()).expect("benchmark thread is alive");
            Ok(())
        })
        .expect("environment shuts down normally");
    });
    let env = env_rx.recv().expect("environment is constructed");
    (env, runner)
}

fn bench_mchain_roundtrip(c: &mut Criterion) {
    let (env, runner) = spawn_environment();
    let chain = env.create_mchain(ChainParams::unbounded());

    c.bench_function("mchain_roundtrip", |b| {
        b.iter(|| {
            send_signal::<Ping>(&chain).expect("unbounded chain accepts");
            let mut handlers = ChainHandlers::new().on_signal::<Ping, _>(|| {});
            let result = receive(conclave::from(&chain).handle_n(1), &mut handlers);
            assert_eq!(result.handled, 1);
        })
    });

    env.stop();
    runner.join().expect("environment thread exits");
}

fn bench_agent_ping_pong(c: &mut Criterion) {
    let (env, runner) = spawn_environment();
    let replies = env.create_mchain(ChainParams::unbounded());
    let mut coop = env.create_coop("bench_echo");
    let echo = coop.add_agent(Echo {
        replies: replies.clone(),
    });
    env.register_coop(coop).expect("registration succeeds");
    let echo_mbox: MboxRef = echo.direct_mbox();

    c.bench_function("agent_ping_pong", |b| {
        b.iter(|| {
            send_signal::<Ping>(&echo_mbox).expect("agent accepts pings");
            let mut handlers = ChainHandlers::new().on_signal::<Pong, _>(|| {});
            let result = receive(conclave::from(&replies).handle_n(1), &mut handlers);
            assert_eq!(result.handled, 1);
        })
    });

    env.stop();
    runner.join().expect("environment thread exits");
}

criterion_group!(benches, bench_mchain_roundtrip, bench_agent_ping_pong);
criterion_main!(benches);
