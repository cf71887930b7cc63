use conclave::prelude::*;
use conclave::{receive, ReceiveStatus, TimerEngineKind};
use std::time::Duration;

struct Tick(u32);
struct Beat;

fn timer_roundtrip(engine: TimerEngineKind) {
    launch_with(EnvironmentParams::new().timer_engine(engine), |env| {
        let chain = env.create_mchain(ChainParams::unbounded());

        // A cancelled periodic timer never fires.
        let cancelled = send_periodic(&chain, Duration::from_millis(30), Duration::from_millis(30), Tick(99))?;
        cancelled.release();

        send_delayed(&chain, Duration::from_millis(40), Tick(1))?;

        let mut ticks = Vec::new();
        {
            let mut handlers = ChainHandlers::new().on(|tick: &Tick| ticks.push(tick.0));
            let result = receive(
                conclave::from(&chain)
                    .handle_n(1)
                    .empty_timeout(Duration::from_secs(2)),
                &mut handlers,
            );
            assert_eq!(result.status, ReceiveStatus::Handled);
        }
        assert_eq!(ticks, vec![1]);

        // Nothing else arrives: the cancelled timer stayed silent.
        let mut handlers = ChainHandlers::new().on(|_tick: &Tick| {});
        let result = receive(
            conclave::from(&chain)
                .handle_n(1)
                .empty_timeout(Duration::from_millis(150)),
            &mut handlers,
        );
        assert_eq!(result.status, ReceiveStatus::TimedOut);
        assert_eq!(result.extracted, 0);

        env.stop();
        Ok(())
    })
    .expect("environment shuts down normally");
}

#[test]
fn wheel_engine_delivers_and_cancels() {
    timer_roundtrip(TimerEngineKind::Wheel {
        wheel_size: 64,
        granularity: Duration::from_millis(5),
    });
}

#[test]
fn heap_engine_delivers_and_cancels() {
    timer_roundtrip(TimerEngineKind::Heap);
}

#[test]
fn list_engine_delivers_and_cancels() {
    timer_roundtrip(TimerEngineKind::List);
}

#[test]
fn periodic_timer_repeats_until_released() {
    launch(|env| {
        let chain = env.create_mchain(ChainParams::unbounded());
        let beat = send_periodic_signal::<Beat>(
            &chain,
            Duration::from_millis(10),
            Duration::from_millis(10),
        )?;

        let mut beats = 0usize;
        {
            let mut handlers = ChainHandlers::new().on_signal::<Beat, _>(|| beats += 1);
            let result = receive(
                conclave::from(&chain)
                    .handle_n(3)
                    .empty_timeout(Duration::from_secs(2)),
                &mut handlers,
            );
            assert_eq!(result.status, ReceiveStatus::Handled);
        }
        assert_eq!(beats, 3);

        beat.release();
        assert!(!beat.is_active());

        // Drain any fire already in flight, then verify silence.
        let mut drainer = ChainHandlers::new().on_signal::<Beat, _>(|| {});
        let drained = receive(
            conclave::from(&chain)
                .handle_all()
                .empty_timeout(Duration::from_millis(100)),
            &mut drainer,
        );
        assert_eq!(drained.status, ReceiveStatus::TimedOut);

        let silent = receive(
            conclave::from(&chain)
                .handle_n(1)
                .empty_timeout(Duration::from_millis(100)),
            &mut drainer,
        );
        assert_eq!(silent.status, ReceiveStatus::TimedOut);
        assert_eq!(silent.extracted, 0);

        env.stop();
        Ok(())
    })
    .expect("environment shuts down normally");
}

#[test]
fn periodic_mutable_messages_are_rejected() {
    launch(|env| {
        let chain = env.create_mchain(ChainParams::unbounded());
        let outcome = env.schedule_timer(
            chain.as_mbox(),
            conclave::Envelope::mutable(Tick(1)),
            Duration::from_millis(10),
            Some(Duration::from_millis(10)),
        );
        assert!(matches!(outcome, Err(Error::MutablePeriodic)));
        env.stop();
        Ok(())
    })
    .expect("environment shuts down normally");
}
