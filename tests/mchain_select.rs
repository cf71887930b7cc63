use conclave::prelude::*;
use conclave::{receive, select, SelectStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Job(u32);
struct Note(u32);

#[test]
fn select_completes_a_send_case_once_space_appears() {
    launch(|env| {
        let ch1 = env.create_mchain(ChainParams::bounded(
            2,
            MemoryUsage::Preallocated,
            OverflowReaction::AbortApp,
        ));
        let ch2 = env.create_mchain(ChainParams::unbounded());

        // Fill ch1 to capacity.
        send(&ch1, Job(1))?;
        send(&ch1, Job(2))?;

        // A delayed consumer drains one slot from ch1 and feeds ch2.
        let drain_ch1 = Arc::clone(&ch1);
        let feed_ch2 = Arc::clone(&ch2);
        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(250));
            let mut handlers = ChainHandlers::new().on(|_job: &Job| {});
            let result = receive(
                conclave::from(&drain_ch1).handle_n(1).empty_timeout(Duration::from_secs(1)),
                &mut handlers,
            );
            assert_eq!(result.handled, 1);
            send(&feed_ch2, Note(7)).expect("unbounded chain accepts");
        });

        let sent_marker = Arc::new(AtomicUsize::new(0));
        let sent_cb = Arc::clone(&sent_marker);
        let notes = Arc::new(AtomicUsize::new(0));
        let notes_cb = Arc::clone(&notes);

        let holder = MessageHolder::new(Job(3));
        let result = select(
            conclave::from_all()
                .handle_n(2)
                .total_time(Duration::from_secs(5)),
            vec![
                conclave::send_case(&ch1, holder.make_ref(), move || {
                    sent_cb.fetch_add(1, Ordering::SeqCst);
                }),
                conclave::receive_case(
                    &ch2,
                    ChainHandlers::new().on(move |_note: &Note| {
                        notes_cb.fetch_add(1, Ordering::SeqCst);
                    }),
                ),
            ],
        );

        consumer.join().expect("consumer thread exits");

        assert_eq!(result.status, SelectStatus::Handled);
        assert_eq!(result.sent, 1);
        assert_eq!(result.handled, 1);
        assert_eq!(sent_marker.load(Ordering::SeqCst), 1);
        assert_eq!(notes.load(Ordering::SeqCst), 1);

        // ch1 is full again: the drained slot was taken by the send case.
        assert_eq!(ch1.len(), 2);

        env.stop();
        Ok(())
    })
    .expect("environment shuts down normally");
}

#[test]
fn closed_chain_semantics() {
    launch(|env| {
        let chain = env.create_mchain(ChainParams::unbounded());
        send(&chain, Job(1))?;
        send(&chain, Job(2))?;

        close_retain_content(&chain);
        assert!(matches!(send(&chain, Job(3)), Err(Error::ChainClosed)));

        // Retained content stays readable; the receive reports the close
        // once the queue is drained.
        let mut seen = Vec::new();
        let mut handlers = ChainHandlers::new().on(|job: &Job| seen.push(job.0));
        let result = receive(conclave::from(&chain).handle_all(), &mut handlers);
        assert_eq!(result.extracted, 2);
        assert_eq!(result.handled, 2);
        drop(handlers);
        assert_eq!(seen, vec![1, 2]);

        let dropped = env.create_mchain(ChainParams::unbounded());
        send(&dropped, Job(1))?;
        close_drop_content(&dropped);
        assert!(dropped.is_empty());

        env.stop();
        Ok(())
    })
    .expect("environment shuts down normally");
}

#[test]
fn bounded_chain_overflow_policies() {
    launch(|env| {
        let throwing = env.create_mchain(ChainParams::bounded(
            1,
            MemoryUsage::Dynamic,
            OverflowReaction::ThrowException,
        ));
        send(&throwing, Job(1))?;
        assert!(matches!(send(&throwing, Job(2)), Err(Error::ChainFull)));

        let dropping = env.create_mchain(ChainParams::bounded(
            1,
            MemoryUsage::Dynamic,
            OverflowReaction::DropNewest,
        ));
        send(&dropping, Job(1))?;
        send(&dropping, Job(2))?;
        assert_eq!(dropping.len(), 1);

        let evicting = env.create_mchain(ChainParams::bounded(
            1,
            MemoryUsage::Dynamic,
            OverflowReaction::RemoveOldest,
        ));
        send(&evicting, Job(1))?;
        send(&evicting, Job(2))?;
        let mut last = 0;
        {
            let mut handlers = ChainHandlers::new().on(|job: &Job| {
                last = job.0;
            });
            let result = receive(conclave::from(&evicting).handle_n(1), &mut handlers);
            assert_eq!(result.handled, 1);
        }
        assert_eq!(last, 2);

        env.stop();
        Ok(())
    })
    .expect("environment shuts down normally");
}
