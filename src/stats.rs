//! Runtime statistics distribution.
//!
//! The environment owns a stats controller with a distribution mbox. While
//! turned on, a controller thread periodically samples the cooperation
//! registry, the timer service and every registered dispatcher, and
//! publishes one typed message per sample to the distribution mbox. Any
//! agent can subscribe to that mbox like to any other MPMC mbox.

use crate::env::WeakEnv;
use crate::mbox::MboxRef;
use crate::message::Envelope;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Message types published on the distribution mbox.
pub mod messages {
    /// Registered cooperation and agent quantities.
    #[derive(Debug, Clone, Copy)]
    pub struct CoopCount {
        pub coops: usize,
        pub agents: usize,
    }

    /// Pending timer quantities.
    #[derive(Debug, Clone, Copy)]
    pub struct TimerQuantities {
        pub single_shot: usize,
        pub periodic: usize,
    }

    /// Size of one dispatcher queue.
    #[derive(Debug, Clone)]
    pub struct DispatcherQueueSize {
        pub dispatcher: String,
        pub queue: String,
        pub demands: usize,
    }

    /// Accumulated activity of one worker thread.
    #[derive(Debug, Clone)]
    pub struct WorkThreadActivity {
        pub worker: String,
        pub working_ns: u64,
        pub working_events: u64,
        pub waiting_ns: u64,
        pub waiting_events: u64,
    }
}

struct ControllerState {
    running: bool,
    period: Duration,
    thread: Option<JoinHandle<()>>,
}

pub struct StatsController {
    env: WeakEnv,
    mbox: MboxRef,
    state: Mutex<ControllerState>,
    wakeup: Arc<(Mutex<u64>, Condvar)>,
}

impl StatsController {
    pub(crate) fn new(env: WeakEnv, mbox: MboxRef, period: Duration) -> Self {
        Self {
            env,
            mbox,
            state: Mutex::new(ControllerState {
                running: false,
                period,
                thread: None,
            }),
            wakeup: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// The mbox on which stats messages are distributed.
    pub fn mbox(&self) -> MboxRef {
        Arc::clone(&self.mbox)
    }

    pub fn set_period(&self, period: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.period = period;
        drop(state);
        self.kick();
    }

    fn kick(&self) {
        let (generation, cv) = &*self.wakeup;
        *generation.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        cv.notify_all();
    }

    /// Starts periodic distribution. Idempotent.
    pub fn turn_on(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.running {
            return;
        }
        state.running = true;

        let env = self.env.clone();
        let mbox = Arc::clone(&self.mbox);
        let wakeup = Arc::clone(&self.wakeup);
        let handle = std::thread::Builder::new()
            .name("conclave-stats".to_string())
            .spawn(move || stats_loop(env, mbox, wakeup))
            .expect("cannot start stats thread");
        state.thread = Some(handle);
    }

    /// Stops periodic distribution and joins the controller thread.
    pub fn turn_off(&self) {
        let handle = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.running {
                return;
            }
            state.running = false;
            state.thread.take()
        };
        self.kick();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
    }

    fn current_period(&self) -> Duration {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .period
    }

    pub(crate) fn shutdown(&self) {
        self.turn_off();
    }
}

fn stats_loop(env: WeakEnv, mbox: MboxRef, wakeup: Arc<(Mutex<u64>, Condvar)>) {
    loop {
        let Some(environment) = env.upgrade() else {
            return;
        };
        let period = {
            let controller = environment.stats();
            if !controller.is_running() {
                return;
            }
            controller.current_period()
        };

        distribute_once(&environment, &mbox);
        drop(environment);

        // Sleep one period, waking early on turn_off / set_period.
        let (generation, cv) = &*wakeup;
        let guard = generation.lock().unwrap_or_else(|e| e.into_inner());
        let _ = cv
            .wait_timeout(guard, period)
            .unwrap_or_else(|e| e.into_inner());
    }
}

fn distribute_once(env: &crate::env::Environment, mbox: &MboxRef) {
    let (coops, agents) = env.coop_counts();
    let _ = mbox.deliver(
        Envelope::immutable(messages::CoopCount { coops, agents }),
        1,
    );

    let timers = env.timer_stats();
    let _ = mbox.deliver(
        Envelope::immutable(messages::TimerQuantities {
            single_shot: timers.single_shot,
            periodic: timers.periodic,
        }),
        1,
    );

    for dispatcher in env.dispatchers() {
        for queue in dispatcher.queue_stats() {
            let _ = mbox.deliver(
                Envelope::immutable(messages::DispatcherQueueSize {
                    dispatcher: dispatcher.name().to_string(),
                    queue: queue.queue,
                    demands: queue.demands,
                }),
                1,
            );
        }
        for activity in dispatcher.activity_stats() {
            let _ = mbox.deliver(
                Envelope::immutable(messages::WorkThreadActivity {
                    worker: activity.worker,
                    working_ns: activity.stats.working_ns,
                    working_events: activity.stats.working_events,
                    waiting_ns: activity.stats.waiting_ns,
                    waiting_events: activity.stats.waiting_events,
                }),
                1,
            );
        }
    }
}
