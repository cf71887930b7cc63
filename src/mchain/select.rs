//! `select` over several chains with receive and send cases.

use crate::mchain::{ChainHandlers, MchainRef, PushOutcome};
use crate::message::MessageRef;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Wakeup channel shared between a selection and its chains: every push,
/// pop and close bumps the generation and wakes the selector.
pub(crate) struct SelectSignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl SelectSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            generation: Mutex::new(0),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        self.changed.notify_all();
    }

    fn current(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits until the generation moves past `seen` or `deadline` passes.
    fn wait_change(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        while *generation == seen {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .changed
                        .wait_timeout(generation, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    generation = guard;
                }
                None => {
                    generation = self
                        .changed
                        .wait(generation)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        true
    }
}

pub struct SelectParams {
    handle_n: Option<usize>,
    total_time: Option<Duration>,
    empty_timeout: Option<Duration>,
}

/// Starts building selection parameters.
pub fn from_all() -> SelectParams {
    SelectParams {
        handle_n: None,
        total_time: None,
        empty_timeout: None,
    }
}

impl SelectParams {
    /// Return after `n` completed events (handled receives plus finished
    /// sends).
    pub fn handle_n(mut self, n: usize) -> Self {
        self.handle_n = Some(n);
        self
    }

    pub fn total_time(mut self, time: Duration) -> Self {
        self.total_time = Some(time);
        self
    }

    /// Give up after this long without a single completed event.
    pub fn empty_timeout(mut self, timeout: Duration) -> Self {
        self.empty_timeout = Some(timeout);
        self
    }
}

enum CaseKind<'a> {
    Receive {
        handlers: ChainHandlers<'a>,
        closed: bool,
    },
    Send {
        message: Option<MessageRef>,
        on_sent: Box<dyn FnMut() + 'a>,
    },
}

pub struct SelectCase<'a> {
    chain: MchainRef,
    kind: CaseKind<'a>,
}

/// A case consuming messages from `chain`.
pub fn receive_case<'a>(chain: &MchainRef, handlers: ChainHandlers<'a>) -> SelectCase<'a> {
    SelectCase {
        chain: Arc::clone(chain),
        kind: CaseKind::Receive {
            handlers,
            closed: false,
        },
    }
}

/// A case attempting to enqueue a prebuilt message into `chain`.
///
/// The send completes at most once; `on_sent` runs on completion. A closed
/// target chain (including a retain-content close) fails the case.
pub fn send_case<'a>(
    chain: &MchainRef,
    message: MessageRef,
    on_sent: impl FnMut() + 'a,
) -> SelectCase<'a> {
    SelectCase {
        chain: Arc::clone(chain),
        kind: CaseKind::Send {
            message: Some(message),
            on_sent: Box::new(on_sent),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectStatus {
    /// The requested number of events completed.
    Handled,
    /// The total-time budget expired.
    TimedOut,
    /// Every case became inert (chains closed, sends finished).
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectResult {
    pub extracted: usize,
    pub handled: usize,
    pub sent: usize,
    pub status: SelectStatus,
}

/// Runs a selection over the given cases until the completion condition is
/// met.
pub fn select(params: SelectParams, mut cases: Vec<SelectCase<'_>>) -> SelectResult {
    let signal = SelectSignal::new();
    for case in &cases {
        case.chain.register_select(&signal);
    }

    let total_deadline = params.total_time.map(|t| Instant::now() + t);
    let mut extracted = 0usize;
    let mut handled = 0usize;
    let mut sent = 0usize;
    let mut last_progress = Instant::now();

    loop {
        let seen = signal.current();
        let mut progress = false;

        for case in &mut cases {
            match &mut case.kind {
                CaseKind::Receive { handlers, closed } => {
                    if *closed {
                        continue;
                    }
                    match case.chain.try_extract() {
                        Some(message) => {
                            extracted += 1;
                            if handlers.dispatch(&message) {
                                handled += 1;
                            }
                            progress = true;
                        }
                        None => {
                            if case.chain.is_closed() {
                                *closed = true;
                            }
                        }
                    }
                }
                CaseKind::Send { message, on_sent } => {
                    if let Some(pending) = message.take() {
                        match case.chain.try_push(Arc::clone(&pending)) {
                            PushOutcome::Pushed => {
                                sent += 1;
                                on_sent();
                                progress = true;
                            }
                            PushOutcome::Full => {
                                *message = Some(pending);
                            }
                            PushOutcome::Closed => {
                                // The send case fails; the message is
                                // dropped and the case becomes inert.
                            }
                        }
                    }
                }
            }

            if let Some(n) = params.handle_n {
                if handled + sent >= n {
                    return SelectResult {
                        extracted,
                        handled,
                        sent,
                        status: SelectStatus::Handled,
                    };
                }
            }
        }

        let all_inert = cases.iter().all(|case| match &case.kind {
            CaseKind::Receive { closed, .. } => *closed,
            CaseKind::Send { message, .. } => message.is_none(),
        });
        if all_inert {
            return SelectResult {
                extracted,
                handled,
                sent,
                status: SelectStatus::Closed,
            };
        }

        if progress {
            last_progress = Instant::now();
            continue;
        }

        let empty_deadline = params.empty_timeout.map(|t| last_progress + t);
        let deadline = match (total_deadline, empty_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        if !signal.wait_change(seen, deadline) {
            return SelectResult {
                extracted,
                handled,
                sent,
                status: SelectStatus::TimedOut,
            };
        }
    }
}
