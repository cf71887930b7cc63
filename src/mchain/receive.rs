//! Consuming a message chain with `receive`.

use crate::mchain::{ExtractOutcome, MchainRef};
use crate::message::Envelope;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

type ChainHandlerFn<'a> = Box<dyn FnMut(&Envelope) + 'a>;

/// Typed handler set for chain consumption.
///
/// Handlers may borrow from the caller's stack frame. Messages whose type
/// has no handler are still extracted, but not counted as handled.
#[derive(Default)]
pub struct ChainHandlers<'a> {
    handlers: HashMap<TypeId, ChainHandlerFn<'a>>,
}

impl<'a> ChainHandlers<'a> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn on<M, F>(mut self, mut handler: F) -> Self
    where
        M: Send + Sync + 'static,
        F: FnMut(&M) + 'a,
    {
        self.handlers.insert(
            TypeId::of::<M>(),
            Box::new(move |envelope| {
                if let Some(message) = envelope.downcast_ref::<M>() {
                    handler(message);
                }
            }),
        );
        self
    }

    /// Handler for a mutable message.
    pub fn on_mut<M, F>(mut self, mut handler: F) -> Self
    where
        M: Send + 'static,
        F: FnMut(&mut M) + 'a,
    {
        self.handlers.insert(
            TypeId::of::<M>(),
            Box::new(move |envelope| {
                envelope.with_mut(|message: &mut M| handler(message));
            }),
        );
        self
    }

    pub fn on_signal<S, F>(mut self, mut handler: F) -> Self
    where
        S: 'static,
        F: FnMut() + 'a,
    {
        self.handlers
            .insert(TypeId::of::<S>(), Box::new(move |_| handler()));
        self
    }

    pub(crate) fn dispatch(&mut self, envelope: &Envelope) -> bool {
        match self.handlers.get_mut(&envelope.type_id()) {
            Some(handler) => {
                handler(envelope);
                true
            }
            None => false,
        }
    }
}

/// How a `receive` call completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// The requested number of messages was handled.
    Handled,
    /// A timeout expired first.
    TimedOut,
    /// The chain was closed and drained.
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiveResult {
    pub extracted: usize,
    pub handled: usize,
    pub status: ReceiveStatus,
}

pub struct ReceiveParams {
    chain: MchainRef,
    handle_n: Option<usize>,
    empty_timeout: Option<Duration>,
    total_time: Option<Duration>,
}

/// Starts building receive parameters for one chain.
pub fn from(chain: &MchainRef) -> ReceiveParams {
    ReceiveParams {
        chain: Arc::clone(chain),
        handle_n: None,
        empty_timeout: None,
        total_time: None,
    }
}

impl ReceiveParams {
    /// Return after `n` handled messages.
    pub fn handle_n(mut self, n: usize) -> Self {
        self.handle_n = Some(n);
        self
    }

    /// Keep handling until the chain closes or a timeout expires.
    pub fn handle_all(mut self) -> Self {
        self.handle_n = None;
        self
    }

    /// Give up after the chain has been empty for this long.
    pub fn empty_timeout(mut self, timeout: Duration) -> Self {
        self.empty_timeout = Some(timeout);
        self
    }

    /// Hard bound on the whole receive call.
    pub fn total_time(mut self, time: Duration) -> Self {
        self.total_time = Some(time);
        self
    }
}

/// Extracts and dispatches messages from a chain.
pub fn receive(params: ReceiveParams, handlers: &mut ChainHandlers<'_>) -> ReceiveResult {
    let total_deadline = params.total_time.map(|t| Instant::now() + t);
    let mut extracted = 0usize;
    let mut handled = 0usize;

    loop {
        if let Some(n) = params.handle_n {
            if handled >= n {
                return ReceiveResult {
                    extracted,
                    handled,
                    status: ReceiveStatus::Handled,
                };
            }
        }
        if let Some(deadline) = total_deadline {
            if Instant::now() >= deadline {
                return ReceiveResult {
                    extracted,
                    handled,
                    status: ReceiveStatus::TimedOut,
                };
            }
        }

        match params
            .chain
            .extract_wait(params.empty_timeout, total_deadline)
        {
            ExtractOutcome::Message(message) => {
                extracted += 1;
                if handlers.dispatch(&message) {
                    handled += 1;
                }
            }
            ExtractOutcome::Closed => {
                return ReceiveResult {
                    extracted,
                    handled,
                    status: ReceiveStatus::Closed,
                };
            }
            ExtractOutcome::TimedOut => {
                return ReceiveResult {
                    extracted,
                    handled,
                    status: ReceiveStatus::TimedOut,
                };
            }
        }
    }
}
