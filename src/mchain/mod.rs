//! Message chains: bounded/unbounded FIFO queues usable as mboxes.
//!
//! A chain carries whole envelopes in arrival order (FIFO across all
//! producers) and is consumed by [`receive`](crate::mchain::receive) and
//! [`select`](crate::mchain::select) outside agent event handlers. Sending
//! into a full bounded chain applies the chain's overflow policy; the timer
//! thread never waits on a full chain and surfaces the overflow as a
//! dropped delivery plus a trace event.

mod receive;
mod select;

pub use receive::{from, receive, ChainHandlers, ReceiveParams, ReceiveResult, ReceiveStatus};
pub use select::{
    from_all, receive_case, select, send_case, SelectCase, SelectParams, SelectResult,
    SelectStatus,
};
pub(crate) use select::SelectSignal;

use crate::env::{Environment, WeakEnv};
use crate::error::{Error, Result};
use crate::limits::ControlBlock;
use crate::mbox::{DeliveryFilter, Mbox, MboxId, MboxKind};
use crate::message::MessageRef;
use crate::sink::{MessageSink, SinkId};
use crate::trace::MboxTracing;
use std::any::TypeId;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

pub type MchainRef = Arc<Mchain>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Storage for the full capacity is allocated up front.
    Preallocated,
    /// Storage grows on demand.
    Dynamic,
}

/// What happens when a send hits a full bounded chain (after the optional
/// wait timeout expired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowReaction {
    /// Silently drop the new message.
    DropNewest,
    /// Evict the oldest queued message to make room.
    RemoveOldest,
    /// Return [`Error::ChainFull`] to the producer.
    ThrowException,
    /// Terminate the process.
    AbortApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Queued messages are discarded.
    DropContent,
    /// Queued messages stay readable; further sends fail.
    RetainContent,
}

#[derive(Debug, Clone, Copy)]
pub struct ChainParams {
    pub(crate) capacity: Option<usize>,
    pub(crate) memory: MemoryUsage,
    pub(crate) overflow: OverflowReaction,
    pub(crate) overflow_timeout: Option<Duration>,
}

impl ChainParams {
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            memory: MemoryUsage::Dynamic,
            overflow: OverflowReaction::ThrowException,
            overflow_timeout: None,
        }
    }

    pub fn bounded(capacity: usize, memory: MemoryUsage, overflow: OverflowReaction) -> Self {
        Self {
            capacity: Some(capacity),
            memory,
            overflow,
            overflow_timeout: None,
        }
    }

    /// Blocks the producer up to `timeout` before the overflow reaction is
    /// applied.
    pub fn wait_on_overflow(mut self, timeout: Duration) -> Self {
        self.overflow_timeout = Some(timeout);
        self
    }
}

pub(crate) enum PushOutcome {
    Pushed,
    Full,
    Closed,
}

pub(crate) enum ExtractOutcome {
    Message(MessageRef),
    Closed,
    TimedOut,
}

struct ChainState {
    queue: VecDeque<MessageRef>,
    closed: Option<CloseMode>,
    selects: Vec<Weak<SelectSignal>>,
}

pub struct Mchain {
    id: MboxId,
    env: WeakEnv,
    params: ChainParams,
    state: Mutex<ChainState>,
    readers: Condvar,
    writers: Condvar,
    tracing: MboxTracing,
}

impl Mchain {
    pub(crate) fn new(
        id: MboxId,
        env: WeakEnv,
        params: ChainParams,
        tracing: MboxTracing,
    ) -> MchainRef {
        let queue = match (params.capacity, params.memory) {
            (Some(capacity), MemoryUsage::Preallocated) => VecDeque::with_capacity(capacity),
            _ => VecDeque::new(),
        };
        Arc::new(Self {
            id,
            env,
            params,
            state: Mutex::new(ChainState {
                queue,
                closed: None,
                selects: Vec::new(),
            }),
            readers: Condvar::new(),
            writers: Condvar::new(),
            tracing,
        })
    }

    pub fn id(&self) -> MboxId {
        self.id
    }

    /// View of the chain as an mbox, for use as a `send` target.
    pub fn as_mbox(self: &Arc<Self>) -> crate::mbox::MboxRef {
        Arc::clone(self) as _
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
            .is_some()
    }

    fn wake_selects(state: &mut ChainState) {
        state.selects.retain(|weak| match weak.upgrade() {
            Some(signal) => {
                signal.notify();
                true
            }
            None => false,
        });
    }

    pub(crate) fn register_select(&self, signal: &Arc<SelectSignal>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.selects.push(Arc::downgrade(signal));
    }

    fn trace_name(&self) -> String {
        if self.tracing.is_enabled() {
            self.name()
        } else {
            String::new()
        }
    }

    pub(crate) fn push(&self, message: MessageRef, from_timer: bool) -> Result<()> {
        let name = self.trace_name();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed.is_some() {
            return Err(Error::ChainClosed);
        }

        if let Some(capacity) = self.params.capacity {
            if state.queue.len() >= capacity && from_timer {
                self.tracing.emit(
                    "deliver_message_from_timer.overflow_drop",
                    self.id,
                    &name,
                    &message,
                    None,
                    None,
                );
                return Ok(());
            }

            if state.queue.len() >= capacity {
                if let Some(timeout) = self.params.overflow_timeout {
                    let deadline = Instant::now() + timeout;
                    while state.queue.len() >= capacity && state.closed.is_none() {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let (guard, _) = self
                            .writers
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(|e| e.into_inner());
                        state = guard;
                    }
                    if state.closed.is_some() {
                        return Err(Error::ChainClosed);
                    }
                }
            }

            if state.queue.len() >= capacity {
                match self.params.overflow {
                    OverflowReaction::DropNewest => {
                        self.tracing.emit(
                            "deliver_message.overflow_drop_newest",
                            self.id,
                            &name,
                            &message,
                            None,
                            None,
                        );
                        return Ok(());
                    }
                    OverflowReaction::RemoveOldest => {
                        if let Some(evicted) = state.queue.pop_front() {
                            self.tracing.emit(
                                "deliver_message.overflow_remove_oldest",
                                self.id,
                                &name,
                                &evicted,
                                None,
                                None,
                            );
                        }
                    }
                    OverflowReaction::ThrowException => return Err(Error::ChainFull),
                    OverflowReaction::AbortApp => {
                        log::error!("mchain {} overflow with abort_app policy", self.id);
                        std::process::abort();
                    }
                }
            }
        }

        self.tracing.emit(
            "deliver_message.push_to_queue",
            self.id,
            &name,
            &message,
            None,
            None,
        );
        state.queue.push_back(message);
        self.readers.notify_one();
        Self::wake_selects(&mut state);
        Ok(())
    }

    /// Non-blocking push used by select send-cases: never applies the
    /// overflow reaction, simply reports a full chain.
    pub(crate) fn try_push(&self, message: MessageRef) -> PushOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed.is_some() {
            return PushOutcome::Closed;
        }
        if let Some(capacity) = self.params.capacity {
            if state.queue.len() >= capacity {
                return PushOutcome::Full;
            }
        }
        state.queue.push_back(message);
        self.readers.notify_one();
        Self::wake_selects(&mut state);
        PushOutcome::Pushed
    }

    pub(crate) fn try_extract(&self) -> Option<MessageRef> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let message = state.queue.pop_front();
        if message.is_some() {
            self.writers.notify_one();
            Self::wake_selects(&mut state);
        }
        message
    }

    /// Blocking extraction honoring the receive timeouts.
    pub(crate) fn extract_wait(
        &self,
        empty_timeout: Option<Duration>,
        total_deadline: Option<Instant>,
    ) -> ExtractOutcome {
        let empty_deadline = empty_timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(message) = state.queue.pop_front() {
                self.writers.notify_one();
                Self::wake_selects(&mut state);
                return ExtractOutcome::Message(message);
            }
            if state.closed.is_some() {
                return ExtractOutcome::Closed;
            }

            let deadline = match (empty_deadline, total_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return ExtractOutcome::TimedOut;
                    }
                    let (guard, _) = self
                        .readers
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
                None => {
                    state = self
                        .readers
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Closes the chain; further sends fail and every sleeping reader,
    /// writer and pending select wakes up. A pending select send-case
    /// observes a retained close as a failed send.
    pub fn close(&self, mode: CloseMode) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(mode);
        if mode == CloseMode::DropContent {
            state.queue.clear();
        }
        self.readers.notify_all();
        self.writers.notify_all();
        Self::wake_selects(&mut state);
    }
}

/// Closes the chain keeping the queued messages readable.
pub fn close_retain_content(chain: &MchainRef) {
    chain.close(CloseMode::RetainContent);
}

/// Closes the chain discarding the queued messages.
pub fn close_drop_content(chain: &MchainRef) {
    chain.close(CloseMode::DropContent);
}

impl Mbox for Mchain {
    fn id(&self) -> MboxId {
        self.id
    }

    fn kind(&self) -> MboxKind {
        MboxKind::MultiProducerSingleConsumer
    }

    fn name(&self) -> String {
        format!("<mbox:type=MCHAIN:id={}>", self.id)
    }

    fn environment(&self) -> Result<Environment> {
        self.env.upgrade().ok_or(Error::ShuttingDown)
    }

    fn subscribe_event_handler(
        &self,
        _type_id: TypeId,
        _type_name: &'static str,
        _limit: Option<Arc<ControlBlock>>,
        _sink: Arc<dyn MessageSink>,
    ) -> Result<()> {
        Err(Error::NotSupported("mchain does not support subscriptions"))
    }

    fn unsubscribe_event_handlers(&self, _type_id: TypeId, _sink: SinkId) {}

    fn set_delivery_filter(
        &self,
        _type_id: TypeId,
        _filter: DeliveryFilter,
        _sink: SinkId,
    ) -> Result<()> {
        Err(Error::NotSupported("mchain does not support delivery filters"))
    }

    fn drop_delivery_filter(&self, _type_id: TypeId, _sink: SinkId) {}

    fn deliver(&self, message: MessageRef, _depth: u32) -> Result<()> {
        self.push(message, false)
    }

    fn deliver_from_timer(&self, message: MessageRef) -> Result<()> {
        self.push(message, true)
    }
}
