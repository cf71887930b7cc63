//! Message sinks and execution demands.
//!
//! A sink is the object an mbox uses to push demands into an agent's event
//! queue; there is exactly one per agent. A demand is the queued
//! `(receiver, type, payload)` tuple awaiting dispatch; it keeps its
//! receiver alive until it is processed and carries the limit guard whose
//! drop decrements the receiver's message-limit counter.

use crate::agent::AgentRef;
use crate::limits::LimitGuard;
use crate::mbox::MboxId;
use crate::message::MessageRef;

/// Identity of a sink; equals the owning agent's id.
pub type SinkId = u64;

/// Sink into an agent's event queue, presented to mboxes.
pub trait MessageSink: Send + Sync {
    fn sink_id(&self) -> SinkId;

    /// Pushes a message demand for the owning agent.
    ///
    /// `limit` is the already-incremented limit guard for the message type,
    /// if the agent declared one.
    fn push(
        &self,
        mbox_id: MboxId,
        message: MessageRef,
        limit: Option<LimitGuard>,
    ) -> crate::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DemandKind {
    EvtStart,
    EvtFinish,
    Message,
}

/// Queued execution demand.
pub struct Demand {
    pub(crate) receiver: AgentRef,
    pub(crate) mbox_id: MboxId,
    pub(crate) message: Option<MessageRef>,
    pub(crate) limit: Option<LimitGuard>,
    pub(crate) kind: DemandKind,
}

impl Demand {
    pub(crate) fn message(
        receiver: AgentRef,
        mbox_id: MboxId,
        message: MessageRef,
        limit: Option<LimitGuard>,
    ) -> Self {
        Self {
            receiver,
            mbox_id,
            message: Some(message),
            limit,
            kind: DemandKind::Message,
        }
    }

    pub(crate) fn evt_start(receiver: AgentRef) -> Self {
        Self {
            mbox_id: 0,
            message: None,
            limit: None,
            kind: DemandKind::EvtStart,
            receiver,
        }
    }

    pub(crate) fn evt_finish(receiver: AgentRef) -> Self {
        Self {
            mbox_id: 0,
            message: None,
            limit: None,
            kind: DemandKind::EvtFinish,
            receiver,
        }
    }

    pub(crate) fn receiver(&self) -> &AgentRef {
        &self.receiver
    }

    /// Runs the demand on the calling worker thread.
    ///
    /// The limit guard is dropped when `self` goes out of scope, which is
    /// the decrement point of the limit counter.
    pub(crate) fn execute(self) {
        let receiver = self.receiver.clone();
        match self.kind {
            DemandKind::EvtStart => receiver.run_evt_start(),
            DemandKind::EvtFinish => receiver.run_evt_finish(),
            DemandKind::Message => {
                if let Some(message) = &self.message {
                    receiver.exec_message(self.mbox_id, message);
                }
            }
        }
    }
}
