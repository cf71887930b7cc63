//! Message boxes.
//!
//! An mbox is an addressable endpoint with a subscription table keyed by
//! message type. The MPMC flavor accepts any number of subscribers per type
//! and supports per-subscriber delivery filters; the MPSC flavor is pinned
//! to exactly one consumer, usually as an agent's direct mbox.

mod mpmc;
mod mpsc;

pub(crate) use mpmc::MpmcMbox;
pub(crate) use mpsc::MpscMbox;

use crate::env::Environment;
use crate::error::Result;
use crate::limits::ControlBlock;
use crate::message::{Envelope, MessageRef};
use crate::sink::{MessageSink, SinkId};
use std::any::TypeId;
use std::sync::Arc;

/// Unique id of an mbox within one environment.
pub type MboxId = u64;

/// Shared handle to an mbox.
pub type MboxRef = Arc<dyn Mbox>;

/// Flavor of an mbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MboxKind {
    /// Multi-producer, multi-consumer: any number of subscribers per type.
    MultiProducerMultiConsumer,
    /// Multi-producer, single-consumer: one fixed subscriber.
    MultiProducerSingleConsumer,
}

/// Predicate attached to `(mbox, msg_type, subscriber)` that admits or
/// rejects a message before it is pushed to the subscriber's queue.
pub type DeliveryFilter = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Depth cap for overlimit redirect/transform chains.
pub const OVERLIMIT_REACTION_MAX_DEPTH: u32 = 32;

/// Addressable message endpoint.
pub trait Mbox: Send + Sync {
    fn id(&self) -> MboxId;

    fn kind(&self) -> MboxKind;

    /// Diagnostic name, e.g. `<mbox:type=MPMC:id=3>`.
    fn name(&self) -> String;

    /// Environment this mbox belongs to.
    ///
    /// Fails with [`crate::Error::ShuttingDown`] when the environment has
    /// already been torn down.
    fn environment(&self) -> Result<Environment>;

    /// Adds a subscription of `sink` to messages of the given type.
    fn subscribe_event_handler(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        limit: Option<Arc<ControlBlock>>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<()>;

    /// Removes the subscription of `sink` for the given type.
    fn unsubscribe_event_handlers(&self, type_id: TypeId, sink: SinkId);

    /// Installs a delivery filter for `(type, sink)`.
    ///
    /// MPSC mboxes reject this with
    /// [`crate::Error::DeliveryFilterOnMpsc`]. An existing filter for the
    /// same pair is replaced.
    fn set_delivery_filter(
        &self,
        type_id: TypeId,
        filter: DeliveryFilter,
        sink: SinkId,
    ) -> Result<()>;

    fn drop_delivery_filter(&self, type_id: TypeId, sink: SinkId);

    /// Delivers a message to subscribers of its type.
    ///
    /// `depth` counts overlimit redirect/transform hops; delivery is aborted
    /// with [`crate::Error::OverlimitRecursion`] once it exceeds
    /// [`OVERLIMIT_REACTION_MAX_DEPTH`].
    fn deliver(&self, message: MessageRef, depth: u32) -> Result<()>;

    /// Delivery variant used by the timer thread.
    ///
    /// Must never block the caller: an mchain behind this call surfaces a
    /// full queue as a dropped delivery plus a trace event instead of
    /// waiting.
    fn deliver_from_timer(&self, message: MessageRef) -> Result<()> {
        self.deliver(message, 1)
    }
}
