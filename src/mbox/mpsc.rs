//! Multi-producer/single-consumer mbox.
//!
//! The consumer is fixed at construction; this is the shape of an agent's
//! direct mbox. Delivery skips subscriber iteration and delegates straight
//! to the single sink. Delivery filters are not applicable here.

use crate::env::{Environment, WeakEnv};
use crate::error::{Error, Result};
use crate::limits::{self, ControlBlock, OverlimitContext};
use crate::mbox::{DeliveryFilter, Mbox, MboxId, MboxKind};
use crate::message::MessageRef;
use crate::sink::{MessageSink, SinkId};
use crate::trace::MboxTracing;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

pub(crate) struct MpscMbox {
    id: MboxId,
    env: WeakEnv,
    tracing: MboxTracing,
    owner: SinkId,
    /// Weak: the direct mbox is pinned to its agent and must not keep the
    /// agent alive on its own.
    sink: Weak<dyn MessageSink>,
    subscriptions: RwLock<BTreeMap<TypeId, Option<Arc<ControlBlock>>>>,
}

impl MpscMbox {
    pub(crate) fn new(
        id: MboxId,
        env: WeakEnv,
        tracing: MboxTracing,
        sink: &Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            id,
            env,
            tracing,
            owner: sink.sink_id(),
            sink: Arc::downgrade(sink),
            subscriptions: RwLock::new(BTreeMap::new()),
        }
    }

    fn trace_name(&self) -> String {
        if self.tracing.is_enabled() {
            self.name()
        } else {
            String::new()
        }
    }
}

impl Mbox for MpscMbox {
    fn id(&self) -> MboxId {
        self.id
    }

    fn kind(&self) -> MboxKind {
        MboxKind::MultiProducerSingleConsumer
    }

    fn name(&self) -> String {
        format!("<mbox:type=MPSC:id={}:consumer={}>", self.id, self.owner)
    }

    fn environment(&self) -> Result<Environment> {
        self.env.upgrade().ok_or(Error::ShuttingDown)
    }

    fn subscribe_event_handler(
        &self,
        type_id: TypeId,
        _type_name: &'static str,
        limit: Option<Arc<ControlBlock>>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<()> {
        if sink.sink_id() != self.owner {
            return Err(Error::IllegalMpscSubscriber);
        }
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        subscriptions.insert(type_id, limit);
        Ok(())
    }

    fn unsubscribe_event_handlers(&self, type_id: TypeId, sink: SinkId) {
        if sink != self.owner {
            return;
        }
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        subscriptions.remove(&type_id);
    }

    fn set_delivery_filter(
        &self,
        _type_id: TypeId,
        _filter: DeliveryFilter,
        _sink: SinkId,
    ) -> Result<()> {
        Err(Error::DeliveryFilterOnMpsc)
    }

    fn drop_delivery_filter(&self, _type_id: TypeId, _sink: SinkId) {}

    fn deliver(&self, message: MessageRef, depth: u32) -> Result<()> {
        let name = self.trace_name();
        let limit = {
            let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            match subscriptions.get(&message.type_id()) {
                Some(limit) => limit.clone(),
                None => {
                    self.tracing.emit(
                        "deliver_message.no_subscribers",
                        self.id,
                        &name,
                        &message,
                        None,
                        None,
                    );
                    return Ok(());
                }
            }
        };

        let Some(sink) = self.sink.upgrade() else {
            // The owning agent is already destroyed.
            return Ok(());
        };

        let ctx = OverlimitContext {
            mbox_id: self.id,
            mbox_name: &name,
            receiver: self.owner,
            depth,
            tracing: &self.tracing,
        };
        limits::try_deliver(limit.as_ref(), &message, &ctx, |guard| {
            self.tracing.emit(
                "deliver_message.push_to_queue",
                self.id,
                &name,
                &message,
                Some(self.owner),
                None,
            );
            sink.push(self.id, Arc::clone(&message), guard)
        })
    }
}
