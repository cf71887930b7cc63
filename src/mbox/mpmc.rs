//! Multi-producer/multi-consumer mbox.

use crate::env::{Environment, WeakEnv};
use crate::error::{Error, Result};
use crate::limits::{self, ControlBlock, OverlimitContext};
use crate::mbox::{DeliveryFilter, Mbox, MboxId, MboxKind};
use crate::message::MessageRef;
use crate::sink::{MessageSink, SinkId};
use crate::trace::MboxTracing;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

struct SubscriberEntry {
    sink: Arc<dyn MessageSink>,
    limit: Option<Arc<ControlBlock>>,
}

#[derive(Default)]
struct MpmcState {
    /// Subscribers per message type, in subscription order.
    subscriptions: BTreeMap<TypeId, Vec<SubscriberEntry>>,
    /// Delivery filters, independent of subscription lifetime.
    filters: BTreeMap<(TypeId, SinkId), DeliveryFilter>,
}

pub(crate) struct MpmcMbox {
    id: MboxId,
    user_name: Option<Arc<str>>,
    env: WeakEnv,
    tracing: MboxTracing,
    state: RwLock<MpmcState>,
}

impl MpmcMbox {
    pub(crate) fn new(
        id: MboxId,
        user_name: Option<Arc<str>>,
        env: WeakEnv,
        tracing: MboxTracing,
    ) -> Self {
        Self {
            id,
            user_name,
            env,
            tracing,
            state: RwLock::new(MpmcState::default()),
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

impl Mbox for MpmcMbox {
    fn id(&self) -> MboxId {
        self.id
    }

    fn kind(&self) -> MboxKind {
        MboxKind::MultiProducerMultiConsumer
    }

    fn name(&self) -> String {
        match &self.user_name {
            Some(name) => format!("<mbox:type=MPMC:name={}:id={}>", name, self.id),
            None => format!("<mbox:type=MPMC:id={}>", self.id),
        }
    }

    fn environment(&self) -> Result<Environment> {
        self.env.upgrade().ok_or(Error::ShuttingDown)
    }

    fn subscribe_event_handler(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        limit: Option<Arc<ControlBlock>>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let entries = state.subscriptions.entry(type_id).or_default();
        match entries.iter_mut().find(|e| e.sink.sink_id() == sink.sink_id()) {
            Some(existing) => existing.limit = limit,
            None => entries.push(SubscriberEntry { sink, limit }),
        }
        drop(state);

        if let Some(core) = self.tracing.core() {
            core.emit(&crate::trace::TraceEvent {
                op: "subscribe_event_handler",
                mbox_id: self.id,
                mbox_name: &self.name(),
                msg_type: type_name,
                agent: None,
                extra: None,
            });
        }
        Ok(())
    }

    fn unsubscribe_event_handlers(&self, type_id: TypeId, sink: SinkId) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = state.subscriptions.get_mut(&type_id) {
            entries.retain(|e| e.sink.sink_id() != sink);
            if entries.is_empty() {
                state.subscriptions.remove(&type_id);
            }
        }
    }

    fn set_delivery_filter(
        &self,
        type_id: TypeId,
        filter: DeliveryFilter,
        sink: SinkId,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.filters.insert((type_id, sink), filter);
        Ok(())
    }

    fn drop_delivery_filter(&self, type_id: TypeId, sink: SinkId) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.filters.remove(&(type_id, sink));
    }

    fn deliver(&self, message: MessageRef, depth: u32) -> Result<()> {
        if message.is_mutable() {
            return Err(Error::MutableOnMpmc);
        }

        let name = self.trace_name();
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = state.subscriptions.get(&message.type_id()) else {
            self.tracing.emit(
                "deliver_message.no_subscribers",
                self.id,
                &name,
                &message,
                None,
                None,
            );
            return Ok(());
        };

        for entry in entries {
            let sink_id = entry.sink.sink_id();
            if let Some(filter) = state.filters.get(&(message.type_id(), sink_id)) {
                if !filter(&message) {
                    self.tracing.emit(
                        "deliver_message.rejected_by_filter",
                        self.id,
                        &name,
                        &message,
                        Some(sink_id),
                        None,
                    );
                    continue;
                }
            }

            let ctx = OverlimitContext {
                mbox_id: self.id,
                mbox_name: &name,
                receiver: sink_id,
                depth,
                tracing: &self.tracing,
            };
            limits::try_deliver(entry.limit.as_ref(), &message, &ctx, |guard| {
                self.tracing.emit(
                    "deliver_message.push_to_queue",
                    self.id,
                    &name,
                    &message,
                    Some(sink_id),
                    None,
                );
                entry.sink.push(self.id, Arc::clone(&message), guard)
            })?;
        }
        Ok(())
    }
}
