//! Message envelopes.
//!
//! A message is an arbitrary user value wrapped into a reference-counted
//! [`Envelope`]. Signals carry no payload: only the type is delivered.
//! Mutable messages are guarded by a single-owner rule that is enforced at
//! every send boundary: an envelope whose reference count is greater than
//! one cannot be sent as mutable, so a handler observing a mutable payload
//! is always its only observer.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Reference-counted handle to an envelope.
///
/// A queued execution demand, a stored [`MessageHolder`] and a redirected
/// delivery each hold one reference.
pub type MessageRef = Arc<Envelope>;

enum EnvelopeData {
    /// A signal: the type alone is the information.
    Signal,
    /// Shared, read-only payload.
    Immutable(Box<dyn Any + Send + Sync>),
    /// Single-owner payload, accessed exclusively by one handler at a time.
    Mutable(Mutex<Box<dyn Any + Send>>),
    /// An envelope wrapping another envelope (tracing, transforms).
    Wrapped(MessageRef),
}

/// Type-erased message envelope.
pub struct Envelope {
    type_id: TypeId,
    type_name: &'static str,
    data: EnvelopeData,
}

impl Envelope {
    /// Wraps a value into an immutable envelope.
    pub fn immutable<M>(payload: M) -> MessageRef
    where
        M: Send + Sync + 'static,
    {
        Arc::new(Self {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            data: EnvelopeData::Immutable(Box::new(payload)),
        })
    }

    /// Wraps a value into a mutable envelope.
    pub fn mutable<M>(payload: M) -> MessageRef
    where
        M: Send + 'static,
    {
        Arc::new(Self {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            data: EnvelopeData::Mutable(Mutex::new(Box::new(payload))),
        })
    }

    /// Creates a payloadless signal envelope for type `S`.
    pub fn signal<S: 'static>() -> MessageRef {
        Arc::new(Self {
            type_id: TypeId::of::<S>(),
            type_name: std::any::type_name::<S>(),
            data: EnvelopeData::Signal,
        })
    }

    /// Wraps an existing envelope.
    ///
    /// The wrapper keeps the inner payload type visible: subscription lookup
    /// and handler dispatch see the inner type, so a wrapping layer never
    /// changes routing.
    pub fn wrap(inner: MessageRef) -> MessageRef {
        Arc::new(Self {
            type_id: inner.type_id,
            type_name: inner.type_name,
            data: EnvelopeData::Wrapped(inner),
        })
    }

    /// Type id used for subscription lookup, resolved through wrappers.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Human-readable type name, used by delivery tracing.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_signal(&self) -> bool {
        matches!(self.payload().data, EnvelopeData::Signal)
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self.payload().data, EnvelopeData::Mutable(_))
    }

    /// Resolves wrapping layers down to the actual payload envelope.
    pub fn payload(&self) -> &Envelope {
        let mut current = self;
        while let EnvelopeData::Wrapped(inner) = &current.data {
            current = inner;
        }
        current
    }

    /// Borrows an immutable payload of type `M`.
    pub fn downcast_ref<M: 'static>(&self) -> Option<&M> {
        match &self.payload().data {
            EnvelopeData::Immutable(payload) => payload.downcast_ref::<M>(),
            _ => None,
        }
    }

    /// Runs `f` against a mutable payload of type `M`.
    ///
    /// Returns `None` when the envelope is not mutable or holds a different
    /// type. The internal lock is uncontended: the single-owner rule keeps
    /// the envelope visible to at most one handler.
    pub fn with_mut<M: 'static, R>(&self, f: impl FnOnce(&mut M) -> R) -> Option<R> {
        match &self.payload().data {
            EnvelopeData::Mutable(cell) => {
                let mut guard = cell.lock().unwrap_or_else(|poison| poison.into_inner());
                guard.downcast_mut::<M>().map(f)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.data {
            EnvelopeData::Signal => "signal",
            EnvelopeData::Immutable(_) => "immutable",
            EnvelopeData::Mutable(_) => "mutable",
            EnvelopeData::Wrapped(_) => "wrapped",
        };
        f.debug_struct("Envelope")
            .field("type", &self.type_name)
            .field("kind", &kind)
            .finish()
    }
}

/// A prebuilt, reusable message reference with a statically known type.
///
/// Holders let producer code build a message once and attempt to enqueue it
/// repeatedly, which is what an mchain `send_case` needs: the selection may
/// retry the same payload until the target chain accepts it.
pub struct MessageHolder<M> {
    message: MessageRef,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for MessageHolder<M> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            _marker: PhantomData,
        }
    }
}

impl<M: Send + Sync + 'static> MessageHolder<M> {
    pub fn new(payload: M) -> Self {
        Self {
            message: Envelope::immutable(payload),
            _marker: PhantomData,
        }
    }
}

impl<M: 'static> MessageHolder<M> {
    /// A holder for a signal type.
    pub fn signal() -> Self {
        Self {
            message: Envelope::signal::<M>(),
            _marker: PhantomData,
        }
    }

    pub fn type_id(&self) -> TypeId {
        TypeId::of::<M>()
    }

    pub fn make_ref(&self) -> MessageRef {
        Arc::clone(&self.message)
    }
}
