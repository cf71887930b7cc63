//! Message limits.
//!
//! A limit is a per-agent, per-type counter with a reaction that runs when
//! the counter would exceed its bound. The counter is incremented before a
//! demand is queued and decremented after the receiving handler completes,
//! so at any moment the number of queued-or-running demands of that type for
//! the agent never exceeds the bound.

use crate::error::{Error, Result};
use crate::mbox::{MboxRef, OVERLIMIT_REACTION_MAX_DEPTH};
use crate::message::{Envelope, MessageRef};
use crate::trace::MboxTracing;
use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sentinel type for a per-agent fallback limit: applies to every message
/// type that has no limit of its own.
pub struct AnyUnspecified;

/// Result of a transform reaction: a replacement delivery.
pub struct Transformed {
    pub(crate) target: MboxRef,
    pub(crate) message: MessageRef,
}

/// Builds the replacement delivery inside a transform reaction.
pub fn transformed<N: Send + Sync + 'static>(target: MboxRef, payload: N) -> Transformed {
    Transformed {
        target,
        message: Envelope::immutable(payload),
    }
}

/// Signal flavor of [`transformed`].
pub fn transformed_signal<S: 'static>(target: MboxRef) -> Transformed {
    Transformed {
        target,
        message: Envelope::signal::<S>(),
    }
}

type TransformFn = Box<dyn Fn(&Envelope) -> Option<Transformed> + Send + Sync>;

pub(crate) enum Reaction {
    Drop,
    AbortApp,
    RedirectTo(MboxRef),
    Transform(TransformFn),
}

/// Run-time control block for the limit of one message type.
pub struct ControlBlock {
    pub(crate) limit: usize,
    pub(crate) count: AtomicUsize,
    pub(crate) reaction: Reaction,
    pub(crate) type_name: &'static str,
}

struct Description {
    type_id: TypeId,
    type_name: &'static str,
    limit: usize,
    reaction: Reaction,
}

/// Limit declarations for one agent, built during `so_define_agent`.
///
/// At most one limit may exist per message type; a duplicate fails the
/// definition with [`Error::SeveralLimits`]. Use [`AnyUnspecified`] as the
/// message type to declare a fallback limit for all unlisted types.
#[derive(Default)]
pub struct Limits {
    descriptions: Vec<Description>,
}

impl Limits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    fn push<M: 'static>(mut self, limit: usize, reaction: Reaction) -> Self {
        self.descriptions.push(Description {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            limit,
            reaction,
        });
        self
    }

    /// Silently discard messages of type `M` above `limit`.
    pub fn limit_then_drop<M: 'static>(self, limit: usize) -> Self {
        self.push::<M>(limit, Reaction::Drop)
    }

    /// Abort the process when the limit for `M` is exceeded.
    pub fn limit_then_abort<M: 'static>(self, limit: usize) -> Self {
        self.push::<M>(limit, Reaction::AbortApp)
    }

    /// Redirect overlimit messages of type `M` to another mbox.
    pub fn limit_then_redirect<M: 'static>(self, limit: usize, target: MboxRef) -> Self {
        self.push::<M>(limit, Reaction::RedirectTo(target))
    }

    /// Replace overlimit messages of type `M` with a different delivery.
    pub fn limit_then_transform<M, F>(self, limit: usize, transform: F) -> Self
    where
        M: Send + Sync + 'static,
        F: Fn(&M) -> Transformed + Send + Sync + 'static,
    {
        self.push::<M>(
            limit,
            Reaction::Transform(Box::new(move |envelope| {
                envelope.downcast_ref::<M>().map(&transform)
            })),
        )
    }

    /// Transform reaction for a signal type `S`.
    pub fn limit_then_transform_signal<S, F>(self, limit: usize, transform: F) -> Self
    where
        S: 'static,
        F: Fn() -> Transformed + Send + Sync + 'static,
    {
        self.push::<S>(
            limit,
            Reaction::Transform(Box::new(move |_| Some(transform()))),
        )
    }
}

const SMALL_STORAGE_LEN: usize = 8;

/// Limits of one agent, frozen after definition.
pub(crate) struct LimitStorage {
    blocks: Vec<(TypeId, Arc<ControlBlock>)>,
    fallback: Option<Arc<ControlBlock>>,
}

impl LimitStorage {
    pub(crate) fn build(limits: Limits) -> Result<Option<Arc<Self>>> {
        if limits.descriptions.is_empty() {
            return Ok(None);
        }

        let mut blocks: Vec<(TypeId, Arc<ControlBlock>)> = Vec::new();
        let mut fallback = None;
        for desc in limits.descriptions {
            let block = Arc::new(ControlBlock {
                limit: desc.limit,
                count: AtomicUsize::new(0),
                reaction: desc.reaction,
                type_name: desc.type_name,
            });
            if desc.type_id == TypeId::of::<AnyUnspecified>() {
                if fallback.replace(block).is_some() {
                    return Err(Error::SeveralLimits(desc.type_name));
                }
            } else {
                if blocks.iter().any(|(id, _)| *id == desc.type_id) {
                    return Err(Error::SeveralLimits(desc.type_name));
                }
                blocks.push((desc.type_id, block));
            }
        }
        blocks.sort_by_key(|(id, _)| *id);
        Ok(Some(Arc::new(Self { blocks, fallback })))
    }

    pub(crate) fn find(&self, type_id: TypeId) -> Option<Arc<ControlBlock>> {
        let found = if self.blocks.len() <= SMALL_STORAGE_LEN {
            self.blocks
                .iter()
                .find(|(id, _)| *id == type_id)
                .map(|(_, block)| block)
        } else {
            self.blocks
                .binary_search_by_key(&type_id, |(id, _)| *id)
                .ok()
                .map(|idx| &self.blocks[idx].1)
        };
        found.or(self.fallback.as_ref()).map(Arc::clone)
    }
}

/// Owns one increment of a limit counter; rolls it back on drop.
///
/// The guard travels inside the queued demand, so the decrement happens
/// exactly when the demand is consumed (after the handler completes) or
/// when the demand is discarded.
pub struct LimitGuard(Arc<ControlBlock>);

impl Drop for LimitGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct OverlimitContext<'a> {
    pub mbox_id: crate::mbox::MboxId,
    pub mbox_name: &'a str,
    pub receiver: crate::agent::AgentId,
    pub depth: u32,
    pub tracing: &'a MboxTracing,
}

/// Applies the limit for one subscriber and either pushes the demand or
/// runs the overlimit reaction.
pub(crate) fn try_deliver(
    limit: Option<&Arc<ControlBlock>>,
    message: &MessageRef,
    ctx: &OverlimitContext<'_>,
    push: impl FnOnce(Option<LimitGuard>) -> Result<()>,
) -> Result<()> {
    let Some(block) = limit else {
        return push(None);
    };

    let new_count = block.count.fetch_add(1, Ordering::AcqRel) + 1;
    if new_count > block.limit {
        block.count.fetch_sub(1, Ordering::AcqRel);
        return run_reaction(block, message, ctx);
    }
    push(Some(LimitGuard(Arc::clone(block))))
}

fn run_reaction(
    block: &ControlBlock,
    message: &MessageRef,
    ctx: &OverlimitContext<'_>,
) -> Result<()> {
    match &block.reaction {
        Reaction::Drop => {
            ctx.tracing.emit(
                "deliver_message.overlimit.drop",
                ctx.mbox_id,
                ctx.mbox_name,
                message,
                Some(ctx.receiver),
                None,
            );
            Ok(())
        }
        Reaction::AbortApp => {
            ctx.tracing.emit(
                "deliver_message.overlimit.abort_app",
                ctx.mbox_id,
                ctx.mbox_name,
                message,
                Some(ctx.receiver),
                None,
            );
            log::error!(
                "message limit exceeded with abort_app reaction; \
                 msg_type: {}, limit: {}, agent: {}",
                block.type_name,
                block.limit,
                ctx.receiver,
            );
            std::process::abort();
        }
        Reaction::RedirectTo(target) => {
            check_depth(ctx.depth, block.type_name)?;
            ctx.tracing.emit(
                "deliver_message.overlimit.redirect",
                ctx.mbox_id,
                ctx.mbox_name,
                message,
                Some(ctx.receiver),
                Some(format!("target_mbox_id={}", target.id()).as_str()),
            );
            target.deliver(Arc::clone(message), ctx.depth + 1)
        }
        Reaction::Transform(transform) => {
            check_depth(ctx.depth, block.type_name)?;
            match transform(message) {
                Some(replacement) => {
                    ctx.tracing.emit(
                        "deliver_message.overlimit.transform",
                        ctx.mbox_id,
                        ctx.mbox_name,
                        message,
                        Some(ctx.receiver),
                        Some(format!("target_mbox_id={}", replacement.target.id()).as_str()),
                    );
                    replacement.target.deliver(replacement.message, ctx.depth + 1)
                }
                None => {
                    log::error!(
                        "overlimit transform failed to downcast payload; \
                         msg_type: {}",
                        block.type_name,
                    );
                    Ok(())
                }
            }
        }
    }
}

fn check_depth(depth: u32, type_name: &'static str) -> Result<()> {
    if depth >= OVERLIMIT_REACTION_MAX_DEPTH {
        log::error!(
            "overlimit reaction recursion is too deep; msg_type: {type_name}, depth: {depth}"
        );
        return Err(Error::OverlimitRecursion(type_name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Req;

    #[test]
    fn duplicate_limit_is_rejected() {
        let limits = Limits::new()
            .limit_then_drop::<Req>(4)
            .limit_then_abort::<Req>(8);
        assert!(matches!(
            LimitStorage::build(limits),
            Err(Error::SeveralLimits(_))
        ));
    }

    #[test]
    fn fallback_limit_applies_to_unlisted_types() {
        let limits = Limits::new()
            .limit_then_drop::<Req>(4)
            .limit_then_drop::<AnyUnspecified>(1);
        let storage = LimitStorage::build(limits).unwrap().unwrap();

        let req = storage.find(TypeId::of::<Req>()).unwrap();
        assert_eq!(req.limit, 4);

        let other = storage.find(TypeId::of::<String>()).unwrap();
        assert_eq!(other.limit, 1);
    }

    #[test]
    fn guard_rolls_the_counter_back() {
        let storage = LimitStorage::build(Limits::new().limit_then_drop::<Req>(2))
            .unwrap()
            .unwrap();
        let block = storage.find(TypeId::of::<Req>()).unwrap();

        block.count.fetch_add(1, Ordering::AcqRel);
        {
            let _guard = LimitGuard(Arc::clone(&block));
        }
        assert_eq!(block.count.load(Ordering::Acquire), 0);
    }
}
