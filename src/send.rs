//! Send primitives.
//!
//! Targets are mboxes, mchains and agents (shorthand for their direct
//! mbox). Delayed and periodic sends go through the timer service of the
//! target's environment; periodic sends return a [`TimerId`] that must be
//! kept alive for the timer to keep firing.

use crate::agent::AgentRef;
use crate::error::{Error, Result};
use crate::mbox::MboxRef;
use crate::mchain::MchainRef;
use crate::message::{Envelope, MessageHolder, MessageRef};
use crate::timer::TimerId;
use std::sync::Arc;
use std::time::Duration;

/// Anything a message can be sent to.
pub trait SendTarget {
    fn target_mbox(&self) -> MboxRef;
}

impl SendTarget for MboxRef {
    fn target_mbox(&self) -> MboxRef {
        Arc::clone(self)
    }
}

impl SendTarget for MchainRef {
    fn target_mbox(&self) -> MboxRef {
        self.as_mbox()
    }
}

impl SendTarget for AgentRef {
    fn target_mbox(&self) -> MboxRef {
        self.direct_mbox()
    }
}

/// Sends an immutable message.
pub fn send<M>(target: &impl SendTarget, payload: M) -> Result<()>
where
    M: Send + Sync + 'static,
{
    target.target_mbox().deliver(Envelope::immutable(payload), 1)
}

/// Sends a signal of type `S`.
pub fn send_signal<S: 'static>(target: &impl SendTarget) -> Result<()> {
    target.target_mbox().deliver(Envelope::signal::<S>(), 1)
}

/// Sends a mutable message; the receiving handler is its only observer.
pub fn send_mutable<M>(target: &impl SendTarget, payload: M) -> Result<()>
where
    M: Send + 'static,
{
    target.target_mbox().deliver(Envelope::mutable(payload), 1)
}

/// Sends a prebuilt message reference.
///
/// A mutable envelope must be uniquely owned at this point; otherwise the
/// send fails with [`Error::MutableNotUnique`].
pub fn send_message(target: &impl SendTarget, message: MessageRef) -> Result<()> {
    if message.is_mutable() && Arc::strong_count(&message) > 1 {
        return Err(Error::MutableNotUnique);
    }
    target.target_mbox().deliver(message, 1)
}

/// Sends the holder's message.
pub fn send_holder<M: 'static>(target: &impl SendTarget, holder: &MessageHolder<M>) -> Result<()> {
    target.target_mbox().deliver(holder.make_ref(), 1)
}

/// Delivers an immutable message after `delay`.
pub fn send_delayed<M>(target: &impl SendTarget, delay: Duration, payload: M) -> Result<()>
where
    M: Send + Sync + 'static,
{
    let mbox = target.target_mbox();
    let env = mbox.environment()?;
    env.single_timer(mbox, Envelope::immutable(payload), delay)
}

/// Delivers a signal after `delay`.
pub fn send_delayed_signal<S: 'static>(target: &impl SendTarget, delay: Duration) -> Result<()> {
    let mbox = target.target_mbox();
    let env = mbox.environment()?;
    env.single_timer(mbox, Envelope::signal::<S>(), delay)
}

/// Delivers an immutable message after `delay` and then every `period`.
///
/// The returned id cancels the timer when released or dropped.
pub fn send_periodic<M>(
    target: &impl SendTarget,
    delay: Duration,
    period: Duration,
    payload: M,
) -> Result<TimerId>
where
    M: Send + Sync + 'static,
{
    let mbox = target.target_mbox();
    let env = mbox.environment()?;
    env.schedule_timer(mbox, Envelope::immutable(payload), delay, Some(period))
}

/// Periodic signal delivery.
pub fn send_periodic_signal<S: 'static>(
    target: &impl SendTarget,
    delay: Duration,
    period: Duration,
) -> Result<TimerId> {
    let mbox = target.target_mbox();
    let env = mbox.environment()?;
    env.schedule_timer(mbox, Envelope::signal::<S>(), delay, Some(period))
}
