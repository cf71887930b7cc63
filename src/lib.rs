//! In-process actor framework.
//!
//! Applications compose their logic from concurrent agents that communicate
//! exclusively by message passing through message boxes. The framework
//! routes messages to subscribers, hands each agent its events on a thread
//! chosen by a pluggable dispatcher, and manages lifetimes of agent groups
//! (cooperations) and of the environment that owns everything.
//!
//! ```no_run
//! use conclave::prelude::*;
//!
//! struct Greeter;
//!
//! struct Hello {
//!     who: String,
//! }
//!
//! impl Agent for Greeter {
//!     fn so_define_agent(&mut self, ctx: &AgentContext) -> conclave::Result<()> {
//!         ctx.subscribe_self()
//!             .event(|_this: &mut Greeter, ctx, msg: &Hello| {
//!                 log::info!("hello, {}", msg.who);
//!                 ctx.environment().stop();
//!             })?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> conclave::Result<()> {
//!     conclave::launch(|env| {
//!         let mut coop = env.create_coop("greeting");
//!         let greeter = coop.add_agent(Greeter);
//!         env.register_coop(coop)?;
//!         conclave::send(&greeter, Hello { who: "world".into() })
//!     })
//! }
//! ```

pub mod agent;
pub mod clock;
pub mod coop;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod limits;
pub mod mbox;
pub mod mchain;
pub mod message;
pub mod send;
pub mod stats;
pub mod subscription;
pub mod timer;
pub mod trace;

pub mod sink;

pub use agent::{
    Agent, AgentContext, AgentId, AgentOptions, AgentRef, ExceptionReaction, History, Priority,
    State,
};
pub use coop::{Coop, CoopListener, DeregReason};
pub use env::{launch, launch_with, Environment, EnvironmentParams};
pub use error::{Error, Result};
pub use limits::{transformed, transformed_signal, AnyUnspecified, Limits};
pub use mbox::{Mbox, MboxId, MboxKind, MboxRef};
pub use mchain::{
    close_drop_content, close_retain_content, from, from_all, receive, receive_case, select,
    send_case, ChainHandlers, ChainParams, CloseMode, Mchain, MchainRef, MemoryUsage,
    OverflowReaction, ReceiveResult, ReceiveStatus, SelectResult, SelectStatus,
};
pub use message::{Envelope, MessageHolder, MessageRef};
pub use send::{
    send, send_delayed, send_delayed_signal, send_holder, send_message, send_mutable,
    send_periodic, send_periodic_signal, send_signal, SendTarget,
};
pub use subscription::StorageFactory;
pub use timer::{TimerEngineKind, TimerId};

/// The names most programs need.
pub mod prelude {
    pub use crate::agent::{
        Agent, AgentContext, AgentOptions, AgentRef, ExceptionReaction, History, Priority, State,
    };
    pub use crate::coop::{Coop, DeregReason};
    pub use crate::env::{launch, launch_with, Environment, EnvironmentParams};
    pub use crate::error::{Error, Result};
    pub use crate::limits::Limits;
    pub use crate::mbox::MboxRef;
    pub use crate::mchain::{
        close_drop_content, close_retain_content, from, from_all, receive, receive_case, select,
        send_case, ChainHandlers, ChainParams, MchainRef, MemoryUsage, OverflowReaction,
    };
    pub use crate::message::MessageHolder;
    pub use crate::send::{
        send, send_delayed, send_delayed_signal, send_mutable, send_periodic,
        send_periodic_signal, send_signal,
    };
}
