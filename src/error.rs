use thiserror::Error;

/// Errors surfaced by the framework.
///
/// Programming errors (duplicate subscriptions, illegal mbox usage and the
/// like) are reported at the call site; runtime conditions such as a full
/// message chain carry enough context for the producer to react.
#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate subscription: {0}")]
    DuplicateSubscription(String),

    #[error("only the owning agent can subscribe to an MPSC mbox")]
    IllegalMpscSubscriber,

    #[error("delivery filters cannot be used with MPSC mboxes")]
    DeliveryFilterOnMpsc,

    #[error("mutable message cannot be used with a multi-consumer mbox")]
    MutableOnMpmc,

    #[error("mutable message envelope must be uniquely owned at send time")]
    MutableNotUnique,

    #[error("a mutable message cannot be sent periodically")]
    MutablePeriodic,

    #[error("several limits are defined for message type {0}")]
    SeveralLimits(&'static str),

    #[error("message limits can only be defined during agent definition")]
    LimitsFrozen,

    #[error("overlimit reaction recursion is too deep for message type {0}")]
    OverlimitRecursion(&'static str),

    #[error("transfer_to_state loop detected for message type {0}")]
    TransferLoop(&'static str),

    #[error("cooperation name is already in use: {0}")]
    CoopNameInUse(String),

    #[error("cooperation is not found: {0}")]
    CoopNotFound(String),

    #[error("cooperation has no agents: {0}")]
    EmptyCoop(String),

    #[error("cooperation registration failed: {0}")]
    RegistrationFailed(String),

    #[error("environment is shutting down")]
    ShuttingDown,

    #[error("agent is not bound to an event queue")]
    NotBound,

    #[error("unknown state")]
    UnknownState,

    #[error("an initial substate is not defined for composite state {0}")]
    NoInitialSubstate(String),

    #[error("state nesting is too deep")]
    StateNestingTooDeep,

    #[error("operation is allowed only during agent definition")]
    NotInDefinition,

    #[error("state change is not allowed from a thread-safe event handler")]
    StateChangeFromSharedHandler,

    #[error("message chain is full")]
    ChainFull,

    #[error("message chain is closed")]
    ChainClosed,

    #[error("timeout expired")]
    Timeout,

    #[error("operation is not supported: {0}")]
    NotSupported(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
