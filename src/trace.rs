//! Message delivery tracing.
//!
//! When a tracer is installed at environment creation every subscription
//! change, delivery attempt, filter rejection, overlimit reaction and
//! push-to-queue is reported to it as one formatted line. Mboxes are built
//! in a traced or untraced flavor; the untraced flavor does no work at all
//! on the delivery path.

use crate::agent::AgentId;
use crate::mbox::MboxId;
use crate::message::Envelope;
use std::sync::Arc;

/// Receiver of trace lines.
pub trait Tracer: Send + Sync {
    fn trace(&self, line: &str);
}

/// Tracer that forwards to the `log` facade at trace level.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn trace(&self, line: &str) {
        log::trace!(target: "conclave::msg_trace", "{line}");
    }
}

/// One traced operation, handed to the trace filter before formatting.
pub struct TraceEvent<'a> {
    /// Operation name, e.g. `deliver_message.push_to_queue`.
    pub op: &'a str,
    pub mbox_id: MboxId,
    pub mbox_name: &'a str,
    pub msg_type: &'a str,
    /// Receiver agent, when the operation concerns a specific subscriber.
    pub agent: Option<AgentId>,
    /// Free-form tail, e.g. overlimit reaction details.
    pub extra: Option<&'a str>,
}

/// Predicate deciding whether an event reaches the tracer.
pub type TraceFilter = Box<dyn Fn(&TraceEvent<'_>) -> bool + Send + Sync>;

pub(crate) struct TracerCore {
    tracer: Box<dyn Tracer>,
    filter: Option<TraceFilter>,
}

impl TracerCore {
    pub(crate) fn new(tracer: Box<dyn Tracer>, filter: Option<TraceFilter>) -> Self {
        Self { tracer, filter }
    }

    pub(crate) fn emit(&self, event: &TraceEvent<'_>) {
        if let Some(filter) = &self.filter {
            if !filter(event) {
                return;
            }
        }
        let mut line = format!(
            "[tid={}][mbox_id={}:{}] {} [msg_type={}]",
            current_tid(),
            event.mbox_id,
            event.mbox_name,
            event.op,
            event.msg_type,
        );
        if let Some(agent) = event.agent {
            line.push_str(&format!("[agent={agent}]"));
        }
        if let Some(extra) = event.extra {
            line.push('[');
            line.push_str(extra);
            line.push(']');
        }
        self.tracer.trace(&line);
    }
}

/// Tracing strategy carried by each mbox; `None` means the untraced flavor.
#[derive(Clone)]
pub(crate) struct MboxTracing(Option<Arc<TracerCore>>);

impl MboxTracing {
    pub(crate) fn disabled() -> Self {
        Self(None)
    }

    pub(crate) fn new(core: Option<Arc<TracerCore>>) -> Self {
        Self(core)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    pub(crate) fn core(&self) -> Option<&Arc<TracerCore>> {
        self.0.as_ref()
    }

    pub(crate) fn emit(
        &self,
        op: &str,
        mbox_id: MboxId,
        mbox_name: &str,
        message: &Envelope,
        agent: Option<AgentId>,
        extra: Option<&str>,
    ) {
        if let Some(core) = &self.0 {
            core.emit(&TraceEvent {
                op,
                mbox_id,
                mbox_name,
                msg_type: message.type_name(),
                agent,
                extra,
            });
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn current_tid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn current_tid() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|tid| *tid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<String>>);

    impl Tracer for Capture {
        fn trace(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[test]
    fn filter_suppresses_events() {
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let sink: Arc<Capture> = Arc::clone(&capture);
        struct Fwd(Arc<Capture>);
        impl Tracer for Fwd {
            fn trace(&self, line: &str) {
                self.0.trace(line);
            }
        }
        let core = TracerCore::new(
            Box::new(Fwd(sink)),
            Some(Box::new(|ev: &TraceEvent<'_>| ev.mbox_id != 42)),
        );

        let msg = Envelope::signal::<()>();
        core.emit(&TraceEvent {
            op: "deliver_message.push_to_queue",
            mbox_id: 42,
            mbox_name: "<mpmc>",
            msg_type: msg.type_name(),
            agent: None,
            extra: None,
        });
        core.emit(&TraceEvent {
            op: "deliver_message.push_to_queue",
            mbox_id: 7,
            mbox_name: "<mpmc>",
            msg_type: msg.type_name(),
            agent: Some(3),
            extra: None,
        });

        let lines = capture.0.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("mbox_id=7"));
        assert!(lines[0].contains("[agent=3]"));
    }
}
