//! One-thread dispatcher: a single worker drains one FIFO queue shared by
//! all bound agents. This is the environment's default dispatcher.

use crate::agent::AgentRef;
use crate::dispatcher::{
    activate_agent_on_queue, drain_queue_worker, ActivityTracker, DemandQueue, DispBinder,
    Dispatcher, DispatcherParams, QueueStats, WorkThread, WorkThreadFactory, WorkerActivity,
};
use crate::env::Environment;
use crate::error::Result;
use std::sync::{Arc, Mutex};

pub struct OneThreadDispatcher {
    name: String,
    queue: Arc<DemandQueue>,
    tracker: Arc<ActivityTracker>,
    factory: Arc<dyn WorkThreadFactory>,
    worker: Mutex<Option<Box<dyn WorkThread>>>,
}

impl OneThreadDispatcher {
    /// Creates the dispatcher, starts its worker and registers it with the
    /// environment.
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: DispatcherParams,
    ) -> Result<Arc<Self>> {
        let queue = DemandQueue::new(params.queue_lock);
        let tracker = ActivityTracker::new(params.track_activity, params.clock);
        let factory = env.work_thread_factory();

        let mut thread = factory.acquire(env)?;
        let worker_queue = Arc::clone(&queue);
        let worker_tracker = Arc::clone(&tracker);
        thread.start(Box::new(move || {
            drain_queue_worker(worker_queue, worker_tracker)
        }))?;

        let dispatcher = Arc::new(Self {
            name: name.into(),
            queue,
            tracker,
            factory,
            worker: Mutex::new(Some(thread)),
        });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }
}

impl Dispatcher for OneThreadDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        Arc::new(OneThreadBinder {
            queue: Arc::clone(&self.queue),
        })
    }

    fn shutdown(&self) {
        self.queue.close();
        let thread = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some(mut thread) = thread {
            let _ = thread.join();
            self.factory.release(thread);
        }
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        vec![QueueStats {
            queue: "fifo".to_string(),
            demands: self.queue.len(),
        }]
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        vec![WorkerActivity {
            worker: format!("{}/worker", self.name),
            stats: self.tracker.snapshot(),
        }]
    }
}

struct OneThreadBinder {
    queue: Arc<DemandQueue>,
}

impl DispBinder for OneThreadBinder {
    fn preallocate(&self, _env: &Environment, _agent: &AgentRef) -> Result<()> {
        Ok(())
    }

    fn bind(&self, agent: &AgentRef) {
        activate_agent_on_queue(agent, Arc::clone(&self.queue) as _);
    }

    fn unbind(&self, _agent: &AgentRef) {}
}
