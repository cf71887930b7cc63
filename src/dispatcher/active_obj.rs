//! Active-object dispatcher: one worker thread per bound agent, so every
//! agent runs on a thread of its own.

use crate::agent::{AgentId, AgentRef};
use crate::dispatcher::{
    activate_agent_on_queue, drain_queue_worker, ActivityTracker, DemandQueue, DispBinder,
    Dispatcher, DispatcherParams, QueueLockPolicy, QueueStats, WorkThread, WorkThreadFactory,
    WorkerActivity,
};
use crate::clock::Clock;
use crate::env::Environment;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct AgentWorker {
    queue: Arc<DemandQueue>,
    tracker: Arc<ActivityTracker>,
    thread: Option<Box<dyn WorkThread>>,
}

pub struct ActiveObjDispatcher {
    name: String,
    queue_lock: QueueLockPolicy,
    track_activity: bool,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn WorkThreadFactory>,
    workers: Mutex<HashMap<AgentId, AgentWorker>>,
    self_weak: std::sync::Weak<Self>,
}

impl ActiveObjDispatcher {
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: DispatcherParams,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let factory = env.work_thread_factory();
        let dispatcher = Arc::new_cyclic(|weak| Self {
            name,
            queue_lock: params.queue_lock,
            track_activity: params.track_activity,
            clock: params.clock,
            factory,
            workers: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
        });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }

    fn stop_worker(&self, mut worker: AgentWorker) {
        worker.queue.close();
        if let Some(mut thread) = worker.thread.take() {
            let _ = thread.join();
            self.factory.release(thread);
        }
    }
}

impl Dispatcher for ActiveObjDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        let dispatcher = self
            .self_weak
            .upgrade()
            .expect("dispatcher is owned by the environment");
        Arc::new(ActiveObjBinder { dispatcher })
    }

    fn shutdown(&self) {
        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };
        for (_, worker) in workers {
            self.stop_worker(worker);
        }
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .iter()
            .map(|(agent, worker)| QueueStats {
                queue: format!("agent_{agent}"),
                demands: worker.queue.len(),
            })
            .collect()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .iter()
            .map(|(agent, worker)| WorkerActivity {
                worker: format!("{}/agent_{agent}", self.name),
                stats: worker.tracker.snapshot(),
            })
            .collect()
    }
}

struct ActiveObjBinder {
    dispatcher: Arc<ActiveObjDispatcher>,
}

impl DispBinder for ActiveObjBinder {
    fn preallocate(&self, env: &Environment, agent: &AgentRef) -> Result<()> {
        let disp = &self.dispatcher;
        let queue = DemandQueue::new(disp.queue_lock);
        let tracker = ActivityTracker::new(disp.track_activity, Arc::clone(&disp.clock));

        let mut thread = disp.factory.acquire(env)?;
        let worker_queue = Arc::clone(&queue);
        let worker_tracker = Arc::clone(&tracker);
        thread.start(Box::new(move || {
            drain_queue_worker(worker_queue, worker_tracker)
        }))?;

        let mut workers = disp.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.insert(
            agent.id(),
            AgentWorker {
                queue,
                tracker,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    fn bind(&self, agent: &AgentRef) {
        let queue = {
            let workers = self
                .dispatcher
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            workers.get(&agent.id()).map(|w| Arc::clone(&w.queue))
        };
        match queue {
            Some(queue) => activate_agent_on_queue(agent, queue as _),
            None => {
                log::error!("active_obj bind without preallocation");
                std::process::abort();
            }
        }
    }

    fn unbind(&self, agent: &AgentRef) {
        let worker = {
            let mut workers = self
                .dispatcher
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            workers.remove(&agent.id())
        };
        if let Some(worker) = worker {
            self.dispatcher.stop_worker(worker);
        }
    }
}
