//! Active-group dispatcher: one worker thread per named group; agents
//! bound to the same group share a FIFO queue.

use crate::agent::AgentRef;
use crate::clock::Clock;
use crate::dispatcher::{
    activate_agent_on_queue, drain_queue_worker, ActivityTracker, DemandQueue, DispBinder,
    Dispatcher, DispatcherParams, QueueLockPolicy, QueueStats, WorkThread, WorkThreadFactory,
    WorkerActivity,
};
use crate::env::Environment;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

struct GroupWorker {
    queue: Arc<DemandQueue>,
    tracker: Arc<ActivityTracker>,
    thread: Option<Box<dyn WorkThread>>,
    agents: usize,
}

pub struct ActiveGroupDispatcher {
    name: String,
    queue_lock: QueueLockPolicy,
    track_activity: bool,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn WorkThreadFactory>,
    groups: Mutex<HashMap<String, GroupWorker>>,
    self_weak: Weak<Self>,
}

impl ActiveGroupDispatcher {
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
            groups: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
        });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }

    /// Binder placing agents into the named group.
    pub fn group_binder(self: &Arc<Self>, group: impl Into<String>) -> Arc<dyn DispBinder> {
        Arc::new(ActiveGroupBinder {
            dispatcher: Arc::clone(self),
            group: group.into(),
        })
    }

    fn stop_worker(&self, mut worker: GroupWorker) {
        worker.queue.close();
        if let Some(mut thread) = worker.thread.take() {
            let _ = thread.join();
            self.factory.release(thread);
        }
    }
}

impl Dispatcher for ActiveGroupDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    /// The plain binder uses a group named after the dispatcher.
    fn binder(&self) -> Arc<dyn DispBinder> {
        let dispatcher = self
            .self_weak
            .upgrade()
            .expect("dispatcher is owned by the environment");
        let group = dispatcher.name.clone();
        Arc::new(ActiveGroupBinder { dispatcher, group })
    }

    fn shutdown(&self) {
        let groups = {
            let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *groups)
        };
        for (_, worker) in groups {
            self.stop_worker(worker);
        }
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .iter()
            .map(|(group, worker)| QueueStats {
                queue: format!("group_{group}"),
                demands: worker.queue.len(),
            })
            .collect()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .iter()
            .map(|(group, worker)| WorkerActivity {
                worker: format!("{}/group_{group}", self.name),
                stats: worker.tracker.snapshot(),
            })
            .collect()
    }
}

struct ActiveGroupBinder {
    dispatcher: Arc<ActiveGroupDispatcher>,
    group: String,
}

impl DispBinder for ActiveGroupBinder {
    fn preallocate(&self, env: &Environment, _agent: &AgentRef) -> Result<()> {
        let disp = &self.dispatcher;
        let mut groups = disp.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = groups.get_mut(&self.group) {
            worker.agents += 1;
            return Ok(());
        }

        let queue = DemandQueue::new(disp.queue_lock);
        let tracker = ActivityTracker::new(disp.track_activity, Arc::clone(&disp.clock));
        let mut thread = disp.factory.acquire(env)?;
        let worker_queue = Arc::clone(&queue);
        let worker_tracker = Arc::clone(&tracker);
        thread.start(Box::new(move || {
            drain_queue_worker(worker_queue, worker_tracker)
        }))?;

        groups.insert(
            self.group.clone(),
            GroupWorker {
                queue,
                tracker,
                thread: Some(thread),
                agents: 1,
            },
        );
        Ok(())
    }

    fn bind(&self, agent: &AgentRef) {
        let queue = {
            let groups = self
                .dispatcher
                .groups
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            groups.get(&self.group).map(|w| Arc::clone(&w.queue))
        };
        match queue {
            Some(queue) => activate_agent_on_queue(agent, queue as _),
            None => {
                log::error!("active_group bind without preallocation");
                std::process::abort();
            }
        }
    }

    fn unbind(&self, _agent: &AgentRef) {
        let worker = {
            let mut groups = self
                .dispatcher
                .groups
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match groups.get_mut(&self.group) {
                Some(worker) => {
                    worker.agents -= 1;
                    if worker.agents == 0 {
                        groups.remove(&self.group)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(worker) = worker {
            self.dispatcher.stop_worker(worker);
        }
    }
}
