//! Noexcept-evt-finish thread pool.
//!
//! Behaves like the plain thread pool, but every binding preallocates the
//! storage for its `evt_finish` demand at bind time, so pushing the finish
//! demand allocates nothing and cannot fail. Deregistration can therefore
//! rely on the finish event reaching the queue under any conditions.

use crate::dispatcher::thread_pool::{PoolBinder, PoolRuntime};
use crate::dispatcher::{DispBinder, Dispatcher, QueueStats, ThreadPoolParams, WorkerActivity};
use crate::env::Environment;
use crate::error::Result;
use std::sync::Arc;

pub struct NefThreadPoolDispatcher {
    runtime: Arc<PoolRuntime>,
}

impl NefThreadPoolDispatcher {
    pub fn create(
        env: &Environment,
        name: impl Into<String>,
        params: ThreadPoolParams,
    ) -> Result<Arc<Self>> {
        let runtime = PoolRuntime::create(env, name.into(), params)?;
        let dispatcher = Arc::new(Self { runtime });
        env.register_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }
}

impl Dispatcher for NefThreadPoolDispatcher {
    fn name(&self) -> &str {
        &self.runtime.name
    }

    fn binder(&self) -> Arc<dyn DispBinder> {
        Arc::new(PoolBinder {
            runtime: Arc::clone(&self.runtime),
            preallocate_finish: true,
        })
    }

    fn shutdown(&self) {
        self.runtime.shutdown();
    }

    fn queue_stats(&self) -> Vec<QueueStats> {
        self.runtime.queue_stats()
    }

    fn activity_stats(&self) -> Vec<WorkerActivity> {
        self.runtime.activity_stats()
    }
}
