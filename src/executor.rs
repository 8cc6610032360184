//! Background execution for session calls.
//!
//! Gateway round trips are blocking, so asynchronous session methods run
//! them on a bounded blocking pool and hand back a [`Task`] the caller can
//! wait on. The pool starts lazily with the first task and is shared by
//! all tasks of one session.

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::core::{Result, SessionError};

const WORKER_COUNT: usize = 8;

pub struct Executor {
    runtime: Runtime,
}

impl Executor {
    pub fn new() -> Result<Executor> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(WORKER_COUNT)
            .thread_name("tracksession-worker")
            .build()
            .map_err(|err| SessionError::Internal(format!("cannot start worker pool: {}", err)))?;
        Ok(Executor { runtime })
    }

    pub fn submit<T, F>(&self, job: F) -> Task<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Task {
            handle: self.runtime.handle().clone(),
            join: self.runtime.spawn_blocking(job),
        }
    }
}

/// A handle to a running background job.
pub struct Task<T> {
    handle: Handle,
    join: JoinHandle<T>,
}

impl<T> Task<T> {
    /// Block until the job finishes and return its result.
    pub fn wait(self) -> Result<T> {
        self.handle
            .block_on(self.join)
            .map_err(|err| SessionError::Internal(format!("worker task failed: {}", err)))
    }

    pub fn is_done(&self) -> bool {
        self.join.is_finished()
    }
}
