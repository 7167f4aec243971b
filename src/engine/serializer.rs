//! Single-flight inference queue
//!
//! The underlying engine is not reentrant, so every call for a model
//! instance goes through one queue consumer that owns the engine. Jobs run
//! one at a time in submission order, and a job that fails or panics does
//! not stop the ones queued behind it.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{FaceError, Result};

type Job<E> = Box<dyn FnOnce(&mut E) + Send>;

/// FIFO, at-most-one-in-flight wrapper around an engine handle
pub struct InferenceSerializer<E> {
    name: String,
    jobs: mpsc::UnboundedSender<Job<E>>,
    queued: Arc<AtomicUsize>,
}

impl<E: Send + 'static> InferenceSerializer<E> {
    /// Take ownership of `engine` and start the queue consumer
    ///
    /// Must be called from within a tokio runtime. The consumer exits, and
    /// drops the engine, once the serializer is dropped and the queue drains.
    pub fn new(name: impl Into<String>, mut engine: E) -> Self {
        let name = name.into();
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job<E>>();
        let queued = Arc::new(AtomicUsize::new(0));

        let task_name = name.clone();
        let task_queued = queued.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| job(&mut engine))).is_err() {
                    warn!("Inference task on {} panicked; continuing with next task", task_name);
                }
                task_queued.fetch_sub(1, Ordering::SeqCst);
                // Let other tasks on a single-threaded runtime make progress.
                tokio::task::yield_now().await;
            }
            debug!("Inference queue for {} closed", task_name);
        });

        Self { name, jobs, queued }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs submitted but not yet finished
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Queue `task` and return a future for its result
    ///
    /// The task is enqueued before this returns, so call order is execution
    /// order regardless of when the returned futures are polled.
    pub fn run<R, F>(&self, task: F) -> impl Future<Output = Result<R>> + Send + 'static
    where
        F: FnOnce(&mut E) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<E> = Box::new(move |engine| {
            let _ = tx.send(task(engine));
        });

        self.queued.fetch_add(1, Ordering::SeqCst);
        let sent = self.jobs.send(job).is_ok();
        if !sent {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }

        let name = self.name.clone();
        async move {
            if !sent {
                return Err(FaceError::Disposed);
            }
            rx.await
                .map_err(|_| FaceError::inference(format!("inference task on {} panicked", name)))?
        }
    }
}
