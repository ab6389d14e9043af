//! Concurrency and status dispatch.
//!
//! Every service id gets its own [`ServiceWorker`](worker::ServiceWorker): a
//! task with an unbounded FIFO queue that executes lifecycle operations one at
//! a time. Workers are spawned on the first request for an id and retire when
//! their queue runs dry, so idle ids cost nothing. Distinct ids run in parallel.
//!
//! Install and remove outcomes are published on one shared status channel,
//! one [`StatusEvent`] per accepted request, in completion order.

mod message;
mod worker;

pub use message::{Response, ServiceRequest};

use crate::error::LauncherError;
use crate::lifecycle::Lifecycle;
use crate::model::{ServiceInfo, StatusEvent};
use crate::sweep::{Decision, SweepPass};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use worker::{ServiceWorker, WorkerTable};

pub type StatusSender = mpsc::UnboundedSender<StatusEvent>;
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusEvent>;

/// Receiver half handed to bulk callers.
pub type Pending<T> = oneshot::Receiver<Result<T, LauncherError>>;

pub struct Dispatcher {
    lifecycle: Arc<Lifecycle>,
    status: StatusSender,
    workers: Arc<WorkerTable>,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(lifecycle: Arc<Lifecycle>) -> (Self, StatusReceiver) {
        let (status, receiver) = mpsc::unbounded_channel();
        let dispatcher = Self {
            lifecycle,
            status,
            workers: Arc::default(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        };
        (dispatcher, receiver)
    }

    /// Queues an install. The outcome arrives on the status channel.
    pub fn submit_install(&self, info: ServiceInfo) -> Result<(), LauncherError> {
        let id = info.id.clone();
        self.send(&id, ServiceRequest::Install { info })
    }

    /// Queues a remove. The outcome arrives on the status channel.
    pub fn submit_remove(&self, id: &str) -> Result<(), LauncherError> {
        self.send(id, ServiceRequest::Remove)
    }

    /// Queues a remove whose outcome is returned to the caller instead of
    /// being published. Resolves to the removed version.
    pub fn teardown(&self, id: &str) -> Result<Pending<Option<u64>>, LauncherError> {
        let (respond_to, response) = oneshot::channel();
        self.send(id, ServiceRequest::Teardown { respond_to })?;
        Ok(response)
    }

    /// Queues a sweep reconcile of `id`.
    pub fn reconcile(&self, id: &str, pass: SweepPass) -> Result<Pending<Decision>, LauncherError> {
        let (respond_to, response) = oneshot::channel();
        self.send(id, ServiceRequest::Reconcile { pass, respond_to })?;
        Ok(response)
    }

    /// Number of ids with a live worker.
    pub fn active_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stops accepting requests and waits until every queued one has finished.
    pub async fn close(&self) {
        {
            let _workers = self.workers.lock();
            self.closed.store(true, Ordering::SeqCst);
            self.tracker.close();
        }
        info!(workers = self.tracker.len(), "Draining workers");
        self.tracker.wait().await;
        info!("Dispatcher closed");
    }

    fn send(&self, id: &str, request: ServiceRequest) -> Result<(), LauncherError> {
        let mut workers = self.workers.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(LauncherError::Closed);
        }

        let request = match workers.get(id) {
            Some(queue) => match queue.send(request) {
                Ok(()) => return Ok(()),
                // The worker died without retiring; start over with a new one.
                Err(mpsc::error::SendError(request)) => request,
            },
            None => request,
        };

        let (queue, receiver) = mpsc::unbounded_channel();
        queue.send(request).map_err(|_| LauncherError::WorkerDropped)?;
        workers.insert(id.to_string(), queue);

        debug!(id, "Spawning worker");
        let worker = ServiceWorker::new(
            id.to_string(),
            receiver,
            self.lifecycle.clone(),
            self.status.clone(),
            self.workers.clone(),
        );
        self.tracker.spawn(worker.run());
        Ok(())
    }
}
