use super::message::ServiceRequest;
use super::StatusSender;
use crate::error::LauncherError;
use crate::lifecycle::Lifecycle;
use crate::model::{Action, StatusEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue senders of the live workers, keyed by service id.
pub(super) type WorkerTable = Mutex<HashMap<String, mpsc::UnboundedSender<ServiceRequest>>>;

/// Sequential executor for the requests of one service id.
///
/// A worker owns its queue and processes it to the end. When the queue is
/// empty it removes itself from the table while holding the table lock, so a
/// request is either seen by this worker or spawns a fresh one.
pub(super) struct ServiceWorker {
    id: String,
    receiver: mpsc::UnboundedReceiver<ServiceRequest>,
    lifecycle: Arc<Lifecycle>,
    status: StatusSender,
    table: Arc<WorkerTable>,
}

impl ServiceWorker {
    pub(super) fn new(
        id: String,
        receiver: mpsc::UnboundedReceiver<ServiceRequest>,
        lifecycle: Arc<Lifecycle>,
        status: StatusSender,
        table: Arc<WorkerTable>,
    ) -> Self {
        Self {
            id,
            receiver,
            lifecycle,
            status,
            table,
        }
    }

    /// Runs the worker loop until the queue is drained.
    pub(super) async fn run(mut self) {
        debug!(id = %self.id, "Worker started");

        while let Some(request) = self.next_request() {
            match request {
                ServiceRequest::Install { info } => {
                    let error = self.lifecycle.install(&info).await.err();
                    self.report(info.version, Action::Install, error);
                }
                ServiceRequest::Remove => match self.lifecycle.remove(&self.id).await {
                    Ok(version) => self.report(version.unwrap_or_default(), Action::Remove, None),
                    Err(e) => {
                        let version = self.lifecycle.installed_version(&self.id).await;
                        self.report(version.unwrap_or_default(), Action::Remove, Some(e));
                    }
                },
                ServiceRequest::Teardown { respond_to } => {
                    let result = self.lifecycle.remove(&self.id).await;
                    let _ = respond_to.send(result);
                }
                ServiceRequest::Reconcile { pass, respond_to } => {
                    let result = self.lifecycle.reconcile(&self.id, &pass).await;
                    let _ = respond_to.send(result);
                }
            }
        }

        debug!(id = %self.id, "Worker retired");
    }

    fn next_request(&mut self) -> Option<ServiceRequest> {
        if let Ok(request) = self.receiver.try_recv() {
            return Some(request);
        }
        let mut table = self.table.lock();
        match self.receiver.try_recv() {
            Ok(request) => Some(request),
            Err(_) => {
                table.remove(&self.id);
                None
            }
        }
    }

    fn report(&self, version: u64, action: Action, error: Option<LauncherError>) {
        match &error {
            None => info!(id = %self.id, version, ?action, "Request done"),
            Some(e) => warn!(
                id = %self.id,
                version,
                ?action,
                kind = ?e.kind(),
                error = %e,
                "Request failed"
            ),
        }

        let event = StatusEvent {
            id: self.id.clone(),
            version,
            action,
            error,
        };
        if self.status.send(event).is_err() {
            debug!(id = %self.id, "Status receiver dropped");
        }
    }
}
