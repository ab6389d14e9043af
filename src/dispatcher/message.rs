use crate::error::LauncherError;
use crate::model::ServiceInfo;
use crate::sweep::{Decision, SweepPass};
use tokio::sync::oneshot;

/// Type alias for the one-shot response channel used by bulk callers.
pub type Response<T> = oneshot::Sender<Result<T, LauncherError>>;

/// Request queued on the worker of one service id.
///
/// `Install` and `Remove` are fire-and-forget and report through the status
/// channel. `Teardown` and `Reconcile` are issued by bulk operations, which
/// join on the response instead.
#[derive(Debug)]
pub enum ServiceRequest {
    Install {
        info: ServiceInfo,
    },
    Remove,
    Teardown {
        respond_to: Response<Option<u64>>,
    },
    Reconcile {
        pass: SweepPass,
        respond_to: Response<Decision>,
    },
}
