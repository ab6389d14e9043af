use crate::error::LauncherError;

/// Kind of request a [`StatusEvent`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Remove,
}

/// Outcome of one accepted install or remove request.
///
/// Exactly one event is delivered per accepted request, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub id: String,
    pub version: u64,
    pub action: Action,
    pub error: Option<LauncherError>,
}

impl StatusEvent {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
