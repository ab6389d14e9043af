//! User-binding and TTL sweep.
//!
//! Runs whenever the active user set is applied. Every record gets one
//! [`Decision`], executed on the record's own worker so it serializes with
//! installs and removes of the same id:
//!
//! 1. expired records are reclaimed whoever owns them;
//! 2. records owned by the active users are started if not running;
//! 3. everything else is stopped but kept, bundle included.
//!
//! After the fan-in the runtime is reloaded once and user sets left without a
//! service are purged.
//!
//! The first sweep after the launcher is built is a *cold* pass: recorded
//! states come from an earlier process and say nothing about what the runtime
//! runs now, so every in-scope record is started and every other one stopped.

use crate::dispatcher::Dispatcher;
use crate::error::LauncherError;
use crate::model::{ServiceRecord, ServiceState, UserSet};
use crate::registry::Registry;
use crate::runtime::RuntimeAdapter;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// TTL expired: remove bundle, record and binding.
    Reclaim,
    /// Owned by the active users and not running.
    Start,
    /// Not owned by the active users and not stopped.
    Stop,
    Keep,
}

/// Inputs shared by every reconcile of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPass {
    pub users: UserSet,
    pub now: DateTime<Utc>,
    /// Recorded states are not trusted; start or stop every record.
    pub cold: bool,
}

impl SweepPass {
    pub fn new(users: UserSet, now: DateTime<Utc>) -> Self {
        Self {
            users,
            now,
            cold: false,
        }
    }

    pub fn cold(mut self) -> Self {
        self.cold = true;
        self
    }
}

/// Decides what the sweep does with `record`.
///
/// `in_scope` tells whether the record is bound to the active user set.
pub fn decide(record: &ServiceRecord, in_scope: bool, pass: &SweepPass) -> Decision {
    if record.is_expired(pass.now) {
        Decision::Reclaim
    } else if in_scope && (pass.cold || record.state != ServiceState::Running) {
        Decision::Start
    } else if !in_scope && (pass.cold || record.state != ServiceState::Stopped) {
        Decision::Stop
    } else {
        Decision::Keep
    }
}

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub started: usize,
    pub stopped: usize,
    pub reclaimed: usize,
    pub kept: usize,
    /// Records whose reconcile failed; they keep their previous state.
    pub failed: Vec<String>,
    /// User sets purged because no service is bound to them anymore.
    pub purged: Vec<UserSet>,
}

impl SweepReport {
    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Reclaim => self.reclaimed += 1,
            Decision::Start => self.started += 1,
            Decision::Stop => self.stopped += 1,
            Decision::Keep => self.kept += 1,
        }
    }
}

/// Reconciles every installed service against the users of `pass`.
///
/// Fails with [`LauncherError::Consistency`] when an expired record survives
/// the sweep.
pub async fn sweep(
    dispatcher: &Dispatcher,
    registry: &dyn Registry,
    runtime: &dyn RuntimeAdapter,
    pass: &SweepPass,
) -> Result<SweepReport, LauncherError> {
    let records = registry.services().await?;
    info!(users = %pass.users, cold = pass.cold, services = records.len(), "Sweep started");

    let mut pending = Vec::with_capacity(records.len());
    for record in &records {
        pending.push(dispatcher.reconcile(&record.id, pass.clone())?);
    }

    let mut report = SweepReport::default();
    for (record, outcome) in records.iter().zip(join_all(pending).await) {
        match outcome.unwrap_or(Err(LauncherError::WorkerDropped)) {
            Ok(decision) => report.record(decision),
            Err(e) => {
                warn!(id = %record.id, error = %e, "Reconcile failed");
                report.failed.push(record.id.clone());
            }
        }
    }

    runtime.reload().await?;

    report.purged = purge_orphans(registry).await?;

    let mut survivors = Vec::new();
    for record in records.iter().filter(|r| r.is_expired(pass.now)) {
        if let Some(current) = registry.find_service(&record.id).await? {
            if current.is_expired(pass.now) {
                survivors.push(current.id);
            }
        }
    }
    if !survivors.is_empty() {
        return Err(LauncherError::Consistency(format!(
            "expired services not reclaimed: {}",
            survivors.join(", ")
        )));
    }

    info!(
        started = report.started,
        stopped = report.stopped,
        reclaimed = report.reclaimed,
        failed = report.failed.len(),
        "Sweep done"
    );
    Ok(report)
}

/// Deletes every user set that no installed service is bound to.
async fn purge_orphans(registry: &dyn Registry) -> Result<Vec<UserSet>, LauncherError> {
    let mut purged = Vec::new();
    for users in registry.users_list().await? {
        if registry.users_services(&users).await?.is_empty() {
            registry.delete_users(&users).await?;
            info!(%users, "Orphan users purged");
            purged.push(users);
        }
    }
    Ok(purged)
}
