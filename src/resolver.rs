//! Version and ownership resolution for install requests.
//!
//! Pure decision logic: the caller reads the current record and its owner from
//! the registry (after any earlier operation on the same id has completed) and
//! gets back what the install has to do.

use crate::error::LauncherError;
use crate::model::{ServiceInfo, ServiceRecord, UserSet};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No record exists for the id.
    Install,
    /// A strictly older version is installed and must be replaced in place.
    Upgrade {
        current: ServiceRecord,
        /// New owner when the upgrade happens under a different user set.
        rebind: Option<UserSet>,
    },
}

/// Decides how an install request for `info` proceeds.
///
/// Installing a version lower than or equal to the installed one is a
/// [`LauncherError::VersionConflict`] and leaves the record untouched.
pub fn resolve(
    existing: Option<&ServiceRecord>,
    owner: Option<&UserSet>,
    info: &ServiceInfo,
    active: &UserSet,
) -> Result<Resolution, LauncherError> {
    let Some(current) = existing else {
        return Ok(Resolution::Install);
    };

    if current.version >= info.version {
        return Err(LauncherError::VersionConflict {
            id: info.id.clone(),
            installed: current.version,
            requested: info.version,
        });
    }

    let rebind = (owner != Some(active)).then(|| active.clone());
    Ok(Resolution::Upgrade {
        current: current.clone(),
        rebind,
    })
}
