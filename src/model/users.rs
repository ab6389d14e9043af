use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of device users, used as the owner key of installed services.
///
/// Users are kept sorted and deduplicated so two sets with the same members
/// compare (and persist) equal regardless of the order the identity source
/// reported them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct UserSet(Vec<String>);

impl UserSet {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut users: Vec<String> = users.into_iter().map(Into::into).collect();
        users.sort();
        users.dedup();
        Self(users)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for UserSet {
    fn from(users: Vec<String>) -> Self {
        Self::new(users)
    }
}

impl From<UserSet> for Vec<String> {
    fn from(users: UserSet) -> Self {
        users.0
    }
}

impl fmt::Display for UserSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// The process-wide active user set.
///
/// Written by the user-change notifier, read by every install and sweep.
#[derive(Debug, Default)]
pub struct ActiveUsers(Mutex<UserSet>);

impl ActiveUsers {
    pub fn new(users: UserSet) -> Self {
        Self(Mutex::new(users))
    }

    pub fn get(&self) -> UserSet {
        self.0.lock().clone()
    }

    /// Replaces the active set, returning the previous one.
    pub fn replace(&self, users: UserSet) -> UserSet {
        std::mem::replace(&mut *self.0.lock(), users)
    }
}
