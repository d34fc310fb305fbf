//! Connected participants.

use std::collections::BTreeSet;

use crate::UserId;

/// A participant in the session.
///
/// `monitoring` lists the peers whose private evaluations this user
/// receives; `is_monitored` is set while at least one peer monitors us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub host: String,
    pub is_typing: bool,
    pub monitoring: BTreeSet<UserId>,
    pub is_monitored: bool,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            is_typing: false,
            monitoring: BTreeSet::new(),
            is_monitored: false,
        }
    }

    pub fn is_monitoring(&self, peer: UserId) -> bool {
        self.monitoring.contains(&peer)
    }
}
