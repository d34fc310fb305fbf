//! Authoritative session state owned by the consumer task.
//!
//! ```text
//!              REQUEST (free)                 PUSH / RELEASE / owner left
//!   ┌──────┐ ─────────────────► ┌───────────┐ ───────────────────────────┐
//!   │ Free │                    │ Locked(u) │                            │
//!   └──────┘ ◄───────────────── └───────────┘ ◄──── REQUEST (dropped) ───┘
//! ```
//!
//! Nothing in here is shared. The server's consumer task owns the single
//! `SessionState` and every transition goes through it in queue order.

use std::collections::BTreeMap;

use codebank_core::{Codelet, CodeletId, HistoryEntry, OrderId, User, UserId, NEW_CODELET};

use crate::protocol::Message;

/// Outcome of matching a login against previously seen clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// A disconnected client with the same `(name, host)` is coming back.
    Existing(UserId),
    /// First time this `(name, host)` is seen, or the old one is still online.
    New(UserId),
}

impl Identity {
    pub fn user_id(self) -> UserId {
        match self {
            Self::Existing(id) | Self::New(id) => id,
        }
    }
}

/// Result of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Held by someone else (or already by the requester).
    Held(UserId),
    UnknownCodelet,
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub codelet: CodeletId,
    pub order_id: OrderId,
    pub created: bool,
    pub changed: bool,
}

#[derive(Debug, Clone)]
struct KnownClient {
    id: UserId,
    name: String,
    host: String,
}

/// Codelets, users, and the monotonic counters.
#[derive(Debug)]
pub struct SessionState {
    codelets: BTreeMap<CodeletId, Codelet>,
    users: BTreeMap<UserId, User>,
    known_clients: Vec<KnownClient>,
    next_client_id: UserId,
    next_codelet_id: CodeletId,
    next_order_id: OrderId,
    seed: u64,
}

impl SessionState {
    pub fn new(seed: u64) -> Self {
        Self {
            codelets: BTreeMap::new(),
            users: BTreeMap::new(),
            known_clients: Vec::new(),
            next_client_id: 0,
            next_codelet_id: 0,
            next_order_id: 0,
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn next_client_id(&mut self) -> UserId {
        self.next_client_id += 1;
        self.next_client_id
    }

    fn next_codelet_id(&mut self) -> CodeletId {
        self.next_codelet_id += 1;
        self.next_codelet_id
    }

    fn next_order_id(&mut self) -> OrderId {
        self.next_order_id += 1;
        self.next_order_id
    }

    /// The last order id handed out (0 before any push).
    pub fn current_order_id(&self) -> OrderId {
        self.next_order_id
    }

    // ─── Users ──────────────────────────────────────────────────────

    /// Match `(name, host)` against clients seen during this server's
    /// lifetime. Only a client that is currently disconnected can be
    /// resumed; otherwise a fresh id is minted and remembered.
    ///
    /// Hosts behind NAT or with changing addresses will not match.
    pub fn resolve_identity(&mut self, name: &str, host: &str) -> Identity {
        let resumable = self
            .known_clients
            .iter()
            .find(|k| k.name == name && k.host == host && !self.users.contains_key(&k.id))
            .map(|k| k.id);

        match resumable {
            Some(id) => Identity::Existing(id),
            None => {
                let id = self.next_client_id();
                self.known_clients.push(KnownClient {
                    id,
                    name: name.to_string(),
                    host: host.to_string(),
                });
                Identity::New(id)
            }
        }
    }

    pub fn add_user(&mut self, id: UserId, name: &str, host: &str) {
        self.users.insert(id, User::new(id, name, host));
    }

    /// Remove a user, releasing every codelet they hold and dropping them
    /// from all monitoring relationships. Returns the released codelets.
    pub fn remove_user(&mut self, id: UserId) -> Option<(User, Vec<CodeletId>)> {
        let user = self.users.remove(&id)?;

        let released: Vec<CodeletId> = self
            .codelets
            .values_mut()
            .filter(|c| c.editor() == Some(id))
            .map(|c| {
                c.unassign_editor();
                c.id()
            })
            .collect();

        for target in user.monitoring.iter().copied().collect::<Vec<_>>() {
            self.refresh_monitored(target);
        }
        for other in self.users.values_mut() {
            other.monitoring.remove(&id);
        }
        Some((user, released))
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.users.keys().copied().collect()
    }

    pub fn set_typing(&mut self, id: UserId, typing: bool) -> bool {
        match self.users.get_mut(&id) {
            Some(user) => {
                user.is_typing = typing;
                true
            }
            None => false,
        }
    }

    // ─── Monitoring ─────────────────────────────────────────────────

    /// `observer` starts receiving `target`'s private evaluations.
    pub fn start_monitoring(&mut self, observer: UserId, target: UserId) -> bool {
        if observer == target || !self.users.contains_key(&target) {
            return false;
        }
        let Some(user) = self.users.get_mut(&observer) else {
            return false;
        };
        user.monitoring.insert(target);
        self.refresh_monitored(target);
        true
    }

    pub fn stop_monitoring(&mut self, observer: UserId, target: UserId) -> bool {
        let removed = self
            .users
            .get_mut(&observer)
            .is_some_and(|u| u.monitoring.remove(&target));
        if removed {
            self.refresh_monitored(target);
        }
        removed
    }

    /// Users currently monitoring `target`.
    pub fn monitors_of(&self, target: UserId) -> Vec<UserId> {
        self.users
            .values()
            .filter(|u| u.is_monitoring(target))
            .map(|u| u.id)
            .collect()
    }

    fn refresh_monitored(&mut self, target: UserId) {
        let watched = self.users.values().any(|u| u.is_monitoring(target));
        if let Some(user) = self.users.get_mut(&target) {
            user.is_monitored = watched;
        }
    }

    // ─── Codelets ───────────────────────────────────────────────────

    pub fn codelet(&self, id: CodeletId) -> Option<&Codelet> {
        self.codelets.get(&id)
    }

    pub fn codelet_count(&self) -> usize {
        self.codelets.len()
    }

    /// Codelets by ascending order id: the order a replay should follow.
    pub fn codelets_by_order(&self) -> Vec<&Codelet> {
        let mut all: Vec<&Codelet> = self.codelets.values().collect();
        all.sort_by_key(|c| (c.order_id(), c.id()));
        all
    }

    /// One HISTORY message per codelet, in replay order.
    pub fn history_messages(&self) -> Vec<Message> {
        self.codelets_by_order()
            .into_iter()
            .map(|c| Message::History {
                codelet: c.id(),
                history: c.history().to_vec(),
                order_id: c.order_id(),
                hidden: c.is_hidden(),
            })
            .collect()
    }

    /// Create or update a codelet and release its lock.
    ///
    /// An unknown id (including `-1`) creates a new codelet. A fresh order
    /// id is assigned whenever the codelet actually changed.
    pub fn push(&mut self, author: UserId, id: CodeletId, text: &str) -> PushOutcome {
        let existing = self.codelets.get_mut(&id).map(|c| {
            c.unassign_editor();
            c.update(author, text)
        });

        if let Some(changed) = existing {
            if changed {
                let order = self.next_order_id();
                if let Some(c) = self.codelets.get_mut(&id) {
                    c.set_order_id(order);
                }
            }
            let order_id = self.codelets.get(&id).map_or(0, Codelet::order_id);
            return PushOutcome { codelet: id, order_id, created: false, changed };
        }

        if id != NEW_CODELET {
            log::debug!("Push for unknown codelet {id} from user {author}; creating a new one");
        }
        let new_id = self.next_codelet_id();
        let order_id = self.next_order_id();
        self.codelets.insert(new_id, Codelet::new(new_id, author, text, order_id));
        PushOutcome { codelet: new_id, order_id, created: true, changed: true }
    }

    pub fn request_lock(&mut self, user: UserId, id: CodeletId) -> LockOutcome {
        match self.codelets.get_mut(&id) {
            None => LockOutcome::UnknownCodelet,
            Some(c) => match c.editor() {
                Some(holder) => LockOutcome::Held(holder),
                None => {
                    c.assign_editor(user);
                    LockOutcome::Granted
                }
            },
        }
    }

    /// Free the lock. Returns `false` only for an unknown codelet.
    pub fn release(&mut self, id: CodeletId) -> bool {
        match self.codelets.get_mut(&id) {
            Some(c) => {
                c.unassign_editor();
                true
            }
            None => false,
        }
    }

    /// Roll back one revision. `None` for an unknown codelet, otherwise
    /// whether anything was removed.
    pub fn undo(&mut self, id: CodeletId) -> Option<bool> {
        self.codelets.get_mut(&id).map(Codelet::rollback)
    }

    pub fn hide(&mut self, id: CodeletId) -> bool {
        match self.codelets.get_mut(&id) {
            Some(c) => {
                c.hide();
                true
            }
            None => false,
        }
    }

    pub fn flag_error(&mut self, id: CodeletId) {
        if let Some(c) = self.codelets.get_mut(&id) {
            c.flag_error();
        }
    }

    /// Snapshot of a codelet's history (used by tests and diagnostics).
    pub fn history(&self, id: CodeletId) -> Option<Vec<HistoryEntry>> {
        self.codelets.get(&id).map(|c| c.history().to_vec())
    }
}
