//! Codelet: a shared block of code with an append-only history.
//!
//! ```text
//! history: [(u1, "a"), (u2, "b"), (u1, "c")]
//!                                   ▲
//!                                   └── current text
//! editor:  None | Some(user)   ── cooperative edit lock
//! order:   last mutation's global sequence number
//! ```
//!
//! The history is never empty once constructed; `rollback` refuses to drop
//! the last remaining entry.

use serde::{Deserialize, Serialize};

use crate::{CodeletId, OrderId, UserId};

/// One revision of a codelet. Serialized as `[authorId, text]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry(pub UserId, pub String);

impl HistoryEntry {
    pub fn new(author: UserId, text: impl Into<String>) -> Self {
        Self(author, text.into())
    }

    pub fn author(&self) -> UserId {
        self.0
    }

    pub fn text(&self) -> &str {
        &self.1
    }
}

/// A uniquely identified, versioned piece of shared code.
#[derive(Debug, Clone, PartialEq)]
pub struct Codelet {
    id: CodeletId,
    history: Vec<HistoryEntry>,
    editor: Option<UserId>,
    order_id: OrderId,
    hidden: bool,
    highlighted: bool,
    has_error: bool,
}

impl Codelet {
    /// Create a codelet with a single history entry.
    pub fn new(id: CodeletId, author: UserId, text: impl Into<String>, order_id: OrderId) -> Self {
        Self {
            id,
            history: vec![HistoryEntry::new(author, text)],
            editor: None,
            order_id,
            hidden: false,
            highlighted: false,
            has_error: false,
        }
    }

    /// Rebuild a codelet from a replayed history.
    ///
    /// Returns `None` when `history` is empty, since an empty codelet has no
    /// current text.
    pub fn from_history(
        id: CodeletId,
        history: Vec<HistoryEntry>,
        order_id: OrderId,
        hidden: bool,
    ) -> Option<Self> {
        if history.is_empty() {
            return None;
        }
        Some(Self {
            id,
            history,
            editor: None,
            order_id,
            hidden,
            highlighted: false,
            has_error: false,
        })
    }

    pub fn id(&self) -> CodeletId {
        self.id
    }

    /// Current text: the head of the history.
    pub fn text(&self) -> &str {
        self.history.last().map(HistoryEntry::text).unwrap_or_default()
    }

    /// Author of the current text.
    pub fn author(&self) -> UserId {
        self.history.last().map_or(crate::SERVER_ID, HistoryEntry::author)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// Apply a new revision.
    ///
    /// Un-hides the codelet. Appends `(author, text)` and clears the error
    /// flag only when `text` differs from the head. Returns `true` when the
    /// codelet was mutated (text appended or un-hidden), in which case the
    /// caller should stamp a fresh order id.
    pub fn update(&mut self, author: UserId, text: &str) -> bool {
        let was_hidden = std::mem::replace(&mut self.hidden, false);
        if text == self.text() {
            return was_hidden;
        }
        self.history.push(HistoryEntry::new(author, text));
        self.has_error = false;
        true
    }

    /// Drop the newest revision. A single-entry codelet is left untouched.
    pub fn rollback(&mut self) -> bool {
        if self.history.len() > 1 {
            self.history.pop();
            true
        } else {
            false
        }
    }

    pub fn set_order_id(&mut self, order_id: OrderId) {
        self.order_id = order_id;
    }

    pub fn editor(&self) -> Option<UserId> {
        self.editor
    }

    pub fn is_being_edited(&self) -> bool {
        self.editor.is_some()
    }

    pub fn assign_editor(&mut self, user: UserId) {
        self.editor = Some(user);
    }

    pub fn unassign_editor(&mut self) -> Option<UserId> {
        self.editor.take()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn hide(&mut self) {
        self.hidden = true;
    }

    pub fn is_highlighted(&self) -> bool {
        self.highlighted
    }

    pub fn set_highlighted(&mut self, on: bool) {
        self.highlighted = on;
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn flag_error(&mut self) {
        self.has_error = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_codelet_has_one_entry() {
        let c = Codelet::new(1, 1, "Clock.bpm=120", 1);
        assert_eq!(c.text(), "Clock.bpm=120");
        assert_eq!(c.history().len(), 1);
        assert_eq!(c.author(), 1);
        assert!(!c.is_being_edited());
    }

    #[test]
    fn test_update_appends_only_on_change() {
        let mut c = Codelet::new(1, 1, "a", 1);
        assert!(!c.update(2, "a"));
        assert_eq!(c.history().len(), 1);

        assert!(c.update(2, "b"));
        assert_eq!(c.history().len(), 2);
        assert_eq!(c.text(), "b");
        assert_eq!(c.author(), 2);
    }

    #[test]
    fn test_update_same_text_unhides() {
        let mut c = Codelet::new(1, 1, "a", 1);
        c.hide();
        assert!(c.update(1, "a"));
        assert!(!c.is_hidden());
        assert_eq!(c.history().len(), 1);
    }

    #[test]
    fn test_update_clears_error() {
        let mut c = Codelet::new(1, 1, "bad(", 1);
        c.flag_error();
        c.update(1, "good()");
        assert!(!c.has_error());
    }

    #[test]
    fn test_rollback_guard() {
        let mut c = Codelet::new(1, 1, "a", 1);
        assert!(!c.rollback());
        assert_eq!(c.history().len(), 1);

        c.update(2, "b");
        assert!(c.rollback());
        assert_eq!(c.text(), "a");
        assert!(!c.rollback());
        assert_eq!(c.text(), "a");
    }

    #[test]
    fn test_from_history_rejects_empty() {
        assert!(Codelet::from_history(1, Vec::new(), 1, false).is_none());

        let history = vec![HistoryEntry::new(1, "a"), HistoryEntry::new(2, "b")];
        let c = Codelet::from_history(7, history, 4, true).unwrap();
        assert_eq!(c.id(), 7);
        assert_eq!(c.text(), "b");
        assert_eq!(c.order_id(), 4);
        assert!(c.is_hidden());
    }

    #[test]
    fn test_editor_lock() {
        let mut c = Codelet::new(1, 1, "a", 1);
        c.assign_editor(3);
        assert_eq!(c.editor(), Some(3));
        assert_eq!(c.unassign_editor(), Some(3));
        assert_eq!(c.unassign_editor(), None);
    }

    #[test]
    fn test_history_entry_wire_shape() {
        let entry = HistoryEntry::new(2, "x = 1");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"[2,"x = 1"]"#);
    }
}
