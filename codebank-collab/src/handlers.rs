//! Server-side dispatch: one transition per message kind.
//!
//! Handlers never touch sockets. They mutate [`SessionState`] and return
//! the messages to send, tagged with who should receive them. The consumer
//! task hands those to the client registry.

use codebank_core::{CodeExecutor, CodeletId, UserId};
use thiserror::Error;

use crate::protocol::{Message, MessageKind};
use crate::session::{LockOutcome, SessionState};

/// Recipients of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    User(UserId),
    AllExcept(UserId),
    Users(Vec<UserId>),
}

/// A message and its recipients.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: Target,
    pub message: Message,
}

impl Outbound {
    pub fn all(message: Message) -> Self {
        Self { target: Target::All, message }
    }

    pub fn to(user: UserId, message: Message) -> Self {
        Self { target: Target::User(user), message }
    }
}

/// Knobs that change what handlers emit.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Tell a requester their lock request lost instead of staying silent.
    pub notify_lock_denied: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("client sent server-only message kind {0:?}")]
    ProtocolViolation(MessageKind),
}

/// Apply a message received from `from`.
///
/// The message's source id is replaced by `from`: a client can only act
/// as itself.
pub fn dispatch(
    session: &mut SessionState,
    executor: &dyn CodeExecutor,
    options: DispatchOptions,
    from: UserId,
    message: Message,
) -> Result<Vec<Outbound>, DispatchError> {
    if message.source() != from {
        log::warn!(
            "User {from} sent {:?} claiming to be user {}",
            message.kind(),
            message.source()
        );
    }
    let message = message.with_source(from);
    log::debug!("Dispatching {:?} from user {from}", message.kind());

    let out = match message {
        Message::Push { codelet, text, .. } => handle_push(session, executor, from, codelet, &text),

        Message::Request { codelet, .. } => match session.request_lock(from, codelet) {
            LockOutcome::Granted => {
                log::info!("User {from} locked codelet {codelet}");
                vec![Outbound::all(Message::Load { user: from, codelet })]
            }
            LockOutcome::Held(holder) => {
                log::debug!("User {from} asked for codelet {codelet} held by {holder}");
                if options.notify_lock_denied {
                    vec![Outbound::to(from, Message::Denied { user: holder, codelet })]
                } else {
                    Vec::new()
                }
            }
            LockOutcome::UnknownCodelet => {
                log::warn!("User {from} requested unknown codelet {codelet}");
                Vec::new()
            }
        },

        Message::Release { codelet, .. } => {
            if session.release(codelet) {
                vec![Outbound::all(Message::Release { user: from, codelet })]
            } else {
                log::warn!("User {from} released unknown codelet {codelet}");
                Vec::new()
            }
        }

        Message::Undo { codelet, .. } => match session.undo(codelet) {
            Some(removed) => {
                if !removed {
                    log::debug!("Undo on codelet {codelet} ignored: single history entry");
                }
                vec![Outbound::all(Message::Undo { user: from, codelet })]
            }
            None => {
                log::warn!("User {from} tried to undo unknown codelet {codelet}");
                Vec::new()
            }
        },

        Message::Hide { codelet, .. } => {
            if session.hide(codelet) {
                vec![Outbound::all(Message::Hide { user: from, codelet })]
            } else {
                Vec::new()
            }
        }

        Message::Typing { typing, .. } => {
            session.set_typing(from, typing);
            vec![Outbound {
                target: Target::AllExcept(from),
                message: Message::Typing { user: from, typing },
            }]
        }

        Message::Chat { text, .. } => vec![Outbound::all(Message::Chat { user: from, text })],

        Message::Clear { .. } => {
            executor.execute(&executor.stop_command());
            vec![Outbound::all(Message::Clear { user: from })]
        }

        Message::MonitorStart { target, .. } => {
            if session.start_monitoring(from, target) {
                log::info!("User {from} is monitoring user {target}");
                vec![Outbound::to(target, Message::MonitorStart { user: from, target })]
            } else {
                Vec::new()
            }
        }

        Message::MonitorStop { target, .. } => {
            if session.stop_monitoring(from, target) {
                vec![Outbound::to(target, Message::MonitorStop { user: from, target })]
            } else {
                Vec::new()
            }
        }

        Message::MonitorEval { text, .. } => {
            let observers = session.monitors_of(from);
            if observers.is_empty() {
                Vec::new()
            } else {
                vec![Outbound {
                    target: Target::Users(observers),
                    message: Message::MonitorEval { user: from, text },
                }]
            }
        }

        other @ (Message::Shutdown
        | Message::Load { .. }
        | Message::Name { .. }
        | Message::SetId { .. }
        | Message::Update { .. }
        | Message::Error { .. }
        | Message::Info { .. }
        | Message::Remove { .. }
        | Message::History { .. }
        | Message::Seed { .. }
        | Message::Denied { .. }) => {
            return Err(DispatchError::ProtocolViolation(other.kind()));
        }
    };
    Ok(out)
}

fn handle_push(
    session: &mut SessionState,
    executor: &dyn CodeExecutor,
    from: UserId,
    codelet: CodeletId,
    text: &str,
) -> Vec<Outbound> {
    let outcome = session.push(from, codelet, text);
    let head = session
        .codelet(outcome.codelet)
        .map(|c| c.text().to_string())
        .unwrap_or_default();

    let output = executor.execute(&head);
    if executor.contains_error(&output) {
        log::info!("Codelet {} raised an error", outcome.codelet);
        session.flag_error(outcome.codelet);
    }

    if outcome.created {
        log::info!("User {from} created codelet {}", outcome.codelet);
    }

    vec![Outbound::all(Message::Update {
        user: from,
        codelet: outcome.codelet,
        text: head,
        order_id: outcome.order_id,
    })]
}

/// Bring a newly authenticated user into the session.
///
/// The joining user gets, in order: their id, the roster entry announcing
/// them (sent to everyone), the shared seed, the other users' names, and
/// a full history replay of every codelet.
pub fn join(session: &mut SessionState, user: UserId, name: &str, host: &str) -> Vec<Outbound> {
    session.add_user(user, name, host);

    let mut out = vec![
        Outbound::to(user, Message::SetId { user }),
        Outbound::all(Message::Name { user, name: name.to_string() }),
        Outbound::to(user, Message::Seed { seed: session.seed() }),
    ];

    out.extend(
        session
            .users()
            .filter(|u| u.id != user)
            .map(|u| Outbound::to(user, Message::Name { user: u.id, name: u.name.clone() })),
    );

    out.extend(
        session
            .history_messages()
            .into_iter()
            .map(|m| Outbound::to(user, m)),
    );
    out
}

/// Remove a user, releasing anything they held.
pub fn leave(session: &mut SessionState, user: UserId) -> Vec<Outbound> {
    let Some((_, released)) = session.remove_user(user) else {
        return Vec::new();
    };

    let mut out: Vec<Outbound> = released
        .into_iter()
        .map(|codelet| {
            log::info!("Releasing codelet {codelet} held by departed user {user}");
            Outbound::all(Message::Release { user, codelet })
        })
        .collect();
    out.push(Outbound::all(Message::Remove { user }));
    out
}

/// Announce shutdown and drop every user.
pub fn shutdown(session: &mut SessionState) -> Vec<Outbound> {
    for id in session.user_ids() {
        session.remove_user(id);
    }
    vec![Outbound::all(Message::Shutdown)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use codebank_core::{HistoryEntry, NullExecutor, NEW_CODELET};
    use std::sync::Mutex;

    /// Records executed code and reports errors for code containing "bad".
    #[derive(Default)]
    struct Recording {
        executed: Mutex<Vec<String>>,
    }

    impl CodeExecutor for Recording {
        fn execute(&self, code: &str) -> String {
            self.executed.lock().unwrap().push(code.to_string());
            if code.contains("bad") {
                "Traceback: boom".to_string()
            } else {
                String::new()
            }
        }
        fn contains_error(&self, output: &str) -> bool {
            output.starts_with("Traceback")
        }
        fn random_seed_setter(&self, seed: u64) -> String {
            format!("seed({seed})")
        }
        fn stop_command(&self) -> String {
            "stop()".to_string()
        }
    }

    fn session(users: UserId) -> SessionState {
        let mut s = SessionState::new(99);
        for id in 1..=users {
            let name = format!("u{id}");
            let resolved = s.resolve_identity(&name, "h").user_id();
            join(&mut s, resolved, &name, "h");
        }
        s
    }

    fn run(s: &mut SessionState, from: UserId, msg: Message) -> Vec<Outbound> {
        dispatch(s, &NullExecutor, DispatchOptions::default(), from, msg).unwrap()
    }

    #[test]
    fn test_scenario_create_update_undo() {
        let mut s = session(3);

        // A: first push creates codelet 1 with order 1.
        let out = run(&mut s, 1, Message::Push { user: 1, codelet: NEW_CODELET, text: "Clock.bpm=120".into() });
        assert_eq!(
            out,
            vec![Outbound::all(Message::Update {
                user: 1,
                codelet: 1,
                text: "Clock.bpm=120".into(),
                order_id: 1
            })]
        );

        // B: user 2 takes the lock, user 3 is silently ignored.
        let out = run(&mut s, 2, Message::Request { user: 2, codelet: 1 });
        assert_eq!(out, vec![Outbound::all(Message::Load { user: 2, codelet: 1 })]);
        let out = run(&mut s, 3, Message::Request { user: 3, codelet: 1 });
        assert!(out.is_empty());
        assert_eq!(s.codelet(1).unwrap().editor(), Some(2));

        // C: user 2 pushes, the lock is released and order advances.
        let out = run(&mut s, 2, Message::Push { user: 2, codelet: 1, text: "Clock.bpm=130".into() });
        assert_eq!(
            out,
            vec![Outbound::all(Message::Update {
                user: 2,
                codelet: 1,
                text: "Clock.bpm=130".into(),
                order_id: 2
            })]
        );
        assert_eq!(
            s.history(1).unwrap(),
            vec![HistoryEntry::new(1, "Clock.bpm=120"), HistoryEntry::new(2, "Clock.bpm=130")]
        );
        assert_eq!(s.codelet(1).unwrap().editor(), None);

        // D: undo twice; the second is a no-op but still broadcast.
        let out = run(&mut s, 2, Message::Undo { user: 2, codelet: 1 });
        assert_eq!(out, vec![Outbound::all(Message::Undo { user: 2, codelet: 1 })]);
        assert_eq!(s.history(1).unwrap(), vec![HistoryEntry::new(1, "Clock.bpm=120")]);
        let out = run(&mut s, 2, Message::Undo { user: 2, codelet: 1 });
        assert_eq!(out, vec![Outbound::all(Message::Undo { user: 2, codelet: 1 })]);
        assert_eq!(s.history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_release_on_free_codelet_still_broadcasts() {
        let mut s = session(1);
        run(&mut s, 1, Message::Push { user: 1, codelet: NEW_CODELET, text: "x".into() });
        let out = run(&mut s, 1, Message::Release { user: 1, codelet: 1 });
        assert_eq!(out, vec![Outbound::all(Message::Release { user: 1, codelet: 1 })]);
        assert_eq!(s.codelet(1).unwrap().editor(), None);
    }

    #[test]
    fn test_denied_notification_when_enabled() {
        let mut s = session(2);
        run(&mut s, 1, Message::Push { user: 1, codelet: NEW_CODELET, text: "x".into() });
        run(&mut s, 1, Message::Request { user: 1, codelet: 1 });
        let options = DispatchOptions { notify_lock_denied: true };
        let out = dispatch(&mut s, &NullExecutor, options, 2, Message::Request { user: 2, codelet: 1 }).unwrap();
        assert_eq!(out, vec![Outbound::to(2, Message::Denied { user: 1, codelet: 1 })]);
    }

    #[test]
    fn test_source_is_stamped_with_connection_id() {
        let mut s = session(2);
        let out = run(&mut s, 2, Message::Push { user: 1, codelet: NEW_CODELET, text: "x".into() });
        assert_eq!(out[0].message.source(), 2);
        assert_eq!(s.codelet(1).unwrap().author(), 2);
    }

    #[test]
    fn test_push_executes_and_flags_errors() {
        let mut s = session(1);
        let exec = Recording::default();
        let opts = DispatchOptions::default();
        dispatch(&mut s, &exec, opts, 1, Message::Push { user: 1, codelet: NEW_CODELET, text: "bad(".into() }).unwrap();
        assert!(s.codelet(1).unwrap().has_error());
        dispatch(&mut s, &exec, opts, 1, Message::Push { user: 1, codelet: 1, text: "good()".into() }).unwrap();
        assert!(!s.codelet(1).unwrap().has_error());
        assert_eq!(*exec.executed.lock().unwrap(), vec!["bad(".to_string(), "good()".to_string()]);
    }

    #[test]
    fn test_clear_runs_stop_command() {
        let mut s = session(1);
        let exec = Recording::default();
        let out = dispatch(&mut s, &exec, DispatchOptions::default(), 1, Message::Clear { user: 1 }).unwrap();
        assert_eq!(out, vec![Outbound::all(Message::Clear { user: 1 })]);
        assert_eq!(*exec.executed.lock().unwrap(), vec!["stop()".to_string()]);
    }

    #[test]
    fn test_hide_and_typing() {
        let mut s = session(2);
        run(&mut s, 1, Message::Push { user: 1, codelet: NEW_CODELET, text: "x".into() });
        let out = run(&mut s, 2, Message::Hide { user: 2, codelet: 1 });
        assert_eq!(out, vec![Outbound::all(Message::Hide { user: 2, codelet: 1 })]);
        assert!(s.codelet(1).unwrap().is_hidden());

        let out = run(&mut s, 2, Message::Typing { user: 2, typing: true });
        assert_eq!(out[0].target, Target::AllExcept(2));
        assert!(s.user(2).unwrap().is_typing);
    }

    #[test]
    fn test_monitor_eval_routes_to_observers() {
        let mut s = session(3);
        let out = run(&mut s, 1, Message::MonitorStart { user: 1, target: 2 });
        assert_eq!(out, vec![Outbound::to(2, Message::MonitorStart { user: 1, target: 2 })]);

        let out = run(&mut s, 2, Message::MonitorEval { user: 2, text: "p1 >> pads()".into() });
        assert_eq!(out[0].target, Target::Users(vec![1]));

        let out = run(&mut s, 3, Message::MonitorEval { user: 3, text: "nobody".into() });
        assert!(out.is_empty());

        let out = run(&mut s, 1, Message::MonitorStop { user: 1, target: 2 });
        assert_eq!(out, vec![Outbound::to(2, Message::MonitorStop { user: 1, target: 2 })]);
        assert!(!s.user(2).unwrap().is_monitored);
    }

    #[test]
    fn test_server_only_kinds_are_violations() {
        let mut s = session(1);
        let err = dispatch(&mut s, &NullExecutor, DispatchOptions::default(), 1, Message::SetId { user: 5 })
            .unwrap_err();
        assert_eq!(err, DispatchError::ProtocolViolation(MessageKind::SetId));
        assert!(dispatch(&mut s, &NullExecutor, DispatchOptions::default(), 1, Message::Shutdown).is_err());
    }

    #[test]
    fn test_join_sends_identity_seed_roster_and_history() {
        let mut s = session(3);
        run(&mut s, 1, Message::Push { user: 1, codelet: NEW_CODELET, text: "a".into() });
        run(&mut s, 2, Message::Push { user: 2, codelet: NEW_CODELET, text: "b".into() });

        let id = s.resolve_identity("u4", "h").user_id();
        assert_eq!(id, 4);
        let out = join(&mut s, id, "u4", "h");

        assert_eq!(out[0], Outbound::to(4, Message::SetId { user: 4 }));
        assert_eq!(out[1], Outbound::all(Message::Name { user: 4, name: "u4".into() }));
        assert_eq!(out[2], Outbound::to(4, Message::Seed { seed: 99 }));
        let names: Vec<UserId> = out[3..6]
            .iter()
            .map(|o| match &o.message {
                Message::Name { user, .. } => *user,
                other => panic!("expected Name, got {other:?}"),
            })
            .collect();
        assert_eq!(names, vec![1, 2, 3]);
        assert!(matches!(out[6].message, Message::History { codelet: 1, .. }));
        assert!(matches!(out[7].message, Message::History { codelet: 2, .. }));
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn test_leave_releases_and_removes() {
        let mut s = session(2);
        run(&mut s, 1, Message::Push { user: 1, codelet: NEW_CODELET, text: "a".into() });
        run(&mut s, 2, Message::Request { user: 2, codelet: 1 });
        let out = leave(&mut s, 2);
        assert_eq!(
            out,
            vec![
                Outbound::all(Message::Release { user: 2, codelet: 1 }),
                Outbound::all(Message::Remove { user: 2 }),
            ]
        );
        assert!(leave(&mut s, 2).is_empty());
    }

    #[test]
    fn test_shutdown_drops_users() {
        let mut s = session(2);
        let out = shutdown(&mut s);
        assert_eq!(out, vec![Outbound::all(Message::Shutdown)]);
        assert_eq!(s.users().count(), 0);
    }
}
