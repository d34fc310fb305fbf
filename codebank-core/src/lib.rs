//! # codebank-core — shared data model for CodeBank sessions
//!
//! Codelets are named, versioned blocks of executable code that several
//! people edit together. This crate holds the types both ends of a session
//! agree on, plus the contract for the interpreter that runs the code.
//!
//! ## Modules
//!
//! - [`codelet`] — `Codelet` with its append-only history and edit lock
//! - [`user`] — connected participants and monitoring relationships
//! - [`executor`] — `CodeExecutor` collaborator contract and stock executors

pub mod codelet;
pub mod executor;
pub mod user;

pub use codelet::{Codelet, HistoryEntry};
pub use executor::{CodeExecutor, FoxDot, Language, NullExecutor, PipeExecutor};
pub use user::User;

/// Server-assigned participant identifier. `-1` is reserved for the server.
pub type UserId = i64;

/// Server-assigned codelet identifier. `-1` in a PUSH asks for a new codelet.
pub type CodeletId = i64;

/// Global mutation sequence number.
pub type OrderId = u64;

/// Source id carried by messages that originate on the server itself.
pub const SERVER_ID: UserId = -1;

/// Placeholder codelet id meaning "not a codelet yet".
pub const NEW_CODELET: CodeletId = -1;
