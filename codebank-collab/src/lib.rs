//! # codebank-collab — shared-session engine for CodeBank
//!
//! Several users edit and run a common set of codelets. One server holds the
//! authoritative state; every client mirrors it from the messages it is sent.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      TCP, length-       ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─── prefixed JSON ───► │ SyncServer                   │
//! │ (per user)  │                         │  reader task per connection  │
//! └──────┬──────┘                         │          │                   │
//!        │                                │          ▼                   │
//!        ▼                                │  ProcessingQueue (FIFO)      │
//! ┌─────────────┐                         │          │                   │
//! │ClientSession│                         │          ▼                   │
//! │ (mirror)    │                         │  consumer: SessionState      │
//! └─────────────┘                         │          │ handlers          │
//!                                         │          ▼                   │
//!                                         │  ClientRegistry (fan-out)    │
//!                                         └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Framing, message kinds and credentials
//! - [`session`] — Server-side codelets, users, locks and counters
//! - [`handlers`] — Message dispatch and join/leave/shutdown sequences
//! - [`queue`] — Many-producer, single-consumer processing queue
//! - [`broadcast`] — Per-client outbound channels and routing
//! - [`server`] — TCP sync server
//! - [`client`] — TCP sync client with a local state mirror

pub mod protocol;
pub mod session;
pub mod handlers;
pub mod queue;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{hash_password, Credentials, Message, MessageKind, ProtocolError};
pub use session::{Identity, LockOutcome, PushOutcome, SessionState};
pub use handlers::{dispatch, DispatchError, DispatchOptions, Outbound, Target};
pub use queue::{processing_queue, Event, QueueReceiver, QueueSender};
pub use broadcast::{BroadcastStats, ClientHandle, ClientRegistry};
pub use server::{AuthError, ServerConfig, ServerError, ServerHandle, ServerStats, SyncServer};
pub use client::{ClientConfig, ClientError, ClientEvent, ClientSession, Execution, SyncClient};
