//! TCP sync client for joining a CodeBank session.
//!
//! Provides:
//! - Connection handshake (credentials, then `SET_ID` or `ERROR`)
//! - A local mirror of the shared codelet set, rebuilt from server messages
//! - Send helpers for every client-to-server message kind
//! - Private evaluations relayed to monitoring peers
//!
//! The server is authoritative. Local state only changes in response to
//! server messages, with one exception: sending a PUSH or RELEASE gives up
//! the local editing slot immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use codebank_core::{CodeExecutor, Codelet, CodeletId, FoxDot, OrderId, UserId};

use crate::protocol::{
    read_frame, write_raw, Credentials, Message, MessageKind, ProtocolError, DEFAULT_MAX_FRAME,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`
    pub server_addr: String,
    /// Display name; together with our host it identifies us on reconnect
    pub name: String,
    /// Plain-text session password (hashed before sending)
    pub password: String,
    /// Interpreter this client runs
    pub interpreter_id: u32,
    /// Largest accepted frame payload in bytes
    pub max_frame_len: usize,
    /// Bound on connecting and on waiting for the server's first reply
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:57890".to_string(),
            name: "anonymous".to_string(),
            password: String::new(),
            interpreter_id: FoxDot::INTERPRETER_ID,
            max_frame_len: DEFAULT_MAX_FRAME,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {addr}: {source}")]
    Connect { addr: String, source: std::io::Error },
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("login refused: {0}")]
    AuthenticationFailed(String),
    #[error("server answered the login with {0:?}")]
    UnexpectedHandshake(MessageKind),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("interpreter call failed: {0}")]
    Interpreter(#[from] tokio::task::JoinError),
}

/// What changed locally after applying a server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Identified(UserId),
    SeedSet(u64),
    UserJoined { user: UserId, name: String },
    UserLeft(UserId),
    CodeletUpdated { codelet: CodeletId, author: UserId, order_id: OrderId, has_error: bool },
    CodeletReplayed { codelet: CodeletId, order_id: OrderId, hidden: bool },
    LockGranted { codelet: CodeletId, user: UserId },
    LockReleased { codelet: CodeletId, user: UserId },
    LockDenied { codelet: CodeletId, editor: UserId },
    Undone { codelet: CodeletId },
    Hidden { codelet: CodeletId },
    Typing { user: UserId, typing: bool },
    Chat { user: UserId, text: String },
    Cleared { user: UserId },
    MonitorStarted { observer: UserId },
    MonitorStopped { observer: UserId },
    MonitorEval { user: UserId, text: String },
    ServerError(String),
    Info(String),
    Shutdown,
    Disconnected,
}

/// Interpreter work carried by a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Evaluate a codelet's head text. A failure flags the codelet.
    Codelet { codelet: CodeletId, text: String },
    Seed(u64),
    Stop,
}

impl Execution {
    /// Blocks for as long as the interpreter takes.
    pub fn run(&self, executor: &dyn CodeExecutor) -> String {
        match self {
            Execution::Codelet { text, .. } => executor.execute(text),
            Execution::Seed(seed) => executor.execute(&executor.random_seed_setter(*seed)),
            Execution::Stop => executor.execute(&executor.stop_command()),
        }
    }
}

/// Local mirror of the shared session.
#[derive(Debug, Clone, Default)]
pub struct ClientSession {
    user_id: Option<UserId>,
    seed: Option<u64>,
    users: BTreeMap<UserId, String>,
    codelets: BTreeMap<CodeletId, Codelet>,
    editing: Option<CodeletId>,
    typing: BTreeSet<UserId>,
    monitored_by: BTreeSet<UserId>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn user_name(&self, user: UserId) -> Option<&str> {
        self.users.get(&user).map(String::as_str)
    }

    pub fn users(&self) -> &BTreeMap<UserId, String> {
        &self.users
    }

    pub fn codelet(&self, id: CodeletId) -> Option<&Codelet> {
        self.codelets.get(&id)
    }

    pub fn codelets(&self) -> impl Iterator<Item = &Codelet> {
        self.codelets.values()
    }

    pub fn codelet_count(&self) -> usize {
        self.codelets.len()
    }

    /// Codelet this client currently holds the lock on.
    pub fn editing(&self) -> Option<CodeletId> {
        self.editing
    }

    pub fn is_typing(&self, user: UserId) -> bool {
        self.typing.contains(&user)
    }

    /// `true` while at least one peer receives our private evaluations.
    pub fn is_monitored(&self) -> bool {
        !self.monitored_by.is_empty()
    }

    fn is_me(&self, user: UserId) -> bool {
        self.user_id == Some(user)
    }

    /// Give up the local editing slot without waiting for the server.
    pub fn leave_editing(&mut self) -> Option<CodeletId> {
        self.editing.take()
    }

    /// Apply one server message, running any code it carries in place.
    pub fn apply(&mut self, message: Message, executor: &dyn CodeExecutor) -> Vec<ClientEvent> {
        let (mut events, work) = self.stage(message);
        if let Some(work) = work {
            let output = work.run(executor);
            self.record_output(&work, &output, executor, &mut events);
        }
        events
    }

    /// Flag a codelet whose evaluation failed and mark its update event.
    pub fn record_output(
        &mut self,
        work: &Execution,
        output: &str,
        executor: &dyn CodeExecutor,
        events: &mut [ClientEvent],
    ) {
        let Execution::Codelet { codelet, .. } = work else {
            return;
        };
        if !executor.contains_error(output) {
            return;
        }
        if let Some(c) = self.codelets.get_mut(codelet) {
            c.flag_error();
        }
        for event in events.iter_mut() {
            if let ClientEvent::CodeletUpdated { codelet: id, has_error, .. } = event {
                if *id == *codelet {
                    *has_error = true;
                }
            }
        }
    }

    /// Apply one server message to the mirror without touching the
    /// interpreter. Update events report `has_error: false` until
    /// [`record_output`](Self::record_output) sees the evaluation.
    pub fn stage(&mut self, message: Message) -> (Vec<ClientEvent>, Option<Execution>) {
        let mut work = None;
        let events = match message {
            Message::SetId { user } => {
                self.user_id = Some(user);
                vec![ClientEvent::Identified(user)]
            }

            Message::Seed { seed } => {
                self.seed = Some(seed);
                work = Some(Execution::Seed(seed));
                vec![ClientEvent::SeedSet(seed)]
            }

            Message::Name { user, name } => {
                self.users.insert(user, name.clone());
                vec![ClientEvent::UserJoined { user, name }]
            }

            Message::Remove { user } => {
                self.users.remove(&user);
                self.typing.remove(&user);
                self.monitored_by.remove(&user);
                vec![ClientEvent::UserLeft(user)]
            }

            Message::Update { user, codelet, text, order_id } => {
                let entry = self
                    .codelets
                    .entry(codelet)
                    .and_modify(|c| {
                        c.update(user, &text);
                        c.unassign_editor();
                        c.set_order_id(order_id);
                    })
                    .or_insert_with(|| Codelet::new(codelet, user, text.as_str(), order_id));
                work = Some(Execution::Codelet { codelet, text: entry.text().to_string() });

                if self.editing == Some(codelet) {
                    self.editing = None;
                }
                vec![ClientEvent::CodeletUpdated { codelet, author: user, order_id, has_error: false }]
            }

            Message::History { codelet, history, order_id, hidden } => {
                let Some(rebuilt) = Codelet::from_history(codelet, history, order_id, hidden) else {
                    log::warn!("Ignoring empty history for codelet {codelet}");
                    return (Vec::new(), None);
                };
                work = Some(Execution::Codelet { codelet, text: rebuilt.text().to_string() });
                self.codelets.insert(codelet, rebuilt);
                vec![ClientEvent::CodeletReplayed { codelet, order_id, hidden }]
            }

            Message::Load { user, codelet } => {
                let Some(c) = self.codelets.get_mut(&codelet) else {
                    log::warn!("Lock granted on unknown codelet {codelet}");
                    return (Vec::new(), None);
                };
                c.assign_editor(user);
                if self.is_me(user) {
                    self.editing = Some(codelet);
                }
                vec![ClientEvent::LockGranted { codelet, user }]
            }

            Message::Release { user, codelet } => {
                if let Some(c) = self.codelets.get_mut(&codelet) {
                    c.unassign_editor();
                }
                if self.editing == Some(codelet) {
                    self.editing = None;
                }
                vec![ClientEvent::LockReleased { codelet, user }]
            }

            Message::Denied { user, codelet } => vec![ClientEvent::LockDenied { codelet, editor: user }],

            Message::Undo { codelet, .. } => match self.codelets.get_mut(&codelet) {
                Some(c) => {
                    c.rollback();
                    vec![ClientEvent::Undone { codelet }]
                }
                None => Vec::new(),
            },

            Message::Hide { codelet, .. } => match self.codelets.get_mut(&codelet) {
                Some(c) => {
                    c.hide();
                    vec![ClientEvent::Hidden { codelet }]
                }
                None => Vec::new(),
            },

            Message::Typing { user, typing } => {
                if typing {
                    self.typing.insert(user);
                } else {
                    self.typing.remove(&user);
                }
                vec![ClientEvent::Typing { user, typing }]
            }

            Message::Chat { user, text } => vec![ClientEvent::Chat { user, text }],

            Message::Clear { user } => {
                work = Some(Execution::Stop);
                vec![ClientEvent::Cleared { user }]
            }

            Message::MonitorStart { user, .. } => {
                self.monitored_by.insert(user);
                vec![ClientEvent::MonitorStarted { observer: user }]
            }

            Message::MonitorStop { user, .. } => {
                self.monitored_by.remove(&user);
                vec![ClientEvent::MonitorStopped { observer: user }]
            }

            Message::MonitorEval { user, text } => vec![ClientEvent::MonitorEval { user, text }],

            Message::Error { message, .. } => {
                log::error!("Server error: {message}");
                vec![ClientEvent::ServerError(message)]
            }

            Message::Info { text, .. } => vec![ClientEvent::Info(text)],

            Message::Shutdown => vec![ClientEvent::Shutdown],

            Message::Push { .. } | Message::Request { .. } => {
                log::warn!("Server sent client-only message {:?}", message.kind());
                Vec::new()
            }
        };
        (events, work)
    }
}

/// The sync client.
///
/// Owns one TCP connection. A reader task applies incoming messages to the
/// shared [`ClientSession`] and forwards the resulting events; a writer
/// task drains the outgoing channel.
pub struct SyncClient {
    config: ClientConfig,
    user_id: UserId,
    session: Arc<Mutex<ClientSession>>,
    executor: Arc<dyn CodeExecutor>,
    connected: Arc<AtomicBool>,
    outgoing_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Connect, authenticate, and start the background tasks.
    ///
    /// Fails with [`ClientError::AuthenticationFailed`] when the server's
    /// first reply is an ERROR.
    pub async fn connect(
        config: ClientConfig,
        executor: Arc<dyn CodeExecutor>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let limit = Duration::from_secs(config.connect_timeout_secs);
        let stream = tokio::time::timeout(limit, TcpStream::connect(&config.server_addr))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|source| ClientError::Connect { addr: config.server_addr.clone(), source })?;
        let (mut reader, mut writer) = stream.into_split();

        let creds = Credentials::new(config.name.as_str(), &config.password, config.interpreter_id);
        write_raw(&mut writer, &creds.encode_frame()?).await?;

        let first = tokio::time::timeout(limit, read_frame(&mut reader, config.max_frame_len))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let user_id = match first {
            Message::SetId { user } => user,
            Message::Error { message, .. } => return Err(ClientError::AuthenticationFailed(message)),
            other => return Err(ClientError::UnexpectedHandshake(other.kind())),
        };
        log::info!("Connected to {} as user {user_id}", config.server_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Mutex::new(ClientSession::new()));
        let (identified, _) = session.lock().await.stage(Message::SetId { user: user_id });
        for event in identified {
            let _ = event_tx.send(event);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::spawn(write_loop(writer, out_rx));

        let connected = Arc::new(AtomicBool::new(true));
        let reader_task = tokio::spawn(read_loop(
            reader,
            config.max_frame_len,
            session.clone(),
            executor.clone(),
            event_tx,
            connected.clone(),
        ));

        let client = Self {
            config,
            user_id,
            session,
            executor,
            connected,
            outgoing_tx: Some(out_tx),
            writer_task: Some(writer_task),
            reader_task: Some(reader_task),
        };
        Ok((client, event_rx))
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.outgoing_tx.is_some()
    }

    /// Read the local mirror.
    pub async fn with_session<R>(&self, f: impl FnOnce(&ClientSession) -> R) -> R {
        f(&*self.session.lock().await)
    }

    /// Encode and queue a message stamped with our id.
    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let bytes = message.with_source(self.user_id).encode_frame()?;
        tx.send(bytes).map_err(|_| ClientError::NotConnected)
    }

    /// Submit new text for `codelet` (`-1` creates one). Gives up the lock.
    pub async fn push(&self, codelet: CodeletId, text: &str) -> Result<(), ClientError> {
        self.session.lock().await.leave_editing();
        self.send(Message::Push { user: self.user_id, codelet, text: text.to_string() })
    }

    pub fn request(&self, codelet: CodeletId) -> Result<(), ClientError> {
        self.send(Message::Request { user: self.user_id, codelet })
    }

    pub async fn release(&self, codelet: CodeletId) -> Result<(), ClientError> {
        self.session.lock().await.leave_editing();
        self.send(Message::Release { user: self.user_id, codelet })
    }

    pub fn undo(&self, codelet: CodeletId) -> Result<(), ClientError> {
        self.send(Message::Undo { user: self.user_id, codelet })
    }

    pub fn hide(&self, codelet: CodeletId) -> Result<(), ClientError> {
        self.send(Message::Hide { user: self.user_id, codelet })
    }

    pub fn typing(&self, typing: bool) -> Result<(), ClientError> {
        self.send(Message::Typing { user: self.user_id, typing })
    }

    pub fn chat(&self, text: &str) -> Result<(), ClientError> {
        self.send(Message::Chat { user: self.user_id, text: text.to_string() })
    }

    pub fn clear(&self) -> Result<(), ClientError> {
        self.send(Message::Clear { user: self.user_id })
    }

    pub fn monitor_start(&self, target: UserId) -> Result<(), ClientError> {
        self.send(Message::MonitorStart { user: self.user_id, target })
    }

    pub fn monitor_stop(&self, target: UserId) -> Result<(), ClientError> {
        self.send(Message::MonitorStop { user: self.user_id, target })
    }

    /// Run code locally without sharing it. Monitoring peers get a copy.
    pub async fn evaluate_private(&self, code: &str) -> Result<String, ClientError> {
        let executor = self.executor.clone();
        let job = code.to_string();
        let output = tokio::task::spawn_blocking(move || executor.execute(&job)).await?;
        if self.session.lock().await.is_monitored() {
            self.send(Message::MonitorEval { user: self.user_id, text: code.to_string() })?;
        }
        Ok(output)
    }

    /// Flush pending messages and close the connection.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        if let Some(writer) = self.writer_task.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::Release);
        log::info!("Disconnected from {}", self.config.server_addr);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = outgoing.recv().await {
        if let Err(e) = write_raw(&mut writer, &bytes).await {
            log::error!("Send to server failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    max_len: usize,
    session: Arc<Mutex<ClientSession>>,
    executor: Arc<dyn CodeExecutor>,
    events: mpsc::UnboundedSender<ClientEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut reader, max_len).await {
            Ok(message) => {
                log::debug!("Received {:?}", message.kind());
                let (mut applied, work) = session.lock().await.stage(message);
                if let Some(work) = work {
                    let exec = executor.clone();
                    let job = work.clone();
                    match tokio::task::spawn_blocking(move || job.run(exec.as_ref())).await {
                        Ok(output) => {
                            let mut guard = session.lock().await;
                            guard.record_output(&work, &output, executor.as_ref(), &mut applied);
                        }
                        Err(e) => log::error!("Interpreter call failed: {e}"),
                    }
                }
                for event in applied {
                    let _ = events.send(event);
                }
            }
            Err(e) if e.is_framing_failure() => {
                log::info!("Connection to server closed");
                break;
            }
            Err(e) => {
                log::warn!("Dropping connection after bad message: {e}");
                break;
            }
        }
    }
    connected.store(false, Ordering::Release);
    let _ = events.send(ClientEvent::Disconnected);
}
