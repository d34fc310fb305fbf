//! TCP sync server with a single serialization point.
//!
//! Architecture:
//! ```text
//!            accept loop
//!                │ spawn per connection
//!                ▼
//! Client A ── reader A ──┐                         ┌──► writer A ──► Client A
//! Client B ── reader B ──┼──► ProcessingQueue ──►  consumer ──► writer B ──► Client B
//! Client C ── reader C ──┘        (FIFO)      (SessionState) └──► writer C ──► Client C
//! ```
//!
//! The consumer runs on a blocking thread since interpreter calls block;
//! connection I/O stays on the async runtime.
//!
//! Connection lifecycle: `Connecting → Authenticating → Active → Disconnected`.
//! The handshake runs on the connection's own task and may write an ERROR
//! frame directly. After hand-off only the writer task touches the socket.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use codebank_core::{CodeExecutor, FoxDot, NullExecutor, UserId, SERVER_ID};

use crate::broadcast::{AtomicBroadcastStats, ClientHandle, ClientRegistry, Frame};
use crate::handlers::{self, DispatchOptions};
use crate::protocol::{
    hash_password, read_credentials, read_frame, write_frame, write_raw, Credentials, Message,
    DEFAULT_MAX_FRAME,
};
use crate::queue::{processing_queue, Event, QueueReceiver, QueueSender};
use crate::session::{Identity, SessionState};

/// Largest seed chosen when none is configured.
pub const MAX_RANDOM_SEED: u64 = 2048;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// SHA-256 hex of the session password (empty password by default)
    pub password_hash: String,
    /// Interpreter clients must be running
    pub interpreter_id: u32,
    /// Shared RNG seed; random in `0..=2048` when unset
    pub seed: Option<u64>,
    /// Largest accepted frame payload in bytes
    pub max_frame_len: usize,
    /// Time a new connection has to send its credentials
    pub auth_timeout_secs: u64,
    /// Send DENIED to a requester whose lock request lost
    pub notify_lock_denied: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:57890".to_string(),
            password_hash: hash_password(""),
            interpreter_id: FoxDot::INTERPRETER_ID,
            seed: None,
            max_frame_len: DEFAULT_MAX_FRAME,
            auth_timeout_secs: 10,
            notify_lock_denied: false,
        }
    }
}

impl ServerConfig {
    /// Set the session password from plain text.
    pub fn with_password(mut self, password: &str) -> Self {
        self.password_hash = hash_password(password);
        self
    }

    fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions { notify_lock_denied: self.notify_lock_denied }
    }

    /// Check credentials. Only hash equality and interpreter match count.
    pub fn authenticate(&self, creds: &Credentials) -> Result<(), AuthError> {
        if creds.password_hash != self.password_hash {
            return Err(AuthError::BadPassword);
        }
        if creds.interpreter_id != self.interpreter_id {
            return Err(AuthError::IncompatibleInterpreter {
                expected: self.interpreter_id,
                got: creds.interpreter_id,
            });
        }
        Ok(())
    }
}

/// Why a login was refused. The `Display` text is sent to the client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Failed login.")]
    BadPassword,
    #[error("Incompatible interpreter: server runs {expected}, client runs {got}.")]
    IncompatibleInterpreter { expected: u32, got: u32 },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_logins: u64,
    pub messages_processed: u64,
    pub protocol_violations: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    failed_logins: AtomicU64,
    messages_processed: AtomicU64,
    protocol_violations: AtomicU64,
}

impl AtomicServerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    executor: Arc<dyn CodeExecutor>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig, executor: Arc<dyn CodeExecutor>) -> Self {
        Self { config, executor }
    }

    /// Default configuration with an executor that runs nothing.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(NullExecutor))
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind, spawn the accept loop and the consumer, and return a handle.
    ///
    /// The consumer sets the interpreter seed before taking any event.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let seed = self
            .config
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..=MAX_RANDOM_SEED));

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind { addr: self.config.bind_addr.clone(), source })?;
        let local_addr = listener.local_addr()?;
        log::info!("Sync server listening on {local_addr} (seed {seed})");

        let (queue_tx, queue_rx) = processing_queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let stats = Arc::new(AtomicServerStats::default());
        let registry = ClientRegistry::new();
        let broadcast_stats = registry.stats_handle();
        let config = Arc::new(self.config);

        let consumer = Consumer {
            session: SessionState::new(seed),
            registry,
            executor: self.executor,
            options: config.dispatch_options(),
            stats: stats.clone(),
        };
        let consumer_task = tokio::task::spawn_blocking(move || consumer.run(queue_rx));

        let ctx = ConnectionContext {
            config,
            queue: queue_tx.clone(),
            shutdown: shutdown_rx,
            stats: stats.clone(),
        };
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_tx.clone()));

        Ok(ServerHandle {
            local_addr,
            seed,
            queue: queue_tx,
            shutdown_tx,
            stats,
            broadcast_stats,
            accept_task,
            consumer_task,
        })
    }

    /// Serve until Ctrl-C, then shut down cleanly.
    pub async fn run(self) -> Result<(), ServerError> {
        let handle = self.start().await?;
        tokio::signal::ctrl_c().await?;
        log::info!("Interrupt received, shutting down");
        handle.shutdown().await;
        Ok(())
    }
}

/// Control surface of a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    seed: u64,
    queue: QueueSender,
    shutdown_tx: Arc<watch::Sender<bool>>,
    stats: Arc<AtomicServerStats>,
    broadcast_stats: Arc<AtomicBroadcastStats>,
    accept_task: JoinHandle<()>,
    consumer_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stats(&self) -> ServerStats {
        let b = self.broadcast_stats.snapshot();
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            failed_logins: self.stats.failed_logins.load(Ordering::Relaxed),
            messages_processed: self.stats.messages_processed.load(Ordering::Relaxed),
            protocol_violations: self.stats.protocol_violations.load(Ordering::Relaxed),
            messages_sent: b.messages_sent,
            messages_dropped: b.messages_dropped,
        }
    }

    /// Broadcast SHUTDOWN, drop every user, then stop accepting and close
    /// sockets.
    ///
    /// Connection tasks are signalled only after the consumer has sent
    /// SHUTDOWN, so no reader can queue a disconnect ahead of it.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.queue.push(Event::Shutdown { done: done_tx }) {
            let _ = done_rx.await;
        }
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.accept_task.await {
            log::error!("Accept loop ended abnormally: {e}");
        }
        if let Err(e) = self.consumer_task.await {
            log::error!("Consumer ended abnormally: {e}");
        }
        log::info!("Sync server on {} stopped", self.local_addr);
    }
}

/// Per-connection shared pieces.
#[derive(Clone)]
struct ConnectionContext {
    config: Arc<ServerConfig>,
    queue: QueueSender,
    shutdown: watch::Receiver<bool>,
    stats: Arc<AtomicServerStats>,
}

async fn accept_loop(listener: TcpListener, ctx: ConnectionContext, _keep: Arc<watch::Sender<bool>>) {
    let mut shutdown = ctx.shutdown.clone();
    let mut next_conn_id: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    next_conn_id += 1;
                    let conn_id = next_conn_id;
                    log::debug!("New TCP connection from {addr} (conn {conn_id})");
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, conn_id, ctx).await {
                            log::debug!("Connection {conn_id} from {addr} ended: {e}");
                        }
                    });
                }
                Err(e) => log::error!("Accept failed: {e}"),
            }
        }
    }
    log::info!("No longer accepting connections");
}

/// Drive one connection from handshake to disconnect.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    mut ctx: ConnectionContext,
) -> Result<(), crate::protocol::ProtocolError> {
    AtomicServerStats::bump(&ctx.stats.total_connections);
    let (mut reader, mut writer) = stream.into_split();
    let max_len = ctx.config.max_frame_len;

    // Authenticating
    let creds = match tokio::time::timeout(
        ctx.config.auth_timeout(),
        read_credentials(&mut reader, max_len),
    )
    .await
    {
        Err(_) => {
            log::warn!("Client at {addr} sent no credentials in time");
            return Err(crate::protocol::ProtocolError::Timeout);
        }
        Ok(Err(e)) => {
            log::info!("Client disconnected from {addr} before logging in");
            return Err(e);
        }
        Ok(Ok(creds)) => creds,
    };

    if let Err(reason) = ctx.config.authenticate(&creds) {
        AtomicServerStats::bump(&ctx.stats.failed_logins);
        log::warn!("Failed login attempt from {addr} as {:?}: {reason}", creds.name);
        let refusal = Message::Error { user: SERVER_ID, message: reason.to_string() };
        write_frame(&mut writer, &refusal).await?;
        let _ = writer.shutdown().await;
        return Ok(());
    }

    // Hand-off to the consumer
    let (handle, outbound_rx) = ClientHandle::new(conn_id, addr);
    let (reply_tx, reply_rx) = oneshot::channel();
    let joined = ctx.queue.push(Event::Join {
        name: creds.name.clone(),
        addr,
        handle,
        reply: reply_tx,
    });
    if !joined {
        return Ok(());
    }
    let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx, addr));
    let Ok(user) = reply_rx.await else {
        writer_task.abort();
        return Ok(());
    };

    AtomicServerStats::bump(&ctx.stats.active_connections);
    log::info!("New connection from {addr}: {} is user {user}", creds.name);

    // Active
    let mut writer_done = false;
    loop {
        tokio::select! {
            _ = ctx.shutdown.changed() => break,
            _ = &mut writer_task => {
                writer_done = true;
                break;
            }
            frame = read_frame(&mut reader, max_len) => match frame {
                Ok(message) => {
                    if !ctx.queue.push(Event::Message { user, conn_id, message }) {
                        break;
                    }
                }
                Err(e) if e.is_framing_failure() => {
                    log::info!("Client disconnected from {addr} (user {user})");
                    break;
                }
                Err(e) => {
                    AtomicServerStats::bump(&ctx.stats.protocol_violations);
                    log::warn!("Dropping user {user} at {addr}: {e}");
                    break;
                }
            }
        }
    }

    ctx.queue.push(Event::Disconnect { user, conn_id });
    ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    if !writer_done {
        let _ = writer_task.await;
    }
    Ok(())
}

/// Only code that writes to a socket after the handshake.
async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Frame>, addr: SocketAddr) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_raw(&mut writer, &frame).await {
            log::debug!("Write to {addr} failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Owns the session. Every state transition happens here.
struct Consumer {
    session: SessionState,
    registry: ClientRegistry,
    executor: Arc<dyn CodeExecutor>,
    options: DispatchOptions,
    stats: Arc<AtomicServerStats>,
}

impl Consumer {
    fn run(mut self, mut queue: QueueReceiver) {
        let seed = self.session.seed();
        self.executor.execute(&self.executor.random_seed_setter(seed));

        loop {
            let batch = queue.recv_batch();
            if batch.is_empty() {
                break;
            }
            for event in batch {
                if self.apply(event).is_break() {
                    return;
                }
            }
        }
        log::debug!("Processing queue closed");
    }

    fn route_all(&self, outbound: Vec<handlers::Outbound>) {
        for out in &outbound {
            self.registry.route(out);
        }
    }

    fn drop_user(&mut self, user: UserId, conn_id: u64) {
        if self.registry.remove(user, conn_id).is_none() {
            log::debug!("Ignoring stale disconnect for user {user} (conn {conn_id})");
            return;
        }
        let out = handlers::leave(&mut self.session, user);
        self.route_all(out);
        log::info!("User {user} left the session");
    }

    fn apply(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Join { name, addr, handle, reply } => {
                let host = addr.ip().to_string();
                let identity = self.session.resolve_identity(&name, &host);
                let user = identity.user_id();
                match identity {
                    Identity::Existing(_) => log::info!("{name}@{host} reconnected as user {user}"),
                    Identity::New(_) => log::info!("{name}@{host} joined as user {user}"),
                }

                let conn_id = handle.conn_id;
                self.registry.insert(user, handle);
                let out = handlers::join(&mut self.session, user, &name, &host);
                self.route_all(out);

                if reply.send(user).is_err() {
                    self.drop_user(user, conn_id);
                }
            }

            Event::Message { user, conn_id, message } => {
                if self.registry.conn_id(user) != Some(conn_id) {
                    log::debug!("Dropping {:?} from closed connection {conn_id}", message.kind());
                    return ControlFlow::Continue(());
                }
                AtomicServerStats::bump(&self.stats.messages_processed);

                match handlers::dispatch(&mut self.session, self.executor.as_ref(), self.options, user, message) {
                    Ok(out) => self.route_all(out),
                    Err(e) => {
                        AtomicServerStats::bump(&self.stats.protocol_violations);
                        log::warn!("Closing connection of user {user}: {e}");
                        let notice = Message::Error { user: SERVER_ID, message: e.to_string() };
                        if let Err(e) = self.registry.send_to(user, &notice) {
                            log::error!("Failed to encode error notice: {e}");
                        }
                        self.drop_user(user, conn_id);
                    }
                }
            }

            Event::Disconnect { user, conn_id } => self.drop_user(user, conn_id),

            Event::Shutdown { done } => {
                let out = handlers::shutdown(&mut self.session);
                self.route_all(out);
                self.registry.clear();
                let _ = done.send(());
                log::info!("Session closed");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}
