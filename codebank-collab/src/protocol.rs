//! Length-prefixed JSON protocol for codelet synchronization.
//!
//! Wire format:
//! ```text
//! ┌──────────────┬─────────────────────────────────────────┐
//! │ length       │ payload (compact JSON array)            │
//! │ 4 ASCII digs │ [kind, sourceUserId, ...fields]         │
//! └──────────────┴─────────────────────────────────────────┘
//!
//! Payloads above 9999 bytes:
//! ┌──────┬──────────────┬──────────────────┐
//! │ 0000 │ 8 ASCII digs │ payload          │
//! └──────┴──────────────┴──────────────────┘
//! ```
//!
//! A short read, a reset, a garbled header or a zero length all mean the
//! peer is gone. Callers clean up instead of surfacing an error.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use codebank_core::{CodeletId, HistoryEntry, OrderId, UserId, SERVER_ID};

/// Width of the classic decimal length header.
pub const HEADER_LEN: usize = 4;
/// Header announcing an extended length field.
pub const EXTENDED_MARKER: &[u8; HEADER_LEN] = b"0000";
/// Width of the extended decimal length field.
pub const EXTENDED_LEN: usize = 8;
/// Largest payload the classic header can describe.
pub const MAX_CLASSIC_PAYLOAD: usize = 9_999;
/// Largest payload the extended header can describe.
pub const MAX_EXTENDED_PAYLOAD: usize = 99_999_999;
/// Default cap applied by readers.
pub const DEFAULT_MAX_FRAME: usize = 4 * 1024 * 1024;

/// Message kinds and their numeric wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Shutdown = 0,
    Push = 1,
    Load = 3,
    Undo = 5,
    Name = 6,
    Request = 7,
    SetId = 8,
    Release = 9,
    Update = 10,
    Error = 11,
    Info = 12,
    Remove = 13,
    History = 14,
    Hide = 15,
    Seed = 16,
    Typing = 17,
    Chat = 18,
    Clear = 19,
    MonitorStart = 20,
    MonitorStop = 21,
    MonitorEval = 22,
    Denied = 23,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Result<Self, ProtocolError> {
        let kind = match code {
            0 => Self::Shutdown,
            1 => Self::Push,
            3 => Self::Load,
            5 => Self::Undo,
            6 => Self::Name,
            7 => Self::Request,
            8 => Self::SetId,
            9 => Self::Release,
            10 => Self::Update,
            11 => Self::Error,
            12 => Self::Info,
            13 => Self::Remove,
            14 => Self::History,
            15 => Self::Hide,
            16 => Self::Seed,
            17 => Self::Typing,
            18 => Self::Chat,
            19 => Self::Clear,
            20 => Self::MonitorStart,
            21 => Self::MonitorStop,
            22 => Self::MonitorEval,
            23 => Self::Denied,
            other => return Err(ProtocolError::UnknownKind(other)),
        };
        Ok(kind)
    }
}

/// Every message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server is terminating.
    Shutdown,
    /// Create (`codelet == -1`) or update a codelet.
    Push { user: UserId, codelet: CodeletId, text: String },
    /// Edit lock granted to `user`.
    Load { user: UserId, codelet: CodeletId },
    /// Drop the newest history entry.
    Undo { user: UserId, codelet: CodeletId },
    /// Roster entry.
    Name { user: UserId, name: String },
    /// Ask for the edit lock.
    Request { user: UserId, codelet: CodeletId },
    /// Identity assigned after authentication.
    SetId { user: UserId },
    /// Edit lock relinquished without a content change.
    Release { user: UserId, codelet: CodeletId },
    /// Authoritative new codelet state.
    Update { user: UserId, codelet: CodeletId, text: String, order_id: OrderId },
    /// Fatal condition; the receiver should disconnect.
    Error { user: UserId, message: String },
    /// Console text from the server.
    Info { user: UserId, text: String },
    /// User left the session.
    Remove { user: UserId },
    /// Full replay of one codelet for a (re)joining client.
    History { codelet: CodeletId, history: Vec<HistoryEntry>, order_id: OrderId, hidden: bool },
    /// Mark a codelet hidden.
    Hide { user: UserId, codelet: CodeletId },
    /// Shared RNG seed.
    Seed { seed: u64 },
    /// Typing indicator.
    Typing { user: UserId, typing: bool },
    /// Chat relay.
    Chat { user: UserId, text: String },
    /// Stop / clear the execution clock.
    Clear { user: UserId },
    /// `user` starts mirroring `target`'s private evaluations.
    MonitorStart { user: UserId, target: UserId },
    /// `user` stops mirroring `target`.
    MonitorStop { user: UserId, target: UserId },
    /// A private evaluation made by `user`.
    MonitorEval { user: UserId, text: String },
    /// Lock request refused; `user` is the current editor.
    Denied { user: UserId, codelet: CodeletId },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Shutdown => MessageKind::Shutdown,
            Self::Push { .. } => MessageKind::Push,
            Self::Load { .. } => MessageKind::Load,
            Self::Undo { .. } => MessageKind::Undo,
            Self::Name { .. } => MessageKind::Name,
            Self::Request { .. } => MessageKind::Request,
            Self::SetId { .. } => MessageKind::SetId,
            Self::Release { .. } => MessageKind::Release,
            Self::Update { .. } => MessageKind::Update,
            Self::Error { .. } => MessageKind::Error,
            Self::Info { .. } => MessageKind::Info,
            Self::Remove { .. } => MessageKind::Remove,
            Self::History { .. } => MessageKind::History,
            Self::Hide { .. } => MessageKind::Hide,
            Self::Seed { .. } => MessageKind::Seed,
            Self::Typing { .. } => MessageKind::Typing,
            Self::Chat { .. } => MessageKind::Chat,
            Self::Clear { .. } => MessageKind::Clear,
            Self::MonitorStart { .. } => MessageKind::MonitorStart,
            Self::MonitorStop { .. } => MessageKind::MonitorStop,
            Self::MonitorEval { .. } => MessageKind::MonitorEval,
            Self::Denied { .. } => MessageKind::Denied,
        }
    }

    /// The `sourceUserId` slot of the wire array.
    pub fn source(&self) -> UserId {
        match self {
            Self::Shutdown | Self::History { .. } | Self::Seed { .. } => SERVER_ID,
            Self::Push { user, .. }
            | Self::Load { user, .. }
            | Self::Undo { user, .. }
            | Self::Name { user, .. }
            | Self::Request { user, .. }
            | Self::SetId { user }
            | Self::Release { user, .. }
            | Self::Update { user, .. }
            | Self::Error { user, .. }
            | Self::Info { user, .. }
            | Self::Remove { user }
            | Self::Hide { user, .. }
            | Self::Typing { user, .. }
            | Self::Chat { user, .. }
            | Self::Clear { user }
            | Self::MonitorStart { user, .. }
            | Self::MonitorStop { user, .. }
            | Self::MonitorEval { user, .. }
            | Self::Denied { user, .. } => *user,
        }
    }

    /// Overwrite the source user. Server-originated kinds are unchanged.
    pub fn with_source(mut self, source: UserId) -> Self {
        match &mut self {
            Self::Shutdown | Self::History { .. } | Self::Seed { .. } => {}
            Self::Push { user, .. }
            | Self::Load { user, .. }
            | Self::Undo { user, .. }
            | Self::Name { user, .. }
            | Self::Request { user, .. }
            | Self::SetId { user }
            | Self::Release { user, .. }
            | Self::Update { user, .. }
            | Self::Error { user, .. }
            | Self::Info { user, .. }
            | Self::Remove { user }
            | Self::Hide { user, .. }
            | Self::Typing { user, .. }
            | Self::Chat { user, .. }
            | Self::Clear { user }
            | Self::MonitorStart { user, .. }
            | Self::MonitorStop { user, .. }
            | Self::MonitorEval { user, .. }
            | Self::Denied { user, .. } => *user = source,
        }
        self
    }

    /// Build the `[kind, source, ...fields]` array.
    pub fn to_value(&self) -> Value {
        let k = self.kind().code();
        match self {
            Self::Shutdown => json!([k, SERVER_ID]),
            Self::Push { user, codelet, text } => json!([k, user, codelet, text]),
            Self::Load { user, codelet }
            | Self::Undo { user, codelet }
            | Self::Request { user, codelet }
            | Self::Release { user, codelet }
            | Self::Hide { user, codelet }
            | Self::Denied { user, codelet } => json!([k, user, codelet]),
            Self::Name { user, name } => json!([k, user, name]),
            Self::SetId { user } | Self::Remove { user } | Self::Clear { user } => json!([k, user]),
            Self::Update { user, codelet, text, order_id } => {
                json!([k, user, codelet, text, order_id])
            }
            Self::Error { user, message } => json!([k, user, message]),
            Self::Info { user, text }
            | Self::Chat { user, text }
            | Self::MonitorEval { user, text } => json!([k, user, text]),
            Self::History { codelet, history, order_id, hidden } => {
                json!([k, SERVER_ID, codelet, history, order_id, hidden])
            }
            Self::Seed { seed } => json!([k, SERVER_ID, seed]),
            Self::Typing { user, typing } => json!([k, user, typing]),
            Self::MonitorStart { user, target } | Self::MonitorStop { user, target } => {
                json!([k, user, target])
            }
        }
    }

    /// Parse a decoded JSON array.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Array(items) = value else {
            return Err(ProtocolError::DeserializationError(
                "message is not a JSON array".to_string(),
            ));
        };
        let mut f = Fields::new(items);
        let kind = MessageKind::from_code(f.int("kind")?)?;
        f.kind = Some(kind);
        let user = f.int("sourceUserId")?;

        let msg = match kind {
            MessageKind::Shutdown => Self::Shutdown,
            MessageKind::Push => Self::Push { user, codelet: f.int("codeletId")?, text: f.string("text")? },
            MessageKind::Load => Self::Load { user, codelet: f.int("codeletId")? },
            MessageKind::Undo => Self::Undo { user, codelet: f.int("codeletId")? },
            MessageKind::Name => Self::Name { user, name: f.string("name")? },
            MessageKind::Request => Self::Request { user, codelet: f.int("codeletId")? },
            MessageKind::SetId => Self::SetId { user },
            MessageKind::Release => Self::Release { user, codelet: f.int("codeletId")? },
            MessageKind::Update => Self::Update {
                user,
                codelet: f.int("codeletId")?,
                text: f.string("text")?,
                order_id: f.uint("orderId")?,
            },
            MessageKind::Error => Self::Error { user, message: f.string("message")? },
            MessageKind::Info => Self::Info { user, text: f.string("text")? },
            MessageKind::Remove => Self::Remove { user },
            MessageKind::History => Self::History {
                codelet: f.int("codeletId")?,
                history: f.history("history")?,
                order_id: f.uint("orderId")?,
                hidden: f.opt_bool("hidden")?.unwrap_or(false),
            },
            MessageKind::Hide => Self::Hide { user, codelet: f.int("codeletId")? },
            MessageKind::Seed => Self::Seed { seed: f.uint("seed")? },
            MessageKind::Typing => Self::Typing { user, typing: f.flag("flag")? },
            MessageKind::Chat => Self::Chat { user, text: f.string("text")? },
            MessageKind::Clear => Self::Clear { user },
            MessageKind::MonitorStart => Self::MonitorStart { user, target: f.int("target")? },
            MessageKind::MonitorStop => Self::MonitorStop { user, target: f.int("target")? },
            MessageKind::MonitorEval => Self::MonitorEval { user, text: f.string("text")? },
            MessageKind::Denied => Self::Denied { user, codelet: f.int("codeletId")? },
        };
        Ok(msg)
    }

    /// Serialize to compact JSON (no framing).
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&self.to_value())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON payload (no framing).
    pub fn decode_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Self::from_value(value)
    }

    /// Serialize to a complete length-prefixed frame.
    pub fn encode_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        frame(&self.encode_payload()?)
    }
}

/// Sequential typed access to the fields of a wire array.
struct Fields {
    items: std::vec::IntoIter<Value>,
    kind: Option<MessageKind>,
}

impl Fields {
    fn new(items: Vec<Value>) -> Self {
        Self { items: items.into_iter(), kind: None }
    }

    fn malformed(&self, field: &str, reason: &str) -> ProtocolError {
        ProtocolError::MalformedFields {
            kind: self.kind,
            reason: format!("{field}: {reason}"),
        }
    }

    fn next(&mut self, field: &str) -> Result<Value, ProtocolError> {
        self.items.next().ok_or_else(|| self.malformed(field, "missing"))
    }

    fn int(&mut self, field: &str) -> Result<i64, ProtocolError> {
        let v = self.next(field)?;
        v.as_i64().ok_or_else(|| self.malformed(field, "expected integer"))
    }

    fn uint(&mut self, field: &str) -> Result<u64, ProtocolError> {
        let v = self.next(field)?;
        v.as_u64().ok_or_else(|| self.malformed(field, "expected unsigned integer"))
    }

    fn string(&mut self, field: &str) -> Result<String, ProtocolError> {
        match self.next(field)? {
            Value::String(s) => Ok(s),
            _ => Err(self.malformed(field, "expected string")),
        }
    }

    /// Booleans, also accepting 0/1 from peers that send integers.
    fn flag(&mut self, field: &str) -> Result<bool, ProtocolError> {
        match self.next(field)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
            _ => Err(self.malformed(field, "expected boolean")),
        }
    }

    fn opt_bool(&mut self, field: &str) -> Result<Option<bool>, ProtocolError> {
        match self.items.next() {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
            Some(_) => Err(self.malformed(field, "expected boolean")),
        }
    }

    fn history(&mut self, field: &str) -> Result<Vec<HistoryEntry>, ProtocolError> {
        let v = self.next(field)?;
        serde_json::from_value(v).map_err(|e| self.malformed(field, &e.to_string()))
    }
}

/// First frame a client sends: `[username, passwordHash, interpreterId]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub password_hash: String,
    pub interpreter_id: u32,
}

impl Credentials {
    /// Build credentials from a plain-text password.
    pub fn new(name: impl Into<String>, password: &str, interpreter_id: u32) -> Self {
        Self {
            name: name.into(),
            password_hash: hash_password(password),
            interpreter_id,
        }
    }

    pub fn to_value(&self) -> Value {
        json!([self.name, self.password_hash, self.interpreter_id])
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Array(items) = value else {
            return Err(ProtocolError::DeserializationError(
                "credentials are not a JSON array".to_string(),
            ));
        };
        let mut f = Fields::new(items);
        let name = f.string("username")?;
        let password_hash = f.string("passwordHash")?;
        let interpreter_id = f.uint("interpreterId")?;
        let interpreter_id = u32::try_from(interpreter_id)
            .map_err(|_| f.malformed("interpreterId", "out of range"))?;
        Ok(Self { name, password_hash, interpreter_id })
    }

    pub fn encode_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = serde_json::to_vec(&self.to_value())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        frame(&payload)
    }

    pub fn decode_payload(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Self::from_value(value)
    }
}

/// SHA-256 of the password, lowercase hex.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Prefix `payload` with its length header.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + HEADER_LEN + EXTENDED_LEN);
    if (1..=MAX_CLASSIC_PAYLOAD).contains(&len) {
        out.extend_from_slice(format!("{len:04}").as_bytes());
    } else if len > MAX_CLASSIC_PAYLOAD && len <= MAX_EXTENDED_PAYLOAD {
        out.extend_from_slice(EXTENDED_MARKER);
        out.extend_from_slice(format!("{len:08}").as_bytes());
    } else {
        return Err(ProtocolError::FrameTooLarge { len, max: MAX_EXTENDED_PAYLOAD });
    }
    out.extend_from_slice(payload);
    Ok(out)
}

fn parse_digits(digits: &[u8]) -> Result<usize, ProtocolError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidHeader(
            String::from_utf8_lossy(digits).into_owned(),
        ));
    }
    Ok(digits
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0')))
}

fn map_io(e: std::io::Error) -> ProtocolError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => ProtocolError::ConnectionClosed,
        _ => ProtocolError::Io(e.to_string()),
    }
}

/// Read one frame's payload bytes.
pub async fn read_payload<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(map_io)?;

    let len = if &header == EXTENDED_MARKER {
        let mut ext = [0u8; EXTENDED_LEN];
        reader.read_exact(&mut ext).await.map_err(map_io)?;
        parse_digits(&ext)?
    } else {
        parse_digits(&header)?
    };

    if len == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(map_io)?;
    Ok(payload)
}

/// Read and decode one message.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_payload(reader, max_len).await?;
    Message::decode_payload(&payload)
}

/// Read and decode the handshake credentials.
pub async fn read_credentials<R>(reader: &mut R, max_len: usize) -> Result<Credentials, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_payload(reader, max_len).await?;
    Credentials::decode_payload(&payload)
}

/// Write already-framed bytes and flush.
pub async fn write_raw<W>(writer: &mut W, bytes: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await.map_err(map_io)?;
    writer.flush().await.map_err(map_io)
}

/// Encode and write one message.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_raw(writer, &msg.encode_frame()?).await
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidHeader(String),
    FrameTooLarge { len: usize, max: usize },
    UnknownKind(i64),
    MalformedFields { kind: Option<MessageKind>, reason: String },
    ConnectionClosed,
    Timeout,
    Io(String),
}

impl ProtocolError {
    /// Short/garbled header, oversize frame or reset: the peer is treated as
    /// disconnected rather than misbehaving.
    pub fn is_framing_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::InvalidHeader(_) | Self::FrameTooLarge { .. } | Self::Io(_)
        )
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidHeader(h) => write!(f, "Invalid length header: {h:?}"),
            Self::FrameTooLarge { len, max } => write!(f, "Frame of {len} bytes exceeds {max}"),
            Self::UnknownKind(k) => write!(f, "Unknown message kind: {k}"),
            Self::MalformedFields { kind, reason } => match kind {
                Some(kind) => write!(f, "Malformed {kind:?} message: {reason}"),
                None => write!(f, "Malformed message: {reason}"),
            },
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_frame_matches_classic_format() {
        let msg = Message::Push { user: 1, codelet: -1, text: "Clock.bpm=120".to_string() };
        let frame = msg.encode_frame().unwrap();
        let payload = br#"[1,1,-1,"Clock.bpm=120"]"#;
        let mut expected = format!("{:04}", payload.len()).into_bytes();
        expected.extend_from_slice(payload);
        assert_eq!(frame, expected);
    }

    #[test]
    fn test_update_wire_array() {
        let msg = Message::Update { user: 1, codelet: 1, text: "Clock.bpm=120".to_string(), order_id: 1 };
        assert_eq!(msg.to_value(), json!([10, 1, 1, "Clock.bpm=120", 1]));
    }

    #[test]
    fn test_history_wire_array() {
        let msg = Message::History {
            codelet: 4,
            history: vec![HistoryEntry::new(1, "a"), HistoryEntry::new(2, "b")],
            order_id: 9,
            hidden: true,
        };
        assert_eq!(
            msg.to_value(),
            json!([14, -1, 4, [[1, "a"], [2, "b"]], 9, true])
        );
        let decoded = Message::from_value(msg.to_value()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_history_without_hidden_flag_defaults_visible() {
        let value = json!([14, -1, 2, [[1, "x"]], 3]);
        match Message::from_value(value).unwrap() {
            Message::History { hidden, order_id, .. } => {
                assert!(!hidden);
                assert_eq!(order_id, 3);
            }
            other => panic!("expected History, got {other:?}"),
        }
    }

    #[test]
    fn test_server_originated_shapes() {
        assert_eq!(Message::SetId { user: 4 }.to_value(), json!([8, 4]));
        assert_eq!(Message::Seed { seed: 77 }.to_value(), json!([16, -1, 77]));
        assert_eq!(Message::Shutdown.to_value(), json!([0, -1]));
        assert_eq!(Message::Seed { seed: 77 }.source(), SERVER_ID);
    }

    #[test]
    fn test_typing_accepts_integer_flag() {
        let msg = Message::from_value(json!([17, 3, 1])).unwrap();
        assert_eq!(msg, Message::Typing { user: 3, typing: true });
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Message::from_value(json!([99, 1])).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind(99));
        assert!(!err.is_framing_failure());
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = Message::from_value(json!([1, 1, 5])).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFields { kind: Some(MessageKind::Push), .. }));
    }

    #[test]
    fn test_non_array_rejected() {
        assert!(Message::decode_payload(br#"{"kind":1}"#).is_err());
        assert!(Message::decode_payload(b"not json").is_err());
    }

    #[test]
    fn test_with_source_overwrites_user() {
        let msg = Message::Push { user: 9, codelet: 1, text: "x".to_string() }.with_source(2);
        assert_eq!(msg.source(), 2);
        let seed = Message::Seed { seed: 1 }.with_source(2);
        assert_eq!(seed.source(), SERVER_ID);
    }

    #[test]
    fn test_kind_codes_roundtrip() {
        for code in 0..=23 {
            if let Ok(kind) = MessageKind::from_code(code) {
                assert_eq!(i64::from(kind.code()), code);
            }
        }
        assert!(MessageKind::from_code(2).is_err());
        assert!(MessageKind::from_code(4).is_err());
    }

    #[test]
    fn test_large_payload_uses_extended_header() {
        let payload = vec![b'x'; 12_345];
        let framed = frame(&payload).unwrap();
        assert_eq!(&framed[..4], b"0000");
        assert_eq!(&framed[4..12], b"00012345");
        assert_eq!(framed.len(), 12 + 12_345);
    }

    #[test]
    fn test_empty_payload_not_framed() {
        assert!(matches!(frame(&[]), Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_credentials_shape() {
        let creds = Credentials::new("alice", "secret", 0);
        assert_eq!(creds.password_hash.len(), 64);
        let value = creds.to_value();
        assert_eq!(value[0], "alice");
        assert_eq!(value[2], 0);
        assert_eq!(Credentials::from_value(value).unwrap(), creds);
    }

    #[test]
    fn test_hash_password_is_stable() {
        assert_eq!(hash_password("pw"), hash_password("pw"));
        assert_ne!(hash_password("pw"), hash_password("pW"));
        assert_eq!(
            hash_password(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let msg = Message::Chat { user: 2, text: "hello".to_string() };
        let bytes = msg.encode_frame().unwrap();
        let mut reader = &bytes[..];
        let decoded = read_frame(&mut reader, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_read_extended_frame() {
        let text = "p1 >> pluck()\n".repeat(1_000);
        let msg = Message::Push { user: 1, codelet: 3, text };
        let bytes = msg.encode_frame().unwrap();
        assert_eq!(&bytes[..4], b"0000");
        let mut reader = &bytes[..];
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_short_header_is_disconnect() {
        let mut reader: &[u8] = b"00";
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert_eq!(err, ProtocolError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_short_payload_is_disconnect() {
        let mut reader: &[u8] = b"0010[1,2";
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert_eq!(err, ProtocolError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_garbled_header_is_framing_failure() {
        let mut reader: &[u8] = b"ab12[]";
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert!(err.is_framing_failure());
    }

    #[tokio::test]
    async fn test_zero_extended_length_is_disconnect() {
        let mut reader: &[u8] = b"000000000000";
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert_eq!(err, ProtocolError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_frame_over_limit_rejected() {
        let bytes = Message::Chat { user: 1, text: "x".repeat(200) }.encode_frame().unwrap();
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 64, .. }));
    }

    #[tokio::test]
    async fn test_write_then_read_credentials() {
        let creds = Credentials::new("bob", "", 0);
        let mut buf: Vec<u8> = Vec::new();
        write_raw(&mut buf, &creds.encode_frame().unwrap()).await.unwrap();
        let mut reader = &buf[..];
        let decoded = read_credentials(&mut reader, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(decoded, creds);
    }
}
