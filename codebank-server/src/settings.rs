//! Environment-driven server settings.
//!
//! Every variable is optional; unset ones fall back to `ServerConfig::default()`.

use codebank_collab::server::ServerConfig;
use thiserror::Error;

pub const BIND_ADDR: &str = "CODEBANK_BIND_ADDR";
pub const PASSWORD: &str = "CODEBANK_PASSWORD";
pub const INTERPRETER: &str = "CODEBANK_INTERPRETER";
pub const INTERPRETER_CMD: &str = "CODEBANK_INTERPRETER_CMD";
pub const SEED: &str = "CODEBANK_SEED";
pub const NOTIFY_DENIED: &str = "CODEBANK_NOTIFY_DENIED";
pub const MAX_FRAME_BYTES: &str = "CODEBANK_MAX_FRAME_BYTES";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid { var: &'static str, expected: &'static str, value: String },
}

/// Server configuration plus the interpreter command line, if any.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    /// Run code through this command. `None` runs a headless server.
    pub interpreter_cmd: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut server = ServerConfig::default();

        if let Some(addr) = lookup(BIND_ADDR) {
            server.bind_addr = addr;
        }
        if let Some(password) = lookup(PASSWORD) {
            server = server.with_password(&password);
        }
        if let Some(raw) = lookup(INTERPRETER) {
            server.interpreter_id = parse(INTERPRETER, &raw, "an interpreter id")?;
        }
        if let Some(raw) = lookup(SEED) {
            server.seed = Some(parse(SEED, &raw, "an unsigned integer")?);
        }
        if let Some(raw) = lookup(NOTIFY_DENIED) {
            server.notify_lock_denied = parse_flag(NOTIFY_DENIED, &raw)?;
        }
        if let Some(raw) = lookup(MAX_FRAME_BYTES) {
            server.max_frame_len = parse(MAX_FRAME_BYTES, &raw, "a byte count")?;
        }

        let interpreter_cmd = lookup(INTERPRETER_CMD).filter(|cmd| !cmd.trim().is_empty());
        Ok(Self { server, interpreter_cmd })
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, raw: &str, expected: &'static str) -> Result<T, SettingsError> {
    raw.trim().parse().map_err(|_| SettingsError::Invalid { var, expected, value: raw.to_string() })
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, SettingsError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::Invalid { var, expected: "a boolean", value: raw.to_string() }),
    }
}
