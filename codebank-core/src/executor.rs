//! Code execution collaborator.
//!
//! The session core never interprets code itself. It hands codelet text to
//! a [`CodeExecutor`] at a few fixed points (after a push is accepted, after
//! history replay, after the shared seed arrives) and treats whatever comes
//! back as opaque text.
//!
//! ```text
//! SessionState ──execute(text)──► CodeExecutor ──stdin──► interpreter
//!                 ◄──output────                ◄─stdout──
//! ```

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// Contract between the session core and a code interpreter.
pub trait CodeExecutor: Send + Sync {
    /// Run `code` and return whatever output it produced.
    fn execute(&self, code: &str) -> String;

    /// Whether `output` signals a failed evaluation.
    fn contains_error(&self, output: &str) -> bool;

    /// Code that pins the interpreter's RNG to `seed`.
    fn random_seed_setter(&self, seed: u64) -> String;

    /// Code that stops all scheduled output / clears the clock.
    fn stop_command(&self) -> String;
}

/// Per-interpreter dialect: how code is framed and how errors look.
pub trait Language: Send + Sync {
    /// Identifier exchanged during the handshake. Peers must agree on it.
    fn interpreter_id(&self) -> u32;

    fn format_code(&self, code: &str) -> String {
        code.to_string()
    }

    fn contains_error(&self, output: &str) -> bool;

    fn random_seed_setter(&self, seed: u64) -> String;

    fn stop_command(&self) -> String;
}

/// The FoxDot live-coding environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoxDot;

impl FoxDot {
    pub const INTERPRETER_ID: u32 = 0;
}

impl Language for FoxDot {
    fn interpreter_id(&self) -> u32 {
        Self::INTERPRETER_ID
    }

    fn format_code(&self, code: &str) -> String {
        format!("{code}\n\n")
    }

    fn contains_error(&self, output: &str) -> bool {
        output.starts_with("Traceback")
    }

    fn random_seed_setter(&self, seed: u64) -> String {
        format!("RandomGenerator.set_override_seed({seed})")
    }

    fn stop_command(&self) -> String {
        "Clock.clear()".to_string()
    }
}

/// Executor that runs nothing. Used by headless servers and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullExecutor;

impl CodeExecutor for NullExecutor {
    fn execute(&self, code: &str) -> String {
        log::trace!("Null executor dropping {} bytes of code", code.len());
        String::new()
    }

    fn contains_error(&self, output: &str) -> bool {
        FoxDot.contains_error(output)
    }

    fn random_seed_setter(&self, seed: u64) -> String {
        FoxDot.random_seed_setter(seed)
    }

    fn stop_command(&self) -> String {
        FoxDot.stop_command()
    }
}

/// Drives an interpreter subprocess through its stdin.
///
/// stdout and stderr are collected by background threads into a shared
/// buffer. `execute` writes the code, waits `settle` for the interpreter
/// to respond, and returns everything buffered since the previous call.
pub struct PipeExecutor<L: Language> {
    language: L,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    output: Arc<Mutex<String>>,
    settle: Duration,
}

impl<L: Language> PipeExecutor<L> {
    /// Spawn an explicit command line (whitespace separated).
    pub fn spawn_command(language: L, command_line: &str) -> std::io::Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty interpreter command")
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            Self::collect(stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::collect(stderr, output.clone());
        }
        let stdin = child.stdin.take();

        log::info!("Interpreter started: {command_line} (pid {})", child.id());

        Ok(Self {
            language,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            output,
            settle: Duration::from_millis(50),
        })
    }

    /// How long `execute` waits for output before returning.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn collect(stream: impl Read + Send + 'static, output: Arc<Mutex<String>>) {
        thread::spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        let mut buf = output.lock();
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                    Err(e) => {
                        log::debug!("Interpreter output closed: {e}");
                        break;
                    }
                }
            }
        });
    }

    fn pipe(&self, code: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock();
        match stdin.as_mut() {
            Some(pipe) => {
                pipe.write_all(self.language.format_code(code).as_bytes())?;
                pipe.flush()
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "interpreter stdin closed",
            )),
        }
    }
}

impl<L: Language> CodeExecutor for PipeExecutor<L> {
    fn execute(&self, code: &str) -> String {
        if let Err(e) = self.pipe(code) {
            log::error!("Failed to pipe code to interpreter: {e}");
            return String::new();
        }
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        std::mem::take(&mut *self.output.lock())
    }

    fn contains_error(&self, output: &str) -> bool {
        self.language.contains_error(output)
    }

    fn random_seed_setter(&self, seed: u64) -> String {
        self.language.random_seed_setter(seed)
    }

    fn stop_command(&self) -> String {
        self.language.stop_command()
    }
}

impl<L: Language> Drop for PipeExecutor<L> {
    fn drop(&mut self) {
        // Closing stdin lets a well-behaved interpreter exit on its own.
        self.stdin.lock().take();
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill() {
                log::warn!("Failed to stop interpreter: {e}");
            }
        }
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foxdot_dialect() {
        assert!(FoxDot.contains_error("Traceback (most recent call last):"));
        assert!(!FoxDot.contains_error("ok"));
        assert_eq!(
            FoxDot.random_seed_setter(42),
            "RandomGenerator.set_override_seed(42)"
        );
        assert_eq!(FoxDot.stop_command(), "Clock.clear()");
        assert_eq!(FoxDot.format_code("p1 >> pluck()"), "p1 >> pluck()\n\n");
        assert_eq!(FoxDot.interpreter_id(), 0);
    }

    #[test]
    fn test_null_executor_is_silent() {
        let exec = NullExecutor;
        assert_eq!(exec.execute("Clock.bpm = 120"), "");
        assert!(!exec.contains_error(""));
        assert_eq!(exec.stop_command(), "Clock.clear()");
    }

    #[test]
    fn test_spawn_command_rejects_empty() {
        assert!(PipeExecutor::spawn_command(FoxDot, "   ").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_executor_echoes_through_cat() {
        let exec = PipeExecutor::spawn_command(FoxDot, "cat")
            .unwrap()
            .with_settle(Duration::from_millis(200));
        let out = exec.execute("print(1)");
        assert!(out.starts_with("print(1)"), "unexpected output {out:?}");
        assert!(!exec.contains_error(&out));
    }
}
