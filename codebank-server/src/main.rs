//! CodeBank server — hosts one shared live-coding session.
//!
//! Configuration comes from `CODEBANK_*` environment variables (see
//! [`settings`]); log level from `RUST_LOG`, `info` by default.

mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use codebank_collab::server::SyncServer;
use codebank_core::{CodeExecutor, FoxDot, NullExecutor, PipeExecutor};
use settings::Settings;

fn executor(settings: &Settings) -> std::io::Result<Arc<dyn CodeExecutor>> {
    match &settings.interpreter_cmd {
        Some(cmd) => {
            info!("Starting interpreter: {cmd}");
            Ok(Arc::new(PipeExecutor::spawn_command(FoxDot, cmd)?))
        }
        None => {
            info!("No interpreter configured; code will not run on the server");
            Ok(Arc::new(NullExecutor))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("Bad configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let executor = match executor(&settings) {
        Ok(x) => x,
        Err(e) => {
            error!("Failed to start interpreter: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting CodeBank server...");
    match SyncServer::new(settings.server, executor).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
