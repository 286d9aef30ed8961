pub mod adapters;
pub mod cache;
pub mod errors;
pub mod harness;
pub mod models;
pub mod multiplexer;
pub mod orchestrator;
pub mod redaction;
pub mod registry;
pub mod runner;
pub mod settings;

pub use crate::cache::{fingerprint, CacheEntry, ResultCache};
pub use crate::errors::{AppError, AppResult};
pub use crate::harness::protocol::{LineProtocolParser, PatternSet, Severity};
pub use crate::models::{
    CommandResult, CommandSpec, ExitOutcome, InvocationState, Origin, OutputChunk, ProgressStatus,
    RunnerSettings, Trigger,
};
pub use crate::orchestrator::Orchestrator;
pub use crate::registry::{CancelOutcome, CommandRegistry, InvocationHandle};
pub use crate::runner::{ChunkStream, ProcessRunner, RunnerLimits};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the JSON file subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(log_dir: &Path, default_filter: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "runner.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Config(format!("failed to install tracing subscriber: {}", error)))
}

/// Loads settings from `settings_path`, starts logging under `log_dir` and
/// builds the session's orchestrator.
pub fn start_session(settings_path: &Path, log_dir: &Path) -> AppResult<Orchestrator> {
    let settings = settings::load_settings(settings_path)?;
    init_tracing(log_dir, &settings.log_level)?;
    tracing::info!(settings = %settings_path.display(), "launcher core session started");
    Ok(Orchestrator::new(settings))
}
