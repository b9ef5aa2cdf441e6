//! One execution model over the Claude, Codex and Gemini headless CLIs.
//!
//! [`Executor`] turns a [`PromptRequest`] into the right subprocess call for a
//! backend, normalizes its output into [`UnifiedEvent`]s, and composes single
//! runs into parallel batches, chains and comparisons.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod events;
pub mod harness;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod runner;
pub mod session;

pub use adapters::{Adapter, BackendRegistry, CommandSpec, ResponseEnvelope};
pub use config::{BackendConfig, GatewayConfig};
pub use errors::{AppError, AppResult};
pub use events::{EventCollector, EventContent, EventParser, EventType, UnifiedEvent};
pub use models::{
    ApprovalMode, Backend, ChainRequest, ChainResult, CompareEntry, CompareRequest, CompareResult,
    OutputFormat, ParallelRequest, ParallelResult, PromptRequest, PromptResult, SandboxMode,
    SessionRecord, SessionStatus, TokenUsage, UnifiedOptions,
};
pub use runner::Executor;
pub use session::{InMemorySessionStore, SessionStore};
pub use tokio_util::sync::CancellationToken;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the JSON subscriber. With a log directory, output goes to a
/// daily-rolling `gateway.log` there; otherwise to stderr.
pub fn init_tracing(log_dir: Option<&Path>) -> AppResult<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let installed = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "gateway.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init(),
    };
    installed.map_err(|error| AppError::Internal(format!("failed to install tracing: {}", error)))
}
