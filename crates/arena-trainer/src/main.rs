//! Training session orchestrator binary.
//!
//! Wires the configuration, the observer endpoint and the operator
//! controls around one [`Session`], runs it, and exits with a code that
//! reflects the [`SessionResult`].
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `arena-trainer.yaml` (or `ARENA_CONFIG`)
//! 2. Initialize structured logging (tracing) at the configured verbosity
//! 3. Create the session status and abort signal
//! 4. Create the observer endpoint (bound by the session)
//! 5. Route Ctrl-C to the abort signal
//! 6. Run the session
//! 7. Log the report and exit
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | `CompletedNormally` or `TimedOut` |
//! | 1 | `AgentFailure` |
//! | 2 | `Aborted` |
//! | 3 | Startup error (configuration unreadable) |

mod error;
mod viewer;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use arena_core::config::{SessionConfig, Verbosity};
use arena_core::operator::AbortSignal;
use arena_core::session::{EXTERNAL_ABORT, Session, SessionDeps, SessionReport};
use arena_core::status::SessionStatus;
use arena_observer::{AppState, ObserverEndpoint};
use arena_types::{SessionId, SessionResult};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::TrainerError;

/// Config file used when `ARENA_CONFIG` is not set.
const DEFAULT_CONFIG: &str = "arena-trainer.yaml";

#[tokio::main]
async fn main() -> ExitCode {
    let loaded = load_config();
    let verbosity = loaded
        .as_ref()
        .map_or_else(|_| Verbosity::default(), SessionConfig::verbosity);
    init_tracing(verbosity);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::from(3);
        }
    };

    let report = run(config).await;
    if let Err(e) = log_report(&report, verbosity) {
        warn!(error = %e, "Session report could not be printed");
    }
    ExitCode::from(exit_code(&report.result))
}

/// Install the global subscriber. `RUST_LOG` wins over the config flags.
fn init_tracing(verbosity: Verbosity) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive())),
        )
        .with_target(true)
        .init();
}

/// Load the session configuration.
///
/// Reads `ARENA_CONFIG` if set, else `arena-trainer.yaml` in the working
/// directory. A missing default file means defaults plus environment
/// overrides; a missing explicit file is an error.
fn load_config() -> Result<SessionConfig, TrainerError> {
    let explicit = std::env::var_os("ARENA_CONFIG").map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    if explicit.is_some() || path.exists() {
        return Ok(SessionConfig::from_file(&path)?);
    }

    let mut config = SessionConfig::default();
    config.apply_env_overrides()?;
    Ok(config)
}

/// Build the session around an observer endpoint and run it.
async fn run(config: SessionConfig) -> SessionReport {
    let status = Arc::new(SessionStatus::new(
        SessionId::new(),
        &config.map,
        config.tick_rate,
    ));
    let abort = Arc::new(AbortSignal::new());
    let state = Arc::new(AppState::new(
        Arc::clone(&status),
        Arc::clone(&abort),
        config.viewer_url(),
    ));
    let endpoint = Arc::new(ObserverEndpoint::new(state));

    info!(
        session = %status.session(),
        config_map = %config.map,
        agents = config.agents.len(),
        listen = %config.listen_addr(),
        "arena-trainer starting"
    );

    let signal = Arc::clone(&abort);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, aborting session");
                signal.trigger(EXTERNAL_ABORT);
            }
            Err(e) => warn!(error = %e, "Ctrl-C handler unavailable"),
        }
    });

    if !config.no_browser {
        viewer::open_when_listening(Arc::clone(&endpoint), config.viewer_url());
    }

    let deps = SessionDeps::new(status, endpoint).with_abort(abort);
    Session::new(config, deps).run().await
}

/// Summarize the finished session; the full report goes to stdout as JSON
/// when profiling.
fn log_report(report: &SessionReport, verbosity: Verbosity) -> Result<(), TrainerError> {
    info!(
        session = %report.session,
        result = %report.result,
        ticks = report.ticks_completed,
        overruns = report.overruns,
        frames_recorded = report.frames_recorded,
        frames_published = report.publisher.published,
        frames_delivered = report.publisher.delivered,
        elapsed_ms = report.elapsed.as_millis(),
        "arena-trainer shutdown complete"
    );

    if verbosity.profile {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    Ok(())
}

/// Process exit code for a session outcome.
const fn exit_code(result: &SessionResult) -> u8 {
    match result {
        SessionResult::CompletedNormally | SessionResult::TimedOut => 0,
        SessionResult::AgentFailure { .. } => 1,
        SessionResult::Aborted { .. } => 2,
    }
}

#[cfg(test)]
mod tests {
    use arena_types::AgentIndex;

    use super::*;

    #[test]
    fn success_outcomes_exit_zero() {
        assert_eq!(exit_code(&SessionResult::CompletedNormally), 0);
        assert_eq!(exit_code(&SessionResult::TimedOut), 0);
    }

    #[test]
    fn failures_have_distinct_codes() {
        let agent = SessionResult::AgentFailure {
            agent: AgentIndex(1),
            reason: String::from("connection closed"),
        };
        let aborted = SessionResult::Aborted {
            reason: String::from("tick rate must be greater than zero"),
        };
        assert_eq!(exit_code(&agent), 1);
        assert_eq!(exit_code(&aborted), 2);
    }
}
