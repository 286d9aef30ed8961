pub mod compatibility;
pub mod legendary;
pub mod wine;

use crate::errors::{AppError, AppResult};
use crate::harness::cli_missing::{cli_missing_message, find_cli_missing_line};
use crate::harness::protocol::PatternSet;
use crate::models::{CommandResult, CommandSpec};
use crate::orchestrator::Orchestrator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Domain-level result of one tool operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum OperationOutcome {
    Completed,
    Cancelled,
    Failed { message: String, exit_code: i32 },
}

impl OperationOutcome {
    /// Cancellation wins over everything, then the tool's own error line,
    /// then the exit code.
    pub fn from_result(tool: &str, result: &CommandResult) -> Self {
        if result.was_cancelled() {
            return Self::Cancelled;
        }
        let exit_code = result.exit_code();
        if let Some(message) = &result.protocol_error {
            return Self::Failed {
                message: message.clone(),
                exit_code,
            };
        }
        if result.success() {
            return Self::Completed;
        }
        let message = match find_cli_missing_line(&result.stderr) {
            Some(line) => cli_missing_message(tool, line),
            None => match last_line(&result.stderr) {
                Some(line) => format!("{} exited with code {}: {}", tool, exit_code, line),
                None => format!("{} exited with code {}", tool, exit_code),
            },
        };
        Self::Failed { message, exit_code }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failed { message, .. } => Some(message),
            _ => None,
        }
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

/// Converts a finished run into an error for operations that need the
/// tool's output to be meaningful.
pub fn require_success(result: &CommandResult) -> AppResult<()> {
    if result.was_cancelled() {
        return Err(AppError::Cancelled(result.id.clone()));
    }
    if let Some(message) = &result.protocol_error {
        return Err(AppError::Protocol(message.clone()));
    }
    if !result.success() {
        return Err(AppError::ChildTerminated(result.exit_code()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchReport {
    pub outcome: OperationOutcome,
    pub result: CommandResult,
}

/// A wrapped command-line tool.
pub trait Adapter: Send + Sync {
    fn tool(&self) -> &'static str;

    fn patterns(&self) -> Arc<PatternSet>;

    fn host(&self) -> &Orchestrator;

    fn outcome(&self, result: &CommandResult) -> OperationOutcome {
        OperationOutcome::from_result(self.tool(), result)
    }
}

/// Races `spec` against `limit`. On expiry the invocation is cancelled by id
/// and awaited before `TIMEOUT` is returned, so no child outlives the call.
pub async fn run_with_deadline(
    host: &Orchestrator,
    spec: CommandSpec,
    limit: Duration,
) -> AppResult<CommandResult> {
    let id = spec.id.clone();
    let run = host.run(spec);
    tokio::pin!(run);
    match timeout(limit, &mut run).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(invocation = %id, limit_ms = limit.as_millis() as u64, "command exceeded deadline");
            host.cancel(&id).await;
            let _ = run.await;
            Err(AppError::Timeout { id, limit })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{require_success, OperationOutcome};
    use crate::errors::AppError;
    use crate::models::{CommandResult, ExitOutcome};

    fn result(outcome: ExitOutcome, stderr: &str, protocol_error: Option<&str>) -> CommandResult {
        CommandResult {
            id: "install:X".to_string(),
            stdout: String::new(),
            stderr: stderr.to_string(),
            outcome,
            protocol_error: protocol_error.map(str::to_string),
            duration_ms: 0,
        }
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let outcome = OperationOutcome::from_result(
            "legendary",
            &result(ExitOutcome::Cancelled, "", Some("ignored")),
        );
        assert_eq!(outcome, OperationOutcome::Cancelled);
    }

    #[test]
    fn protocol_error_is_the_primary_message() {
        let outcome = OperationOutcome::from_result(
            "legendary",
            &result(ExitOutcome::Exited(1), "ERROR: A\n", Some("A")),
        );
        assert_eq!(
            outcome,
            OperationOutcome::Failed {
                message: "A".to_string(),
                exit_code: 1
            }
        );
    }

    #[test]
    fn exit_code_failures_mention_missing_tools() {
        let missing = OperationOutcome::from_result(
            "wine",
            &result(ExitOutcome::Exited(127), "sh: wine: command not found\n", None),
        );
        assert!(missing.message().unwrap_or_default().contains("does not appear to be installed"));

        let generic = OperationOutcome::from_result("wine", &result(ExitOutcome::Exited(3), "", None));
        assert_eq!(generic.message(), Some("wine exited with code 3"));
        assert!(OperationOutcome::from_result("wine", &result(ExitOutcome::Exited(0), "", None)).is_completed());
    }

    #[test]
    fn require_success_maps_each_failure_kind() {
        assert!(matches!(
            require_success(&result(ExitOutcome::Cancelled, "", None)),
            Err(AppError::Cancelled(_))
        ));
        assert!(matches!(
            require_success(&result(ExitOutcome::Exited(0), "", Some("A"))),
            Err(AppError::Protocol(_))
        ));
        assert!(matches!(
            require_success(&result(ExitOutcome::Exited(2), "", None)),
            Err(AppError::ChildTerminated(2))
        ));
        assert!(require_success(&result(ExitOutcome::Exited(0), "", None)).is_ok());
    }
}
