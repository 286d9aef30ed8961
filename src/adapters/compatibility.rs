use crate::adapters::{require_success, run_with_deadline};
use crate::errors::{AppError, AppResult};
use crate::models::CommandSpec;
use crate::orchestrator::Orchestrator;
use tokio::time::Duration;

/// Runs a `--version` style probe and returns the first dotted version in
/// its output.
pub async fn detect_version(host: &Orchestrator, spec: CommandSpec) -> AppResult<String> {
    let limit = Duration::from_millis(host.settings().version_probe_timeout_ms);
    let program = spec.program.clone();
    let result = run_with_deadline(host, spec, limit).await?;
    require_success(&result)?;

    let stdout = result.stdout.trim();
    if stdout.is_empty() {
        return Err(AppError::Parse(format!("{} printed no version", program)));
    }
    extract_semver(stdout)
        .ok_or_else(|| AppError::Parse(format!("no version number in {:?}", stdout)))
}

pub fn extract_semver(raw: &str) -> Option<String> {
    let mut current = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() || (ch == '.' && !current.is_empty()) {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    let trimmed = current.trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn version_at_least(version: &str, minimum: &str) -> bool {
    parse_version(version) >= parse_version(minimum)
}

pub fn ensure_minimum(tool: &str, version: &str, minimum: &str) -> AppResult<()> {
    if version_at_least(version, minimum) {
        return Ok(());
    }
    Err(AppError::Config(format!(
        "{} {} is older than the minimum supported {}",
        tool, version, minimum
    )))
}

fn parse_version(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.').filter_map(|segment| segment.parse::<u64>().ok());
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
