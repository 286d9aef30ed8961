use super::compatibility::{detect_version, ensure_minimum};
use super::{require_success, Adapter, LaunchReport, OperationOutcome};
use crate::errors::{AppError, AppResult};
use crate::harness::protocol::PatternSet;
use crate::models::{CommandResult, CommandSpec, Origin, ProgressStatus, Trigger};
use crate::orchestrator::Orchestrator;
use crate::registry::CancelOutcome;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const MINIMUM_VERSION: &str = "0.20.30";

/// Printed on stdout when the game offers optional install components.
pub const ADDITIONAL_PACKS_PROMPT: &str = "Additional packs [Enter to confirm]:";

const NOT_LOGGED_IN: &str = "<not logged in>";

static LOGGED_IN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"Successfully logged in as "([^"]+)""#).expect("valid login regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallKind {
    Install,
    Update,
    Repair,
}

impl InstallKind {
    pub fn verb(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Repair => "repair",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub app_name: String,
    pub kind: InstallKind,
    pub platform: Option<String>,
    pub base_path: Option<PathBuf>,
    pub optional_packs: Vec<String>,
}

impl InstallRequest {
    pub fn new(app_name: impl Into<String>, kind: InstallKind) -> Self {
        Self {
            app_name: app_name.into(),
            kind,
            platform: None,
            base_path: None,
            optional_packs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub outcome: OperationOutcome,
    pub progress: ProgressStatus,
    pub result: CommandResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInReport {
    pub outcome: OperationOutcome,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub games_available: u64,
    #[serde(default)]
    pub games_installed: u64,
    #[serde(default)]
    pub config_directory: Option<String>,
}

impl AccountStatus {
    pub fn is_signed_in(&self) -> bool {
        self.account
            .as_deref()
            .map(|name| !name.is_empty() && name != NOT_LOGGED_IN)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledGame {
    pub app_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub install_path: Option<String>,
    #[serde(default)]
    pub install_size: u64,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub is_dlc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub app_name: String,
    pub wine: Option<PathBuf>,
    pub wine_prefix: Option<PathBuf>,
    pub offline: bool,
    pub extra_args: Vec<String>,
}

impl LaunchRequest {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            wine: None,
            wine_prefix: None,
            offline: false,
            extra_args: Vec::new(),
        }
    }
}

/// Drives the storefront download client.
#[derive(Debug, Clone)]
pub struct LegendaryAdapter {
    host: Orchestrator,
    patterns: Arc<PatternSet>,
}

impl Adapter for LegendaryAdapter {
    fn tool(&self) -> &'static str {
        "legendary"
    }

    fn patterns(&self) -> Arc<PatternSet> {
        self.patterns.clone()
    }

    fn host(&self) -> &Orchestrator {
        &self.host
    }
}

impl LegendaryAdapter {
    pub fn new(host: Orchestrator) -> Self {
        Self {
            host,
            patterns: Arc::new(PatternSet::storefront()),
        }
    }

    pub fn install_id(app_name: &str) -> String {
        format!("install:{}", app_name)
    }

    pub fn launch_id(app_name: &str) -> String {
        format!("launch:{}", app_name)
    }

    pub fn uninstall_id(app_name: &str) -> String {
        format!("uninstall:{}", app_name)
    }

    fn command(&self, id: &str) -> AppResult<CommandSpec> {
        let settings = self.host.settings();
        let mut spec = CommandSpec::from_argv(id, &settings.legendary_command)
            .ok_or_else(|| AppError::Config("legendaryCommand must name a program".to_string()))?;
        if let Some(dir) = &settings.legendary_config_dir {
            spec = spec.env("LEGENDARY_CONFIG_PATH", dir.display().to_string());
        }
        Ok(spec)
    }

    /// Installs, updates or repairs a game. Optional packs answer the
    /// additional-packs prompt; an empty selection just confirms it.
    pub async fn install(&self, request: &InstallRequest) -> AppResult<InstallReport> {
        let id = Self::install_id(&request.app_name);
        let mut spec = self
            .command(&id)?
            .arg(request.kind.verb())
            .arg(&request.app_name);
        if let Some(platform) = &request.platform {
            spec = spec.args(["--platform", platform.as_str()]);
        }
        if let Some(base_path) = &request.base_path {
            spec = spec.arg("--base-path").arg(base_path.display().to_string());
        }
        let spec = spec
            .arg("-y")
            .trigger(Trigger::new(Origin::Stdout, ADDITIONAL_PACKS_PROMPT))
            .stdin(format!("{}\n", request.optional_packs.join(", ")));

        let result = self.host.run_parsed(spec, self.patterns()).await?;
        self.host.clear_cache();

        let outcome = self.outcome(&result);
        let progress = self.host.progress_snapshot(&id).unwrap_or_default();
        self.host.forget_progress(&id);
        tracing::info!(
            invocation = %id,
            kind = request.kind.verb(),
            completed = outcome.is_completed(),
            percentage = progress.percentage,
            "install operation finished"
        );
        Ok(InstallReport {
            outcome,
            progress,
            result,
        })
    }

    pub async fn cancel_install(&self, app_name: &str) -> CancelOutcome {
        self.host.cancel(&Self::install_id(app_name)).await
    }

    pub async fn sign_in(&self, authorization_code: &str) -> AppResult<SignInReport> {
        let spec = self
            .command("auth:sign-in")?
            .args(["auth", "--code", authorization_code]);
        let result = self.host.run_classified(spec, self.patterns()).await?;
        self.host.clear_cache();

        let display_name = LOGGED_IN_RE
            .captures(&result.stderr)
            .or_else(|| LOGGED_IN_RE.captures(&result.stdout))
            .and_then(|caps| caps.get(1))
            .map(|name| name.as_str().to_string());
        let outcome = match (self.outcome(&result), &display_name) {
            (OperationOutcome::Completed, None) => OperationOutcome::Failed {
                message: "sign-in finished without confirming an account".to_string(),
                exit_code: result.exit_code(),
            },
            (outcome, _) => outcome,
        };
        Ok(SignInReport {
            outcome,
            display_name,
        })
    }

    pub async fn sign_out(&self) -> AppResult<OperationOutcome> {
        let spec = self.command("auth:sign-out")?.args(["auth", "--delete"]);
        let result = self.host.run_classified(spec, self.patterns()).await?;
        self.host.clear_cache();
        Ok(self.outcome(&result))
    }

    /// Cached; a hit is returned at once while the status is re-read in the background.
    pub async fn account(&self) -> AppResult<AccountStatus> {
        let spec = self.command("status")?.args(["status", "--json"]);
        let result = self.host.cached_or_run(&spec.fingerprint(), spec).await?;
        require_success(&result)?;
        Ok(serde_json::from_str(result.stdout.trim())?)
    }

    pub async fn installed_games(&self) -> AppResult<Vec<InstalledGame>> {
        let spec = self
            .command("list-installed")?
            .args(["list-installed", "--json"]);
        let result = self.host.cached_or_run(&spec.fingerprint(), spec).await?;
        require_success(&result)?;
        Ok(serde_json::from_str(result.stdout.trim())?)
    }

    pub async fn launch(&self, request: &LaunchRequest) -> AppResult<LaunchReport> {
        let id = Self::launch_id(&request.app_name);
        let mut spec = self.command(&id)?.args(["launch", request.app_name.as_str()]);
        if let Some(wine) = &request.wine {
            spec = spec.arg("--wine").arg(wine.display().to_string());
        }
        if let Some(prefix) = &request.wine_prefix {
            spec = spec.arg("--wine-prefix").arg(prefix.display().to_string());
        }
        if request.offline {
            spec = spec.arg("--offline");
        }
        let spec = spec.args(request.extra_args.iter().cloned());

        let result = self.host.run_classified(spec, self.patterns()).await?;
        Ok(LaunchReport {
            outcome: self.outcome(&result),
            result,
        })
    }

    pub async fn uninstall(&self, app_name: &str) -> AppResult<OperationOutcome> {
        let spec = self
            .command(&Self::uninstall_id(app_name))?
            .args(["uninstall", app_name, "-y"]);
        let result = self.host.run_classified(spec, self.patterns()).await?;
        self.host.clear_cache();
        Ok(self.outcome(&result))
    }

    pub async fn version(&self) -> AppResult<String> {
        let spec = self.command("legendary:version")?.arg("--version");
        detect_version(&self.host, spec).await
    }

    pub async fn ensure_supported(&self) -> AppResult<String> {
        let version = self.version().await?;
        ensure_minimum(self.tool(), &version, MINIMUM_VERSION)?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::{AccountStatus, InstallKind, InstalledGame, LegendaryAdapter, LOGGED_IN_RE};

    #[test]
    fn account_status_parses_cli_json() {
        let raw = r#"{"account": "Tester", "games_available": 3, "games_installed": 1,
                      "egl_sync_enabled": false, "config_directory": "/home/u/.config/legendary"}"#;
        let status: AccountStatus = serde_json::from_str(raw).expect("status json");
        assert!(status.is_signed_in());
        assert_eq!(status.games_available, 3);

        let anonymous: AccountStatus =
            serde_json::from_str(r#"{"account": "<not logged in>"}"#).expect("status json");
        assert!(!anonymous.is_signed_in());
    }

    #[test]
    fn installed_games_tolerate_missing_fields() {
        let games: Vec<InstalledGame> =
            serde_json::from_str(r#"[{"app_name": "Fortnite", "title": "Fortnite"}]"#).expect("list json");
        assert_eq!(games[0].app_name, "Fortnite");
        assert!(!games[0].is_dlc);
    }

    #[test]
    fn ids_and_verbs_are_deterministic() {
        assert_eq!(LegendaryAdapter::install_id("X"), "install:X");
        assert_eq!(LegendaryAdapter::launch_id("X"), "launch:X");
        assert_eq!(InstallKind::Repair.verb(), "repair");
    }

    #[test]
    fn login_confirmation_captures_display_name() {
        let caps = LOGGED_IN_RE
            .captures(r#"[cli] INFO: Successfully logged in as "Tester""#)
            .expect("match");
        assert_eq!(&caps[1], "Tester");
    }
}
