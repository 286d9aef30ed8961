use super::compatibility::detect_version;
use super::{Adapter, LaunchReport, OperationOutcome};
use crate::errors::{AppError, AppResult};
use crate::harness::protocol::PatternSet;
use crate::models::{CommandResult, CommandSpec};
use crate::orchestrator::Orchestrator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WineLaunchRequest {
    pub prefix: PathBuf,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl WineLaunchRequest {
    pub fn new(prefix: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            executable: executable.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

/// Drives the compatibility layer inside one prefix at a time.
#[derive(Debug, Clone)]
pub struct WineAdapter {
    host: Orchestrator,
    patterns: Arc<PatternSet>,
}

impl Adapter for WineAdapter {
    fn tool(&self) -> &'static str {
        "wine"
    }

    fn patterns(&self) -> Arc<PatternSet> {
        self.patterns.clone()
    }

    fn host(&self) -> &Orchestrator {
        &self.host
    }
}

impl WineAdapter {
    pub fn new(host: Orchestrator) -> Self {
        Self {
            host,
            patterns: Arc::new(PatternSet::engine()),
        }
    }

    pub fn boot_id(prefix: &Path) -> String {
        format!("wineboot:{}", prefix.display())
    }

    pub fn launch_id(executable: &Path) -> String {
        let name = executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.display().to_string());
        format!("wine-launch:{}", name)
    }

    fn command(&self, id: &str, argv: &[String], prefix: &Path) -> AppResult<CommandSpec> {
        let spec = CommandSpec::from_argv(id, argv)
            .ok_or_else(|| AppError::Config("wine command must name a program".to_string()))?;
        Ok(spec
            .env("WINEPREFIX", prefix.display().to_string())
            .env("WINEDEBUG", self.host.settings().wine_debug.clone()))
    }

    fn wine(&self, id: &str, prefix: &Path) -> AppResult<CommandSpec> {
        self.command(id, &self.host.settings().wine_command, prefix)
    }

    /// Creates or updates the prefix. Wine creates the directory itself.
    pub async fn boot_prefix(&self, prefix: &Path) -> AppResult<OperationOutcome> {
        let spec = self
            .wine(&Self::boot_id(prefix), prefix)?
            .args(["wineboot", "--init"]);
        let result = self.host.run_classified(spec, self.patterns()).await?;
        Ok(self.outcome(&result))
    }

    pub async fn run(&self, id: &str, prefix: &Path, args: &[String]) -> AppResult<CommandResult> {
        let spec = self.wine(id, prefix)?.args(args.iter().cloned());
        self.host.run_classified(spec, self.patterns()).await
    }

    pub async fn launch(&self, request: &WineLaunchRequest) -> AppResult<LaunchReport> {
        let mut spec = self
            .wine(&Self::launch_id(&request.executable), &request.prefix)?
            .arg(request.executable.display().to_string())
            .args(request.args.iter().cloned())
            .envs(&request.env);
        if let Some(cwd) = &request.cwd {
            spec = spec.cwd(cwd);
        }
        let result = self.host.run_classified(spec, self.patterns()).await?;
        Ok(LaunchReport {
            outcome: self.outcome(&result),
            result,
        })
    }

    /// Stops every process of the prefix through `wineserver -k`.
    pub async fn kill_prefix(&self, prefix: &Path) -> AppResult<OperationOutcome> {
        let id = format!("wineserver-kill:{}", prefix.display());
        let argv = self.host.settings().wineserver_command.clone();
        let spec = self.command(&id, &argv, prefix)?.arg("-k");
        let result = self.host.run(spec).await?;
        Ok(self.outcome(&result))
    }

    pub async fn version(&self) -> AppResult<String> {
        let argv = self.host.settings().wine_command.clone();
        let spec = CommandSpec::from_argv("wine:version", &argv)
            .ok_or_else(|| AppError::Config("wine command must name a program".to_string()))?
            .arg("--version");
        detect_version(&self.host, spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::WineAdapter;
    use std::path::Path;

    #[test]
    fn launch_id_uses_executable_name() {
        assert_eq!(
            WineAdapter::launch_id(Path::new("/games/X/Binaries/Game.exe")),
            "wine-launch:Game.exe"
        );
        assert_eq!(WineAdapter::boot_id(Path::new("/p")), "wineboot:/p");
    }
}
