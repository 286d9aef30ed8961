use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Stdout,
    Stderr,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Watches one output stream for `match_text` and answers it once with the
/// command's input payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub origin: Origin,
    pub match_text: String,
}

impl Trigger {
    pub fn new(origin: Origin, match_text: impl Into<String>) -> Self {
        Self {
            origin,
            match_text: match_text.into(),
        }
    }
}

/// Everything needed to start one invocation. Immutable once handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub id: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub trigger: Option<Trigger>,
}

impl CommandSpec {
    pub fn new(id: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            stdin: None,
            trigger: None,
        }
    }

    /// Builds a spec from an argv prefix such as `["python3", "-m", "legendary"]`.
    pub fn from_argv(id: impl Into<String>, argv: &[String]) -> Option<Self> {
        let (program, prefix) = argv.split_first()?;
        Some(Self::new(id, program.clone()).args(prefix.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, overlay: &BTreeMap<String, String>) -> Self {
        for (key, value) in overlay {
            self.env.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn fingerprint(&self) -> String {
        crate::cache::fingerprint(&self.args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    pub origin: Origin,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    Cancelled,
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub id: String,
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExitOutcome,
    pub protocol_error: Option<String>,
    pub duration_ms: u64,
}

impl CommandResult {
    pub const CANCELLED_EXIT_CODE: i32 = -1;
    pub const UNKNOWN_EXIT_CODE: i32 = -2;

    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(signal) => 128 + signal,
            ExitOutcome::Cancelled => Self::CANCELLED_EXIT_CODE,
            ExitOutcome::Unknown => Self::UNKNOWN_EXIT_CODE,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.outcome == ExitOutcome::Cancelled
    }

    pub fn success(&self) -> bool {
        self.outcome == ExitOutcome::Exited(0)
    }

    /// Runs that printed nothing at all are treated as incomplete.
    pub fn is_cacheable(&self) -> bool {
        !(self.stdout.is_empty() && self.stderr.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl InvocationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStatus {
    pub in_progress: bool,
    pub percentage: f64,
    pub downloaded_objects: u64,
    pub total_objects: u64,
    pub runtime: String,
    pub eta: String,
    pub downloaded_mib: f64,
    pub written_mib: f64,
    pub cache_usage_mib: f64,
    pub active_tasks: u64,
    pub download_raw_mibps: f64,
    pub download_decompressed_mibps: f64,
    pub disk_write_mibps: f64,
    pub disk_read_mibps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    pub legendary_command: Vec<String>,
    pub legendary_config_dir: Option<PathBuf>,
    pub wine_command: Vec<String>,
    pub wineserver_command: Vec<String>,
    pub wine_debug: String,
    pub terminate_grace_ms: u64,
    pub kill_wait_ms: u64,
    pub reader_drain_timeout_ms: u64,
    pub pending_cancel_ttl_secs: u64,
    pub max_captured_bytes: usize,
    pub chunk_channel_capacity: usize,
    pub version_probe_timeout_ms: u64,
    pub log_level: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            legendary_command: vec!["legendary".to_string()],
            legendary_config_dir: None,
            wine_command: vec!["wine".to_string()],
            wineserver_command: vec!["wineserver".to_string()],
            wine_debug: "-all".to_string(),
            terminate_grace_ms: 1_500,
            kill_wait_ms: 2_000,
            reader_drain_timeout_ms: 5_000,
            pending_cancel_ttl_secs: 60,
            max_captured_bytes: 16 * 1024 * 1024,
            chunk_channel_capacity: 256,
            version_probe_timeout_ms: 3_000,
            log_level: "info".to_string(),
        }
    }
}
