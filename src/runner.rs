use crate::errors::{AppError, AppResult};
use crate::harness::cli_missing::{cli_missing_message, is_cli_missing_line};
use crate::models::{
    CommandResult, CommandSpec, ExitOutcome, InvocationState, OutputChunk, RunnerSettings,
};
use crate::multiplexer::{InputPlan, ReaderSet, StdinSlot, StreamMultiplexer};
use crate::redaction::Redactor;
use crate::registry::{CommandRegistry, InvocationHandle, Registration};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};

/// Timing and buffering knobs taken from [`RunnerSettings`].
#[derive(Debug, Clone, Copy)]
pub struct RunnerLimits {
    pub terminate_grace: Duration,
    pub kill_wait: Duration,
    pub reader_drain: Duration,
    pub max_captured_bytes: usize,
    pub chunk_channel_capacity: usize,
}

impl From<&RunnerSettings> for RunnerLimits {
    fn from(settings: &RunnerSettings) -> Self {
        Self {
            terminate_grace: Duration::from_millis(settings.terminate_grace_ms),
            kill_wait: Duration::from_millis(settings.kill_wait_ms),
            reader_drain: Duration::from_millis(settings.reader_drain_timeout_ms),
            max_captured_bytes: settings.max_captured_bytes.max(1),
            chunk_channel_capacity: settings.chunk_channel_capacity.max(1),
        }
    }
}

impl Default for RunnerLimits {
    fn default() -> Self {
        Self::from(&RunnerSettings::default())
    }
}

/// Live output of one invocation, ending in its [`CommandResult`].
///
/// Dropping the stream (or calling [`ChunkStream::finish`] early) never stops
/// the child or its readers; only cancellation does.
pub struct ChunkStream {
    receiver: mpsc::Receiver<OutputChunk>,
    completion: JoinHandle<CommandResult>,
    handle: InvocationHandle,
}

impl ChunkStream {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> &InvocationHandle {
        &self.handle
    }

    pub fn state(&self) -> InvocationState {
        self.handle.state()
    }

    pub async fn next(&mut self) -> Option<OutputChunk> {
        self.receiver.recv().await
    }

    /// Asks the supervisor to terminate the child. Registry bookkeeping is
    /// handled by the supervisor when it settles.
    pub fn cancel(&self) -> bool {
        self.handle.request_cancel()
    }

    pub async fn finish(self) -> AppResult<CommandResult> {
        drop(self.receiver);
        Ok(self.completion.await?)
    }
}

struct Launched {
    handle: InvocationHandle,
    completion: JoinHandle<CommandResult>,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    registry: CommandRegistry,
    limits: RunnerLimits,
    redactor: Redactor,
}

impl ProcessRunner {
    pub fn new(registry: CommandRegistry, limits: RunnerLimits) -> Self {
        Self {
            registry,
            limits,
            redactor: Redactor::default(),
        }
    }

    pub fn from_settings(registry: CommandRegistry, settings: &RunnerSettings) -> Self {
        Self::new(registry, RunnerLimits::from(settings))
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn limits(&self) -> RunnerLimits {
        self.limits
    }

    /// Runs `spec` to completion. Child exit codes are data in the result;
    /// only spawn failures and id conflicts are errors.
    pub async fn run(&self, spec: CommandSpec) -> AppResult<CommandResult> {
        let launched = self.launch(spec, None).await?;
        Ok(launched.completion.await?)
    }

    pub async fn stream(&self, spec: CommandSpec) -> AppResult<ChunkStream> {
        let (sender, receiver) = mpsc::channel(self.limits.chunk_channel_capacity);
        let launched = self.launch(spec, Some(sender)).await?;
        Ok(ChunkStream {
            receiver,
            completion: launched.completion,
            handle: launched.handle,
        })
    }

    async fn launch(
        &self,
        spec: CommandSpec,
        sender: Option<mpsc::Sender<OutputChunk>>,
    ) -> AppResult<Launched> {
        if self.registry.is_active(&spec.id).await {
            return Err(AppError::Registry(format!(
                "invocation id {} is already running",
                spec.id
            )));
        }

        let plan = InputPlan::new(spec.stdin.clone(), spec.trigger.clone());
        let mut command = configure_command(&spec, &plan);
        self.log_command_start(&spec, &plan);

        let started_at = Instant::now();
        let mut child = command.spawn().map_err(|error| spawn_error(&spec, error))?;
        let handle = InvocationHandle::new(spec.id.clone(), child.id());

        match self.registry.register(&handle).await {
            Ok(Registration::Running) => {}
            Ok(Registration::CancelledOnArrival) => {
                tracing::info!(invocation = %spec.id, "invocation cancelled before it started running");
            }
            Err(error) => {
                terminate_then_kill(&mut child, &self.limits).await;
                return Err(error);
            }
        }

        let stdin = StdinSlot::new(child.stdin.take());
        let readers = StreamMultiplexer::new(
            spec.id.clone(),
            sender,
            handle.cancel_signal(),
            self.limits.max_captured_bytes,
        )
        .attach(child.stdout.take(), child.stderr.take(), stdin, plan);

        let completion = tokio::spawn(supervise(
            child,
            handle.clone(),
            readers,
            self.registry.clone(),
            self.limits,
            started_at,
        ));

        Ok(Launched { handle, completion })
    }

    fn log_command_start(&self, spec: &CommandSpec, plan: &InputPlan) {
        let args = self.redactor.redact_args(&spec.args).join(" ");
        let env_keys: Vec<&str> = spec.env.keys().map(String::as_str).collect();
        let stdin = match plan {
            InputPlan::Closed => "closed",
            InputPlan::Eager(_) => "eager",
            InputPlan::OnTrigger { .. } => "trigger",
        };
        tracing::info!(
            invocation = %spec.id,
            program = %spec.program,
            args = %args,
            cwd = ?spec.cwd,
            env = ?env_keys,
            stdin,
            "starting command"
        );
    }
}

fn configure_command(spec: &CommandSpec, plan: &InputPlan) -> Command {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(if plan.needs_pipe() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    #[cfg(unix)]
    command.process_group(0);
    command
}

fn spawn_error(spec: &CommandSpec, error: std::io::Error) -> AppError {
    let mut message = error.to_string();
    if error.kind() == std::io::ErrorKind::NotFound {
        match &spec.cwd {
            Some(cwd) if !cwd.exists() => {
                message = format!("working directory not found: {}", cwd.display());
            }
            _ if is_cli_missing_line(&message) => {
                message = cli_missing_message(&spec.program, &message);
            }
            _ => {}
        }
    }
    tracing::warn!(invocation = %spec.id, program = %spec.program, error = %message, "failed to spawn command");
    AppError::Spawn {
        program: spec.program.clone(),
        message,
    }
}

async fn supervise(
    mut child: Child,
    handle: InvocationHandle,
    readers: ReaderSet,
    registry: CommandRegistry,
    limits: RunnerLimits,
    started_at: Instant,
) -> CommandResult {
    let outcome = tokio::select! {
        biased;
        _ = handle.cancelled() => {
            terminate_then_kill(&mut child, &limits).await;
            ExitOutcome::Cancelled
        }
        status = child.wait() => match status {
            Ok(status) => ExitOutcome::from_status(status),
            Err(error) => {
                tracing::warn!(invocation = %handle.id(), error = %error, "failed to wait for child");
                ExitOutcome::Unknown
            }
        },
    };

    let captured = readers.finish(limits.reader_drain).await;
    registry.release(&handle).await;

    let result = CommandResult {
        id: handle.id().to_string(),
        stdout: captured.stdout,
        stderr: captured.stderr,
        outcome,
        protocol_error: None,
        duration_ms: started_at.elapsed().as_millis() as u64,
    };

    let state = match outcome {
        ExitOutcome::Cancelled => InvocationState::Cancelled,
        ExitOutcome::Exited(0) => InvocationState::Completed,
        _ => InvocationState::Failed,
    };
    handle.set_state(state);

    tracing::info!(
        invocation = %result.id,
        state = state.as_str(),
        exit_code = result.exit_code(),
        duration_ms = result.duration_ms,
        stdout_bytes = result.stdout.len(),
        stderr_bytes = result.stderr.len(),
        "command finished"
    );
    result
}

/// SIGTERM to the child's process group, then a hard kill after the grace period.
async fn terminate_then_kill(child: &mut Child, limits: &RunnerLimits) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            if let Err(error) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %error, "SIGTERM to process group failed");
            }
        }
    }

    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .spawn();
        }
    }

    if timeout(limits.terminate_grace, child.wait()).await.is_ok() {
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    let _ = child.start_kill();
    if timeout(limits.kill_wait, child.wait()).await.is_err() {
        tracing::warn!(pid = ?child.id(), "child still running after kill");
    }
}
