use crate::cache::ResultCache;
use crate::errors::AppResult;
use crate::harness::progress::ProgressBoard;
use crate::harness::protocol::{LineProtocolParser, PatternSet};
use crate::models::{CommandResult, CommandSpec, ProgressStatus, RunnerSettings};
use crate::registry::{CancelOutcome, CommandRegistry};
use crate::runner::{ChunkStream, ProcessRunner};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Duration;
use uuid::Uuid;

/// Session-scoped owner of the runner, registry, result cache and progress
/// board. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    settings: Arc<RunnerSettings>,
    runner: ProcessRunner,
    cache: ResultCache,
    progress: ProgressBoard,
    refreshing: Arc<Mutex<HashSet<String>>>,
    misses: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Orchestrator {
    pub fn new(settings: RunnerSettings) -> Self {
        let registry =
            CommandRegistry::new(Duration::from_secs(settings.pending_cancel_ttl_secs));
        let runner = ProcessRunner::from_settings(registry, &settings);
        Self {
            settings: Arc::new(settings),
            runner,
            cache: ResultCache::new(),
            progress: ProgressBoard::new(),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            misses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.runner.registry()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub async fn run(&self, spec: CommandSpec) -> AppResult<CommandResult> {
        self.runner.run(spec).await
    }

    pub async fn stream(&self, spec: CommandSpec) -> AppResult<ChunkStream> {
        self.runner.stream(spec).await
    }

    /// Runs `spec` while feeding its output through a [`LineProtocolParser`].
    ///
    /// Progress lands on the board under the invocation id; the first
    /// terminal error line becomes `protocol_error` once the child is gone.
    /// The record is opened only after the id was accepted, so a rejected
    /// duplicate never replaces the record of the running invocation.
    pub async fn run_parsed(
        &self,
        spec: CommandSpec,
        patterns: Arc<PatternSet>,
    ) -> AppResult<CommandResult> {
        let id = spec.id.clone();
        let mut stream = self.runner.stream(spec).await?;

        let tracker = self.progress.open(&id);
        tracker.set_in_progress(true);
        let mut parser = LineProtocolParser::new(id.clone(), patterns).with_progress(tracker);

        while let Some(chunk) = stream.next().await {
            parser.consume(&chunk);
        }
        parser.finish();

        let mut result = stream.finish().await?;
        result.protocol_error = parser.take_terminal_error();
        if let Some(tracker) = parser.progress() {
            tracker.set_in_progress(false);
        }
        if let Some(message) = &result.protocol_error {
            tracing::warn!(invocation = %id, message = %message, "tool reported an error");
        }
        tracing::debug!(invocation = %id, lines = parser.line_count(), "parsed invocation output");
        Ok(result)
    }

    /// [`Orchestrator::run_parsed`] for operations that report no progress;
    /// the board record is dropped once the run is over.
    pub async fn run_classified(
        &self,
        spec: CommandSpec,
        patterns: Arc<PatternSet>,
    ) -> AppResult<CommandResult> {
        let id = spec.id.clone();
        let result = self.run_parsed(spec, patterns).await;
        self.forget_progress(&id);
        result
    }

    pub async fn cancel(&self, id: &str) -> CancelOutcome {
        self.runner.registry().cancel(id).await
    }

    pub async fn stop_all(&self) -> usize {
        self.runner.registry().stop_all().await
    }

    /// Stale-while-revalidate read. A hit returns immediately and starts at
    /// most one background refresh per fingerprint; a miss runs inline and
    /// stores the result only when the command succeeded.
    ///
    /// Concurrent misses for one fingerprint run one at a time; a waiter
    /// takes the result the first one stored instead of running again.
    pub async fn cached_or_run(
        &self,
        fingerprint: &str,
        spec: CommandSpec,
    ) -> AppResult<Arc<CommandResult>> {
        if let Some(cached) = self.cache.get(fingerprint) {
            tracing::debug!(fingerprint, invocation = %spec.id, "cache hit, refreshing in background");
            self.spawn_refresh(fingerprint, spec);
            return Ok(cached);
        }

        let gate = self.miss_gate(fingerprint);
        let _turn = gate.lock().await;
        if let Some(cached) = self.cache.get(fingerprint) {
            tracing::debug!(fingerprint, invocation = %spec.id, "filled by a concurrent miss");
            return Ok(cached);
        }

        let generation = self.cache.generation();
        let result = self.runner.run(spec).await?;
        if result.success() {
            self.cache.put_if_current(fingerprint, result.clone(), generation);
        }
        Ok(Arc::new(result))
    }

    fn miss_gate(&self, fingerprint: &str) -> Arc<AsyncMutex<()>> {
        self.misses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(fingerprint.to_string())
            .or_default()
            .clone()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn is_refreshing(&self, fingerprint: &str) -> bool {
        self.refreshing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }

    pub fn progress(&self, id: &str) -> Option<watch::Receiver<ProgressStatus>> {
        self.progress.subscribe(id)
    }

    pub fn progress_snapshot(&self, id: &str) -> Option<ProgressStatus> {
        self.progress.snapshot(id)
    }

    /// Drops the finished record for `id`; a running invocation keeps its record.
    pub fn forget_progress(&self, id: &str) -> bool {
        self.progress.forget(id)
    }

    fn spawn_refresh(&self, fingerprint: &str, spec: CommandSpec) {
        let inserted = self
            .refreshing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint.to_string());
        if !inserted {
            tracing::trace!(fingerprint, "refresh already in flight");
            return;
        }

        let refresh_id = format!("{}:refresh:{}", spec.id, Uuid::new_v4());
        let spec = spec.with_id(refresh_id);
        let fingerprint = fingerprint.to_string();
        let generation = self.cache.generation();
        let this = self.clone();
        tokio::spawn(async move {
            match this.runner.run(spec).await {
                Ok(result) if result.success() => {
                    this.cache.put_if_current(&fingerprint, result, generation);
                }
                Ok(result) => {
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        exit_code = result.exit_code(),
                        "refresh failed, keeping cached result"
                    );
                }
                Err(error) => {
                    tracing::warn!(fingerprint = %fingerprint, error = %error, "refresh could not start");
                }
            }
            this.refreshing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&fingerprint);
        });
    }
}
