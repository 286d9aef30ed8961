use crate::harness::line_buffer::LineBuffer;
use crate::harness::progress::{ProgressTracker, ProgressUpdate};
use crate::models::{Origin, OutputChunk};
use crate::redaction::Redactor;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::sync::Arc;

static ANSI_ESCAPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex")
});

static OVERALL_PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Progress: (\d+(?:\.\d+)?)% \((\d+)/(\d+)\), Running for (\d+:\d{2}:\d{2}), ETA: (\d+:\d{2}:\d{2})",
    )
    .expect("valid progress regex")
});

static VOLUME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Downloaded: (\d+(?:\.\d+)?) ([KMGT]?i?B), Written: (\d+(?:\.\d+)?) ([KMGT]?i?B)")
        .expect("valid volume regex")
});

static CACHE_USAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Cache usage: (\d+(?:\.\d+)?) ([KMGT]?i?B), active tasks: (\d+)")
        .expect("valid cache usage regex")
});

static DOWNLOAD_SPEED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\+ Download\s+- (\d+(?:\.\d+)?) ([KMGT]?i?B)/s \(raw\) / (\d+(?:\.\d+)?) ([KMGT]?i?B)/s \(decompressed\)",
    )
    .expect("valid download speed regex")
});

static DISK_SPEED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\+ Disk\s+- (\d+(?:\.\d+)?) ([KMGT]?i?B)/s \(write\) / (\d+(?:\.\d+)?) ([KMGT]?i?B)/s \(read\)",
    )
    .expect("valid disk speed regex")
});

static DOWNLOAD_FINISHED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)download manager (?:finished|quitting)").expect("valid sentinel regex")
});

static STOREFRONT_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:ERROR|CRITICAL): (.+)").expect("valid error regex")
});

static WINE_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"wine: ((?:cannot find|could not load|could not exec|failed to|unhandled exception).*)")
        .expect("valid wine error regex")
});

const MAX_PENDING_LINE_BYTES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    OverallProgress,
    Volume,
    CacheUsage,
    DownloadSpeed,
    DiskSpeed,
    DownloadFinished,
    TerminalError,
}

#[derive(Debug, Clone)]
pub struct LineMatcher {
    kind: MatcherKind,
    pattern: Regex,
}

impl LineMatcher {
    pub fn new(kind: MatcherKind, pattern: Regex) -> Self {
        Self { kind, pattern }
    }

    pub fn kind(&self) -> MatcherKind {
        self.kind
    }

    fn event(&self, line: &str) -> Option<Option<LineEvent>> {
        let caps = self.pattern.captures(line)?;
        Some(self.build_event(&caps))
    }

    fn build_event(&self, caps: &Captures<'_>) -> Option<LineEvent> {
        let update = match self.kind {
            MatcherKind::OverallProgress => ProgressUpdate::Overall {
                percentage: number(caps, 1)?,
                downloaded_objects: number(caps, 2)?,
                total_objects: number(caps, 3)?,
                runtime: text(caps, 4)?,
                eta: text(caps, 5)?,
            },
            MatcherKind::Volume => ProgressUpdate::Volume {
                downloaded_mib: mebibytes(caps, 1, 2)?,
                written_mib: mebibytes(caps, 3, 4)?,
            },
            MatcherKind::CacheUsage => ProgressUpdate::Cache {
                usage_mib: mebibytes(caps, 1, 2)?,
                active_tasks: number(caps, 3)?,
            },
            MatcherKind::DownloadSpeed => ProgressUpdate::Download {
                raw_mibps: mebibytes(caps, 1, 2)?,
                decompressed_mibps: mebibytes(caps, 3, 4)?,
            },
            MatcherKind::DiskSpeed => ProgressUpdate::Disk {
                write_mibps: mebibytes(caps, 1, 2)?,
                read_mibps: mebibytes(caps, 3, 4)?,
            },
            MatcherKind::DownloadFinished => return Some(LineEvent::DownloadFinished),
            MatcherKind::TerminalError => {
                let message = text(caps, 1)?;
                let message = message.trim();
                if message.is_empty() {
                    return None;
                }
                return Some(LineEvent::TerminalError(message.to_string()));
            }
        };
        Some(LineEvent::Progress(update))
    }
}

fn text(caps: &Captures<'_>, index: usize) -> Option<String> {
    caps.get(index).map(|m| m.as_str().to_string())
}

fn number<T: std::str::FromStr>(caps: &Captures<'_>, index: usize) -> Option<T> {
    caps.get(index)?.as_str().parse().ok()
}

fn mebibytes(caps: &Captures<'_>, value: usize, unit: usize) -> Option<f64> {
    let value: f64 = number(caps, value)?;
    let factor = match caps.get(unit)?.as_str() {
        "B" => 1.0 / (1024.0 * 1024.0),
        "KiB" | "KB" => 1.0 / 1024.0,
        "MiB" | "MB" => 1.0,
        "GiB" | "GB" => 1024.0,
        "TiB" | "TB" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * factor)
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Progress(ProgressUpdate),
    DownloadFinished,
    TerminalError(String),
}

/// Ordered classification rules for one tool's output.
#[derive(Debug, Clone)]
pub struct PatternSet {
    name: &'static str,
    severity_tokens: Vec<(String, Severity)>,
    matchers: Vec<LineMatcher>,
    default_severity: Severity,
}

impl PatternSet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            severity_tokens: [
                ("DEBUG:", Severity::Debug),
                ("INFO:", Severity::Info),
                ("WARNING:", Severity::Warning),
                ("ERROR:", Severity::Error),
                ("CRITICAL:", Severity::Critical),
            ]
            .into_iter()
            .map(|(token, severity)| (token.to_string(), severity))
            .collect(),
            matchers: Vec::new(),
            default_severity: Severity::Debug,
        }
    }

    /// Storefront download client: five progress shapes, the download
    /// manager sentinel, then `ERROR:`/`CRITICAL:` terminal errors.
    pub fn storefront() -> Self {
        Self::new("storefront")
            .with_matcher(LineMatcher::new(MatcherKind::OverallProgress, OVERALL_PROGRESS_RE.clone()))
            .with_matcher(LineMatcher::new(MatcherKind::Volume, VOLUME_RE.clone()))
            .with_matcher(LineMatcher::new(MatcherKind::CacheUsage, CACHE_USAGE_RE.clone()))
            .with_matcher(LineMatcher::new(MatcherKind::DownloadSpeed, DOWNLOAD_SPEED_RE.clone()))
            .with_matcher(LineMatcher::new(MatcherKind::DiskSpeed, DISK_SPEED_RE.clone()))
            .with_matcher(LineMatcher::new(MatcherKind::DownloadFinished, DOWNLOAD_FINISHED_RE.clone()))
            .with_matcher(LineMatcher::new(MatcherKind::TerminalError, STOREFRONT_ERROR_RE.clone()))
    }

    /// Compatibility layer: Wine debug channels are log-only.
    pub fn engine() -> Self {
        Self::new("engine")
            .with_severity_tokens(&[
                ("trace:", Severity::Debug),
                ("fixme:", Severity::Debug),
                ("warn:", Severity::Warning),
                ("err:", Severity::Warning),
            ])
            .with_matcher(LineMatcher::new(MatcherKind::TerminalError, WINE_ERROR_RE.clone()))
    }

    /// Appends tokens after the defaults; earlier tokens keep priority.
    pub fn with_severity_tokens(mut self, tokens: &[(&str, Severity)]) -> Self {
        self.severity_tokens
            .extend(tokens.iter().map(|(token, severity)| (token.to_string(), *severity)));
        self
    }

    pub fn with_matcher(mut self, matcher: LineMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_default_severity(mut self, severity: Severity) -> Self {
        self.default_severity = severity;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matcher_kinds(&self) -> Vec<MatcherKind> {
        self.matchers.iter().map(LineMatcher::kind).collect()
    }

    pub fn severity_of(&self, line: &str) -> Severity {
        self.severity_tokens
            .iter()
            .find(|(token, _)| line.contains(token.as_str()))
            .map(|(_, severity)| *severity)
            .unwrap_or(self.default_severity)
    }

    /// First matching rule decides; a rule whose captures fail to parse
    /// still consumes the line.
    pub fn classify(&self, line: &str) -> Option<LineEvent> {
        self.matchers
            .iter()
            .find_map(|matcher| matcher.event(line))
            .flatten()
    }
}

pub fn strip_terminal_codes(value: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(value, "").into_owned()
}

/// Turns one invocation's decoded chunks into progress updates, log records
/// and at most one terminal error.
pub struct LineProtocolParser {
    invocation: String,
    patterns: Arc<PatternSet>,
    stdout_lines: LineBuffer,
    stderr_lines: LineBuffer,
    progress: Option<ProgressTracker>,
    redactor: Redactor,
    terminal_error: Option<String>,
    download_finished: bool,
    line_count: u64,
}

impl LineProtocolParser {
    pub fn new(invocation: impl Into<String>, patterns: Arc<PatternSet>) -> Self {
        Self {
            invocation: invocation.into(),
            patterns,
            stdout_lines: LineBuffer::new(Some(MAX_PENDING_LINE_BYTES)),
            stderr_lines: LineBuffer::new(Some(MAX_PENDING_LINE_BYTES)),
            progress: None,
            redactor: Redactor::default(),
            terminal_error: None,
            download_finished: false,
            line_count: 0,
        }
    }

    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.progress = Some(tracker);
        self
    }

    pub fn progress(&self) -> Option<&ProgressTracker> {
        self.progress.as_ref()
    }

    pub fn consume(&mut self, chunk: &OutputChunk) -> Vec<LineEvent> {
        let buffer = match chunk.origin {
            Origin::Stdout => &mut self.stdout_lines,
            Origin::Stderr => &mut self.stderr_lines,
        };
        let lines = buffer.push(&chunk.text);
        let dropped = buffer.take_dropped_bytes();
        if dropped > 0 {
            tracing::warn!(
                invocation = %self.invocation,
                stream = chunk.origin.as_str(),
                bytes = dropped,
                "unterminated line exceeded buffer, oldest bytes dropped"
            );
        }
        lines
            .into_iter()
            .filter_map(|line| self.handle_line(chunk.origin, &line))
            .collect()
    }

    /// Classifies whatever unterminated text is left once both streams ended.
    pub fn finish(&mut self) -> Vec<LineEvent> {
        let mut events = Vec::new();
        for origin in [Origin::Stdout, Origin::Stderr] {
            let leftover = match origin {
                Origin::Stdout => self.stdout_lines.flush(),
                Origin::Stderr => self.stderr_lines.flush(),
            };
            if let Some(line) = leftover {
                events.extend(self.handle_line(origin, &line));
            }
        }
        events
    }

    pub fn handle_line(&mut self, origin: Origin, raw: &str) -> Option<LineEvent> {
        let line = strip_terminal_codes(raw);
        if line.trim().is_empty() {
            return None;
        }
        self.line_count = self.line_count.saturating_add(1);
        self.route_log(origin, &line);

        let event = self.patterns.classify(&line)?;
        match &event {
            LineEvent::Progress(update) => {
                if let Some(tracker) = &self.progress {
                    tracker.apply(update);
                }
            }
            LineEvent::DownloadFinished => {
                self.download_finished = true;
                if let Some(tracker) = &self.progress {
                    tracker.set_in_progress(false);
                }
            }
            LineEvent::TerminalError(message) => {
                if self.terminal_error.is_none() {
                    self.terminal_error = Some(message.clone());
                } else {
                    tracing::debug!(
                        invocation = %self.invocation,
                        message = %message,
                        "ignoring later terminal error"
                    );
                }
            }
        }
        Some(event)
    }

    pub fn terminal_error(&self) -> Option<&str> {
        self.terminal_error.as_deref()
    }

    pub fn take_terminal_error(&mut self) -> Option<String> {
        self.terminal_error.take()
    }

    pub fn download_finished(&self) -> bool {
        self.download_finished
    }

    pub fn line_count(&self) -> u64 {
        self.line_count
    }

    fn route_log(&self, origin: Origin, line: &str) {
        let severity = self.patterns.severity_of(line);
        let line = self.redactor.redact(line).content;
        let invocation = self.invocation.as_str();
        let tool = self.patterns.name();
        let stream = origin.as_str();
        let critical = severity == Severity::Critical;
        match severity {
            Severity::Debug => {
                tracing::debug!(target: "tool_output", invocation, tool, stream, "{}", line)
            }
            Severity::Info => {
                tracing::info!(target: "tool_output", invocation, tool, stream, "{}", line)
            }
            Severity::Warning => {
                tracing::warn!(target: "tool_output", invocation, tool, stream, "{}", line)
            }
            Severity::Error | Severity::Critical => tracing::error!(
                target: "tool_output",
                invocation,
                tool,
                stream,
                critical,
                "{}",
                line
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LineEvent, LineProtocolParser, MatcherKind, PatternSet, Severity};
    use crate::harness::progress::{ProgressTracker, ProgressUpdate};
    use crate::models::{Origin, OutputChunk};
    use std::sync::Arc;

    fn chunk(origin: Origin, text: &str) -> OutputChunk {
        OutputChunk {
            origin,
            text: text.to_string(),
        }
    }

    fn storefront_parser() -> LineProtocolParser {
        LineProtocolParser::new("install:X", Arc::new(PatternSet::storefront()))
            .with_progress(ProgressTracker::new())
    }

    #[test]
    fn storefront_matchers_keep_priority_order() {
        assert_eq!(
            PatternSet::storefront().matcher_kinds(),
            vec![
                MatcherKind::OverallProgress,
                MatcherKind::Volume,
                MatcherKind::CacheUsage,
                MatcherKind::DownloadSpeed,
                MatcherKind::DiskSpeed,
                MatcherKind::DownloadFinished,
                MatcherKind::TerminalError,
            ]
        );
    }

    #[test]
    fn parses_overall_progress_line() {
        let patterns = PatternSet::storefront();
        let event = patterns.classify(
            "[DLManager] INFO: = Progress: 10.0% (1/10), Running for 0:00:01, ETA: 0:00:09",
        );
        assert_eq!(
            event,
            Some(LineEvent::Progress(ProgressUpdate::Overall {
                percentage: 10.0,
                downloaded_objects: 1,
                total_objects: 10,
                runtime: "0:00:01".to_string(),
                eta: "0:00:09".to_string(),
            }))
        );
    }

    #[test]
    fn parses_volume_cache_and_throughput_lines() {
        let patterns = PatternSet::storefront();
        assert_eq!(
            patterns.classify("[DLManager] INFO:  - Downloaded: 1.50 GiB, Written: 512.00 MiB"),
            Some(LineEvent::Progress(ProgressUpdate::Volume {
                downloaded_mib: 1536.0,
                written_mib: 512.0,
            }))
        );
        assert_eq!(
            patterns.classify("[DLManager] INFO:  - Cache usage: 120.00 MiB, active tasks: 16"),
            Some(LineEvent::Progress(ProgressUpdate::Cache {
                usage_mib: 120.0,
                active_tasks: 16,
            }))
        );
        assert_eq!(
            patterns.classify(
                "[DLManager] INFO:  + Download\t- 10.00 MiB/s (raw) / 20.00 MiB/s (decompressed)"
            ),
            Some(LineEvent::Progress(ProgressUpdate::Download {
                raw_mibps: 10.0,
                decompressed_mibps: 20.0,
            }))
        );
        assert_eq!(
            patterns.classify("[DLManager] INFO:  + Disk\t- 30.00 MiB/s (write) / 512.00 KiB/s (read)"),
            Some(LineEvent::Progress(ProgressUpdate::Disk {
                write_mibps: 30.0,
                read_mibps: 0.5,
            }))
        );
    }

    #[test]
    fn severity_tokens_route_in_priority_order() {
        let patterns = PatternSet::storefront();
        assert_eq!(patterns.severity_of("[cli] DEBUG: x"), Severity::Debug);
        assert_eq!(patterns.severity_of("[cli] WARNING: low disk"), Severity::Warning);
        assert_eq!(patterns.severity_of("[cli] CRITICAL: boom"), Severity::Critical);
        assert_eq!(patterns.severity_of("plain text"), Severity::Debug);
        assert_eq!(patterns.severity_of("INFO: retry after ERROR: x"), Severity::Info);
    }

    #[test]
    fn first_terminal_error_wins() {
        let mut parser = storefront_parser();
        parser.consume(&chunk(Origin::Stderr, "ERROR: A\nCRITICAL: B\n"));
        assert_eq!(parser.terminal_error(), Some("A"));
        assert_eq!(parser.take_terminal_error().as_deref(), Some("A"));
    }

    #[test]
    fn log_lines_never_become_errors() {
        let mut parser = storefront_parser();
        let events = parser.consume(&chunk(
            Origin::Stderr,
            "[cli] INFO: Preparing download\n[cli] WARNING: slow mirror\n[cli] DEBUG: x\n",
        ));
        assert!(events.is_empty());
        assert_eq!(parser.terminal_error(), None);
        assert_eq!(parser.line_count(), 3);
    }

    #[test]
    fn progress_updates_only_their_fields() {
        let mut parser = storefront_parser();
        parser.consume(&chunk(
            Origin::Stderr,
            "Progress: 10.0% (1/10), Running for 0:00:01, ETA: 0:00:09\n",
        ));
        parser.consume(&chunk(Origin::Stderr, " + Disk\t- 2.00 MiB/s (write) / 1.00 MiB/s (read)\n"));
        let status = parser.progress().map(ProgressTracker::snapshot).expect("tracker");
        assert_eq!(status.percentage, 10.0);
        assert_eq!(status.total_objects, 10);
        assert_eq!(status.eta, "0:00:09");
        assert_eq!(status.disk_write_mibps, 2.0);
        assert_eq!(status.download_raw_mibps, 0.0);
    }

    #[test]
    fn sentinel_clears_in_progress() {
        let mut parser = storefront_parser();
        if let Some(tracker) = parser.progress() {
            tracker.set_in_progress(true);
        }
        let events = parser.consume(&chunk(
            Origin::Stderr,
            "[DLManager] INFO: All done! Download manager quitting...\n",
        ));
        assert_eq!(events, vec![LineEvent::DownloadFinished]);
        assert!(parser.download_finished());
        assert!(!parser.progress().map(|t| t.snapshot().in_progress).unwrap_or(true));

        let mut literal = storefront_parser();
        literal.consume(&chunk(Origin::Stdout, "download manager finished\n"));
        assert!(literal.download_finished());
    }

    #[test]
    fn lines_split_across_chunks_and_ansi_codes_are_handled() {
        let mut parser = storefront_parser();
        assert!(parser.consume(&chunk(Origin::Stderr, "\x1b[32mERROR: disk")).is_empty());
        parser.consume(&chunk(Origin::Stdout, "unrelated stdout\n"));
        let events = parser.consume(&chunk(Origin::Stderr, " full\x1b[0m\n"));
        assert_eq!(events, vec![LineEvent::TerminalError("disk full".to_string())]);
    }

    #[test]
    fn finish_classifies_unterminated_tail() {
        let mut parser = storefront_parser();
        parser.consume(&chunk(Origin::Stderr, "CRITICAL: no newline"));
        assert_eq!(parser.terminal_error(), None);
        let events = parser.finish();
        assert_eq!(events, vec![LineEvent::TerminalError("no newline".to_string())]);
    }

    #[test]
    fn engine_channels_are_log_only() {
        let patterns = PatternSet::engine();
        assert_eq!(patterns.severity_of("0024:err:module:import_dll Library d3d11.dll not found"), Severity::Warning);
        assert_eq!(patterns.severity_of("0024:fixme:ntdll:stub"), Severity::Debug);
        assert_eq!(patterns.classify("0024:err:module:import_dll Library d3d11.dll not found"), None);
        assert_eq!(patterns.classify("wine: created the configuration directory '/p'"), None);
        assert_eq!(
            patterns.classify("wine: cannot find L\"C:\\\\missing.exe\""),
            Some(LineEvent::TerminalError("cannot find L\"C:\\\\missing.exe\"".to_string()))
        );
    }
}
