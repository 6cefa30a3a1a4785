//! Subprocess supervision for coding agents.
//!
//! The supervisor owns the child's whole lifecycle: spawn with the
//! autonomous-permissions flag, capture both streams concurrently into one
//! mutex-guarded record with a hard line bound, parse tool events, enforce
//! the read-loop circuit breaker, and kill on timeout or cancellation.
//!
//! Timeout and external cancellation are distinct error outcomes. A
//! non-zero exit is `success = false` but not an error — the caller
//! decides what a failed agent means.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dispatch::events::{emit_best_effort, EventKind, EventSink, ExecutorEvent, Severity};

use crate::agent::events::{parse_plain_line, parse_stream_line, AgentEvent};

/// Sentinel appended exactly once per stream when the line bound is hit.
pub const TRUNCATION_SENTINEL: &str = "[... output truncated: limit reached ...]";

/// Supported coding-agent CLIs.
///
/// Both are launched with their bypass-permission-prompts flag: the
/// executor operates autonomously, and the child is either sandboxed or
/// working on the executor's own codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Claude,
    Amp,
}

impl AgentKind {
    /// Binary to launch. Overridable per kind via `FOREMAN_CLAUDE_BIN` /
    /// `FOREMAN_AMP_BIN` for non-standard installs.
    pub fn program(self) -> String {
        let (var, default) = match self {
            Self::Claude => ("FOREMAN_CLAUDE_BIN", "claude"),
            Self::Amp => ("FOREMAN_AMP_BIN", "amp"),
        };
        std::env::var(var).unwrap_or_else(|_| default.to_string())
    }

    pub fn bypass_flag(self) -> &'static str {
        match self {
            Self::Claude => "--dangerously-skip-permissions",
            Self::Amp => "--dangerously-allow-all",
        }
    }

    pub fn stream_json_flag(self) -> &'static str {
        "--stream-json"
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => f.write_str("claude"),
            Self::Amp => f.write_str("amp"),
        }
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub kind: AgentKind,
    pub workdir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    pub stream_json: bool,
    /// Issue the run is attributed to in stored events.
    pub issue_id: Option<String>,
}

/// Capture bounds and circuit-breaker limits.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    /// Per-stream retained line bound.
    pub max_output_lines: usize,
    /// Total `read` tool invocations before the breaker trips.
    pub max_file_reads: u32,
    /// `read` invocations of a single path before the breaker trips.
    pub max_same_file_reads: u32,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            max_output_lines: 10_000,
            max_file_reads: 500,
            max_same_file_reads: 20,
        }
    }
}

/// What the supervised run produced.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub events: Vec<AgentEvent>,
    pub duration: Duration,
    /// Set when the circuit breaker killed the child.
    pub breaker_reason: Option<String>,
}

/// Supervision failures. Timeout and cancellation both kill the child but
/// are distinguishable to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SuperviseError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Capture {
    stdout: Vec<String>,
    stdout_truncated: bool,
    stderr: Vec<String>,
    stderr_truncated: bool,
    events: Vec<AgentEvent>,
    total_reads: u32,
    reads_per_file: HashMap<String, u32>,
    breaker_reason: Option<String>,
}

/// Supervises agent subprocesses for one executor instance.
pub struct AgentSupervisor {
    instance_id: String,
    limits: CaptureLimits,
    sink: Option<Arc<dyn EventSink>>,
    trace_events: bool,
}

impl AgentSupervisor {
    pub fn new(instance_id: impl Into<String>, limits: CaptureLimits) -> Self {
        Self {
            instance_id: instance_id.into(),
            limits,
            sink: None,
            trace_events: false,
        }
    }

    /// Attach an event sink; tool events are stored asynchronously,
    /// best-effort, so storage never blocks capture.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_trace_events(mut self, trace: bool) -> Self {
        self.trace_events = trace;
        self
    }

    /// Build and supervise the agent command for `request`.
    pub async fn run(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentResult, SuperviseError> {
        let mut cmd = Command::new(request.kind.program());
        cmd.arg(request.kind.bypass_flag());
        if request.stream_json {
            cmd.arg(request.kind.stream_json_flag());
        }
        cmd.arg(&request.prompt);
        cmd.current_dir(&request.workdir);

        self.supervise(
            cmd,
            request.stream_json,
            request.timeout,
            cancel,
            request.issue_id.as_deref(),
        )
        .await
    }

    /// Supervise an already-built command.
    ///
    /// Separate from [`run`](Self::run) so the capture machinery can be
    /// exercised against arbitrary processes.
    pub async fn supervise(
        &self,
        mut cmd: Command,
        stream_json: bool,
        timeout: Duration,
        cancel: &CancellationToken,
        issue_id: Option<&str>,
    ) -> Result<AgentResult, SuperviseError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SuperviseError::Spawn(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SuperviseError::Spawn("stdout pipe missing".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SuperviseError::Spawn("stderr pipe missing".into()))?;

        let capture = Arc::new(Mutex::new(Capture::default()));
        let breaker = CancellationToken::new();

        let stdout_task = self.spawn_reader(
            stdout,
            StreamName::Stdout,
            capture.clone(),
            stream_json,
            breaker.clone(),
            issue_id.map(str::to_string),
        );
        let stderr_task = self.spawn_reader(
            stderr,
            StreamName::Stderr,
            capture.clone(),
            stream_json,
            breaker.clone(),
            issue_id.map(str::to_string),
        );

        enum WaitOutcome {
            Exited(Option<i32>, bool),
            Timeout,
            Cancelled,
            BreakerTripped,
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => WaitOutcome::Exited(status.code(), status.success()),
                Err(e) => {
                    warn!(error = %e, "wait on agent process failed");
                    WaitOutcome::Exited(None, false)
                }
            },
            _ = tokio::time::sleep(timeout) => WaitOutcome::Timeout,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = breaker.cancelled() => WaitOutcome::BreakerTripped,
        };

        if !matches!(outcome, WaitOutcome::Exited(..)) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill agent process");
            }
        }

        // Readers finish at pipe EOF once the child is gone. Orphaned
        // grandchildren can keep the pipe open after a kill, so the join
        // is bounded.
        for task in [stdout_task, stderr_task] {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("output reader still blocked after kill — abandoning it");
                abort.abort();
            }
        }

        let duration = started.elapsed();
        let capture = {
            let mut guard = capture.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        match outcome {
            WaitOutcome::Timeout => Err(SuperviseError::Timeout(timeout)),
            WaitOutcome::Cancelled => Err(SuperviseError::Cancelled),
            WaitOutcome::BreakerTripped => Ok(AgentResult {
                success: false,
                exit_code: None,
                stdout: capture.stdout,
                stderr: capture.stderr,
                events: capture.events,
                duration,
                breaker_reason: capture.breaker_reason,
            }),
            WaitOutcome::Exited(exit_code, success) => Ok(AgentResult {
                success,
                exit_code,
                stdout: capture.stdout,
                stderr: capture.stderr,
                events: capture.events,
                duration,
                breaker_reason: capture.breaker_reason,
            }),
        }
    }

    fn spawn_reader<R>(
        &self,
        stream: R,
        name: StreamName,
        capture: Arc<Mutex<Capture>>,
        stream_json: bool,
        breaker: CancellationToken,
        issue_id: Option<String>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let limits = self.limits;
        let sink = self.sink.clone();
        let instance_id = self.instance_id.clone();
        let trace = self.trace_events;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // Tool events flow on stdout; structured JSON first when
                // requested, regex scraping otherwise.
                let event = if name == StreamName::Stdout {
                    if stream_json {
                        parse_stream_line(&line).or_else(|| parse_plain_line(&line))
                    } else {
                        parse_plain_line(&line)
                    }
                } else {
                    None
                };
                if trace {
                    debug!(stream = ?name, parsed = event.is_some(), line = %line, "agent line");
                }

                let stored_event = {
                    let mut guard = capture.lock().unwrap_or_else(|e| e.into_inner());
                    push_bounded(&mut guard, name, line, limits.max_output_lines);

                    match event {
                        Some(event) if guard.breaker_reason.is_none() => {
                            if event.is_read() {
                                check_breaker(&mut guard, &event, limits, &breaker);
                            }
                            if guard.breaker_reason.is_none() {
                                guard.events.push(event.clone());
                                Some(event)
                            } else {
                                None
                            }
                        }
                        _ => None,
                    }
                };

                // Storage is fire-and-forget so capture never blocks on it.
                if let (Some(event), Some(sink)) = (stored_event, sink.clone()) {
                    let record = ExecutorEvent::new(
                        instance_id.clone(),
                        Severity::Info,
                        EventKind::ToolUse {
                            tool: event.tool,
                            target_file: event.target_file,
                            command: event.command,
                            pattern: event.pattern,
                            description: event.description,
                        },
                    );
                    let record = match &issue_id {
                        Some(id) => record.for_issue(id.clone()),
                        None => record,
                    };
                    tokio::spawn(async move {
                        emit_best_effort(sink.as_ref(), record);
                    });
                }
            }
        })
    }
}

/// Append a line under the shared lock, mirroring it to the executor's own
/// console so display order matches capture order. Beyond the bound the
/// line is dropped; the sentinel is appended exactly once per stream.
fn push_bounded(capture: &mut Capture, name: StreamName, line: String, max_lines: usize) {
    let (buffer, truncated) = match name {
        StreamName::Stdout => (&mut capture.stdout, &mut capture.stdout_truncated),
        StreamName::Stderr => (&mut capture.stderr, &mut capture.stderr_truncated),
    };

    if buffer.len() < max_lines {
        match name {
            StreamName::Stdout => println!("{line}"),
            StreamName::Stderr => eprintln!("{line}"),
        }
        buffer.push(line);
    } else if !*truncated {
        *truncated = true;
        buffer.push(TRUNCATION_SENTINEL.to_string());
    }
}

/// Update read counters and trip the breaker when a bound is crossed.
fn check_breaker(
    capture: &mut Capture,
    event: &AgentEvent,
    limits: CaptureLimits,
    breaker: &CancellationToken,
) {
    capture.total_reads += 1;
    let path = event
        .target_file
        .clone()
        .unwrap_or_else(|| "<unknown>".to_string());
    let per_file = capture.reads_per_file.entry(path.clone()).or_insert(0);
    *per_file += 1;

    let reason = if capture.total_reads > limits.max_file_reads {
        Some(format!(
            "agent stuck in read loop: {} total reads (limit {})",
            capture.total_reads, limits.max_file_reads
        ))
    } else if *per_file > limits.max_same_file_reads {
        Some(format!(
            "agent stuck re-reading {path}: {per_file} reads (limit {})",
            limits.max_same_file_reads
        ))
    } else {
        None
    };

    if let Some(reason) = reason {
        warn!(%reason, "circuit breaker tripped — killing agent");
        capture.breaker_reason = Some(reason);
        breaker.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn supervisor(limits: CaptureLimits) -> AgentSupervisor {
        AgentSupervisor::new("exec-test", limits)
    }

    #[tokio::test]
    async fn test_exit_codes_are_not_errors() {
        let sup = supervisor(CaptureLimits::default());
        let cancel = CancellationToken::new();

        let ok = sup
            .supervise(sh("echo hello"), false, Duration::from_secs(10), &cancel, None)
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.stdout, vec!["hello"]);

        let failed = sup
            .supervise(sh("exit 3"), false, Duration::from_secs(10), &cancel, None)
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_bounded_capture_with_single_sentinel() {
        let sup = supervisor(CaptureLimits {
            max_output_lines: 5,
            ..CaptureLimits::default()
        });
        let cancel = CancellationToken::new();

        let result = sup
            .supervise(sh("seq 1 50"), false, Duration::from_secs(10), &cancel, None)
            .await
            .unwrap();

        assert_eq!(result.stdout.len(), 6);
        let sentinels = result
            .stdout
            .iter()
            .filter(|l| l.as_str() == TRUNCATION_SENTINEL)
            .count();
        assert_eq!(sentinels, 1);
        assert_eq!(result.stdout.last().unwrap(), TRUNCATION_SENTINEL);
        // Order preserved below the bound.
        assert_eq!(&result.stdout[..5], &["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_no_sentinel_under_limit() {
        let sup = supervisor(CaptureLimits {
            max_output_lines: 5,
            ..CaptureLimits::default()
        });
        let cancel = CancellationToken::new();

        let result = sup
            .supervise(sh("seq 1 5"), false, Duration::from_secs(10), &cancel, None)
            .await
            .unwrap();
        assert_eq!(result.stdout.len(), 5);
        assert!(!result.stdout.iter().any(|l| l == TRUNCATION_SENTINEL));
    }

    #[tokio::test]
    async fn test_stderr_captured_separately() {
        let sup = supervisor(CaptureLimits::default());
        let cancel = CancellationToken::new();

        let result = sup
            .supervise(
                sh("echo out; echo err >&2"),
                false,
                Duration::from_secs(10),
                &cancel,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.stdout, vec!["out"]);
        assert_eq!(result.stderr, vec!["err"]);
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let sup = supervisor(CaptureLimits::default());
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let err = sup
            .supervise(
                sh("sleep 30 > /dev/null 2>&1"),
                false,
                Duration::from_millis(200),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SuperviseError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_cancellation_distinct_from_timeout() {
        let sup = supervisor(CaptureLimits::default());
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let err = sup
            .supervise(
                sh("sleep 30 > /dev/null 2>&1"),
                false,
                Duration::from_secs(60),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SuperviseError::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_events_extracted() {
        let sup = supervisor(CaptureLimits::default());
        let cancel = CancellationToken::new();

        let script = r#"
echo '{"type":"tool_use","name":"Read","input":{"file_path":"a.rs"}}'
echo '{"type":"tool_use","name":"Bash","input":{"command":"cargo check"}}'
echo 'plain log line'
"#;
        let result = sup
            .supervise(sh(script), true, Duration::from_secs(10), &cancel, None)
            .await
            .unwrap();
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0].tool, "read");
        assert_eq!(result.events[1].command.as_deref(), Some("cargo check"));
        // Raw lines are still captured alongside the parsed events.
        assert_eq!(result.stdout.len(), 3);
    }

    #[tokio::test]
    async fn test_same_file_read_loop_trips_breaker() {
        let sup = supervisor(CaptureLimits {
            max_same_file_reads: 5,
            ..CaptureLimits::default()
        });
        let cancel = CancellationToken::new();

        // Ten reads of one path, then hang: the breaker must kill the child.
        let script = r#"
for i in $(seq 1 10); do
  echo '{"type":"tool_use","name":"Read","input":{"file_path":"same.rs"}}'
done
sleep 30 > /dev/null 2>&1
"#;
        let started = Instant::now();
        let result = sup
            .supervise(sh(script), true, Duration::from_secs(60), &cancel, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(30));
        let reason = result.breaker_reason.unwrap();
        assert!(reason.contains("same.rs"), "unexpected reason: {reason}");
    }

    #[tokio::test]
    async fn test_total_read_loop_trips_breaker() {
        let sup = supervisor(CaptureLimits {
            max_file_reads: 8,
            max_same_file_reads: 1000,
            ..CaptureLimits::default()
        });
        let cancel = CancellationToken::new();

        let script = r#"
for i in $(seq 1 20); do
  echo "{\"type\":\"tool_use\",\"name\":\"Read\",\"input\":{\"file_path\":\"f$i.rs\"}}"
done
sleep 30 > /dev/null 2>&1
"#;
        let result = sup
            .supervise(sh(script), true, Duration::from_secs(60), &cancel, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.breaker_reason.unwrap().contains("total reads"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sup = supervisor(CaptureLimits::default());
        let cancel = CancellationToken::new();
        let err = sup
            .supervise(
                Command::new("definitely-not-a-real-binary-xyz"),
                false,
                Duration::from_secs(5),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SuperviseError::Spawn(_)));
    }
}
