//! Quality-gate runner.
//!
//! Runs the configured test/lint/build commands in the working directory
//! with a per-run timeout and truncated output capture. Preflight uses a
//! reduced gate set (build + lint) cached by commit hash so a clean
//! baseline is not re-verified every tick.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use dispatch::baseline::GateKind;

/// Bytes of combined output retained per gate.
const OUTPUT_MAX_BYTES: usize = 4096;

/// Outcome of one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateKind,
    pub passed: bool,
    /// Combined stdout+stderr, truncated to a few KB.
    pub output: String,
    pub duration_ms: u64,
}

/// Abstraction over the gate commands, so tests can fake outcomes.
#[async_trait]
pub trait GateRunner: Send + Sync {
    /// Run every configured gate. Returns per-gate results and whether
    /// all passed.
    async fn run_all(&self, workdir: &Path, timeout: Duration) -> Result<(Vec<GateResult>, bool)>;

    /// Run only the fast baseline gates (build + lint).
    async fn run_preflight(
        &self,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<(Vec<GateResult>, bool)>;
}

/// Gate runner that shells out to per-gate commands.
pub struct CommandGateRunner {
    commands: HashMap<GateKind, Vec<String>>,
}

impl Default for CommandGateRunner {
    fn default() -> Self {
        let mut commands = HashMap::new();
        commands.insert(
            GateKind::Build,
            vec!["cargo".into(), "check".into(), "--workspace".into()],
        );
        commands.insert(
            GateKind::Lint,
            vec![
                "cargo".into(),
                "clippy".into(),
                "--workspace".into(),
                "--".into(),
                "-D".into(),
                "warnings".into(),
            ],
        );
        commands.insert(
            GateKind::Test,
            vec!["cargo".into(), "test".into(), "--workspace".into()],
        );
        Self { commands }
    }
}

impl CommandGateRunner {
    pub fn new(commands: HashMap<GateKind, Vec<String>>) -> Self {
        Self { commands }
    }

    async fn run_gate(
        &self,
        gate: GateKind,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<GateResult> {
        let argv = self
            .commands
            .get(&gate)
            .with_context(|| format!("no command configured for gate {gate}"))?;
        let (program, args) = argv
            .split_first()
            .with_context(|| format!("empty command for gate {gate}"))?;

        let started = Instant::now();
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.with_context(|| format!("failed to run gate {gate}"))?,
            Err(_) => {
                warn!(%gate, timeout_secs = timeout.as_secs(), "gate timed out");
                return Ok(GateResult {
                    gate,
                    passed: false,
                    output: format!("gate {gate} timed out after {}s", timeout.as_secs()),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(GateResult {
            gate,
            passed: output.status.success(),
            output: truncate_output(&combined),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_set(
        &self,
        gates: &[GateKind],
        workdir: &Path,
        timeout: Duration,
    ) -> Result<(Vec<GateResult>, bool)> {
        let mut results = Vec::with_capacity(gates.len());
        let mut all_passed = true;
        for &gate in gates {
            let result = self.run_gate(gate, workdir, timeout).await?;
            info!(%gate, passed = result.passed, duration_ms = result.duration_ms, "gate finished");
            all_passed &= result.passed;
            results.push(result);
        }
        Ok((results, all_passed))
    }
}

#[async_trait]
impl GateRunner for CommandGateRunner {
    async fn run_all(&self, workdir: &Path, timeout: Duration) -> Result<(Vec<GateResult>, bool)> {
        self.run_set(&GateKind::ALL, workdir, timeout).await
    }

    async fn run_preflight(
        &self,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<(Vec<GateResult>, bool)> {
        self.run_set(&[GateKind::Build, GateKind::Lint], workdir, timeout)
            .await
    }
}

fn truncate_output(raw: &str) -> String {
    if raw.len() <= OUTPUT_MAX_BYTES {
        return raw.to_string();
    }
    let mut cut = OUTPUT_MAX_BYTES;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[... gate output truncated ...]", &raw[..cut])
}

/// Preflight results keyed by commit hash.
#[derive(Default)]
pub struct PreflightCache {
    inner: Mutex<HashMap<String, bool>>,
}

impl PreflightCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, commit: &str) -> Option<bool> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(commit)
            .copied()
    }

    pub fn put(&self, commit: &str, healthy: bool) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(commit.to_string(), healthy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_runner(script: &str) -> CommandGateRunner {
        let mut commands = HashMap::new();
        for gate in GateKind::ALL {
            commands.insert(gate, vec!["sh".into(), "-c".into(), script.into()]);
        }
        CommandGateRunner::new(commands)
    }

    #[tokio::test]
    async fn test_passing_gates() {
        let runner = fake_runner("echo fine");
        let dir = tempfile::tempdir().unwrap();
        let (results, all_passed) = runner
            .run_all(dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(all_passed);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.passed));
    }

    #[tokio::test]
    async fn test_failing_gate_captures_output() {
        let runner = fake_runner("echo boom >&2; exit 1");
        let dir = tempfile::tempdir().unwrap();
        let (results, all_passed) = runner
            .run_all(dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!all_passed);
        assert!(results.iter().all(|r| !r.passed));
        assert!(results[0].output.contains("boom"));
    }

    #[tokio::test]
    async fn test_gate_timeout_fails_closed() {
        let runner = fake_runner("sleep 30");
        let dir = tempfile::tempdir().unwrap();
        let (results, all_passed) = runner
            .run_preflight(dir.path(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!all_passed);
        assert!(results[0].output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_preflight_runs_build_and_lint_only() {
        let runner = fake_runner("true");
        let dir = tempfile::tempdir().unwrap();
        let (results, _) = runner
            .run_preflight(dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        let gates: Vec<GateKind> = results.iter().map(|r| r.gate).collect();
        assert_eq!(gates, vec![GateKind::Build, GateKind::Lint]);
    }

    #[test]
    fn test_preflight_cache() {
        let cache = PreflightCache::new();
        assert_eq!(cache.get("abc123"), None);
        cache.put("abc123", true);
        assert_eq!(cache.get("abc123"), Some(true));
        cache.put("abc123", false);
        assert_eq!(cache.get("abc123"), Some(false));
    }

    #[test]
    fn test_truncate_output_respects_char_boundary() {
        let raw = "é".repeat(OUTPUT_MAX_BYTES);
        let truncated = truncate_output(&raw);
        assert!(truncated.contains("truncated"));
    }
}
