//! Local sandbox executor. Spawns the
//! requested command under a per-invocation workspace directory, applies
//! the configured resource caps, polls memory/CPU at 1Hz, scans
//! stdout/stderr for policy-violation patterns, and guarantees workspace
//! cleanup on every exit path. Grounded on
//! `tandem_runtime::mcp::McpRegistry::connect`'s `tokio::process::{Command,
//! Child}` spawn-and-track-pid pattern, including its graceful-kill
//! handling (`child.kill().await` then `child.wait().await`).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use cadence_types::{ResourceUsage, SandboxRequest, SandboxResult, SandboxViolation, SandboxViolationKind};
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid as NixPid;
use sysinfo::{Pid, System};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use uuid::Uuid;

/// Substrings that trip a sandbox violation when seen in stdout/stderr.
/// Matches the four violation kinds in the sandbox contract.
const VIOLATION_PATTERNS: &[(&str, SandboxViolationKind)] = &[
    ("password=", SandboxViolationKind::SensitiveDataExposure),
    ("secret=", SandboxViolationKind::SensitiveDataExposure),
    ("api_key=", SandboxViolationKind::SensitiveDataExposure),
    ("rm -rf", SandboxViolationKind::DestructiveCommand),
    ("drop table", SandboxViolationKind::DestructiveCommand),
    ("curl http://", SandboxViolationKind::NetworkAccessAttempt),
    ("curl https://", SandboxViolationKind::NetworkAccessAttempt),
    ("wget ", SandboxViolationKind::NetworkAccessAttempt),
    ("sudo ", SandboxViolationKind::PrivilegeEscalationAttempt),
    ("chmod +s", SandboxViolationKind::PrivilegeEscalationAttempt),
];

pub struct SandboxExecutor {
    workspace_root: PathBuf,
}

impl SandboxExecutor {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    /// Runs `request`, always deleting the per-invocation workspace
    /// before returning, on success, failure, or cancellation.
    pub async fn execute(&self, request: &SandboxRequest) -> anyhow::Result<SandboxResult> {
        let sandbox_id = format!("sbx-{}", Uuid::new_v4());
        let workspace = self.workspace_root.join(&sandbox_id);
        tokio::fs::create_dir_all(&workspace).await?;

        let result = self.run_in_workspace(request, &workspace).await;

        let _ = tokio::fs::remove_dir_all(&workspace).await;
        result
    }

    async fn run_in_workspace(
        &self,
        request: &SandboxRequest,
        workspace: &Path,
    ) -> anyhow::Result<SandboxResult> {
        for (name, contents) in &request.files {
            let path = workspace.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, contents).await?;
        }

        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();

        for key in &request.config.env_whitelist {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = command.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&request.inputs).unwrap_or_default();
            let _ = stdin.write_all(&payload).await;
        }

        let started = Instant::now();
        let cap = Duration::from_millis(request.config.max_duration_ms);
        let (outcome, usage) = run_with_resource_cap(&mut child, cap).await?;

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }

        let violations = scan_violations(&stdout, &stderr);
        let terminated_for_violation = !violations.is_empty();
        if terminated_for_violation {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }

        let exit_code = outcome;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outputs = read_outputs_json(workspace).await.unwrap_or_default();

        Ok(SandboxResult {
            success: exit_code == Some(0) && !terminated_for_violation,
            outputs,
            stdout,
            stderr,
            exit_code,
            duration_ms,
            resource_usage: ResourceUsage {
                wall_time_ms: duration_ms,
                ..usage
            },
            violations,
        })
    }
}

/// Waits for the child to finish, polling resource usage at 1Hz;
/// enforces `cap` with a real SIGTERM, then SIGKILL 5s later if the
/// process hasn't exited, matching the graceful-kill pattern in
/// `tandem_runtime::mcp`.
async fn run_with_resource_cap(
    child: &mut Child,
    cap: Duration,
) -> anyhow::Result<(Option<i32>, ResourceUsage)> {
    let pid = child.id();
    let mut system = System::new();
    let mut peak_memory_mb = 0u64;
    let mut cpu_samples = Vec::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = Instant::now() + cap;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                return Ok((
                    status.code(),
                    ResourceUsage {
                        peak_memory_mb,
                        avg_cpu_percent: average(&cpu_samples),
                        wall_time_ms: 0,
                    },
                ));
            }
            _ = ticker.tick() => {
                if let Some(raw_pid) = pid {
                    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(raw_pid)]), true);
                    if let Some(process) = system.process(Pid::from_u32(raw_pid)) {
                        peak_memory_mb = peak_memory_mb.max(process.memory() / (1024 * 1024));
                        cpu_samples.push(process.cpu_usage() as f64);
                    }
                }
                if Instant::now() >= deadline {
                    send_sigterm(pid, child);
                    let grace = tokio::time::sleep(Duration::from_secs(5));
                    tokio::pin!(grace);
                    tokio::select! {
                        status = child.wait() => {
                            let status = status?;
                            return Ok((
                                status.code(),
                                ResourceUsage {
                                    peak_memory_mb,
                                    avg_cpu_percent: average(&cpu_samples),
                                    wall_time_ms: 0,
                                },
                            ));
                        }
                        _ = &mut grace => {
                            let _ = child.kill().await;
                            let status = child.wait().await?;
                            return Ok((
                                status.code(),
                                ResourceUsage {
                                    peak_memory_mb,
                                    avg_cpu_percent: average(&cpu_samples),
                                    wall_time_ms: 0,
                                },
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// Sends a graceful SIGTERM on Unix; elsewhere there's no portable
/// distinct-from-kill signal, so this falls back to the same
/// `start_kill()` the grace-period timeout would reach anyway.
#[cfg(unix)]
fn send_sigterm(pid: Option<u32>, child: &mut Child) {
    match pid {
        Some(raw_pid) => {
            let _ = kill(NixPid::from_raw(raw_pid as i32), Signal::SIGTERM);
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>, child: &mut Child) {
    let _ = child.start_kill();
}

fn average(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn scan_violations(stdout: &str, stderr: &str) -> Vec<SandboxViolation> {
    let combined = format!("{stdout}\n{stderr}").to_ascii_lowercase();
    VIOLATION_PATTERNS
        .iter()
        .filter(|(pattern, _)| combined.contains(pattern))
        .map(|(pattern, kind)| SandboxViolation {
            kind: *kind,
            evidence: format!("matched pattern `{pattern}`"),
        })
        .collect()
}

async fn read_outputs_json(workspace: &Path) -> Option<std::collections::HashMap<String, serde_json::Value>> {
    let path = workspace.join("outputs.json");
    let text = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::SandboxConfig;
    use std::collections::HashMap;

    #[tokio::test]
    async fn echoes_outputs_json_written_by_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(dir.path());
        let request = SandboxRequest {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo '{\"result\": \"ok\"}' > outputs.json".to_string(),
            ],
            inputs: HashMap::new(),
            files: HashMap::new(),
            config: SandboxConfig {
                max_duration_ms: 5_000,
                ..Default::default()
            },
        };
        let result = executor.execute(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(
            result.outputs.get("result").and_then(|v| v.as_str()),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn detects_network_access_violation() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(dir.path());
        let request = SandboxRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo 'curl http://evil'".to_string()],
            inputs: HashMap::new(),
            files: HashMap::new(),
            config: SandboxConfig {
                max_duration_ms: 5_000,
                ..Default::default()
            },
        };
        let result = executor.execute(&request).await.unwrap();
        assert!(!result.success);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == SandboxViolationKind::NetworkAccessAttempt));
    }

    #[tokio::test]
    async fn workspace_is_removed_after_execution() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(dir.path());
        let request = SandboxRequest {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "true".to_string()],
            inputs: HashMap::new(),
            files: HashMap::new(),
            config: SandboxConfig {
                max_duration_ms: 5_000,
                ..Default::default()
            },
        };
        executor.execute(&request).await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
