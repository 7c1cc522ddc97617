use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub network_isolation: bool,
    #[serde(default = "default_true")]
    pub filesystem_isolation: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default = "default_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_cpu_percent")]
    pub max_cpu_percent: u32,
    #[serde(default = "default_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default)]
    pub env_whitelist: Vec<String>,
}

/// `#[derive(Default)]` would silently diverge from the `serde(default =
/// ...)` field defaults above (bool/u64 zero values instead of the
/// documented caps), so this is written out by hand to match.
impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_isolation: default_true(),
            filesystem_isolation: default_true(),
            allowed_paths: Vec::new(),
            blocked_paths: Vec::new(),
            max_memory_mb: default_memory_mb(),
            max_cpu_percent: default_cpu_percent(),
            max_duration_ms: default_duration_ms(),
            env_whitelist: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_memory_mb() -> u64 {
    512
}
fn default_cpu_percent() -> u32 {
    100
}
fn default_duration_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub files: HashMap<String, String>,
    pub config: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub peak_memory_mb: u64,
    pub avg_cpu_percent: f64,
    pub wall_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxViolationKind {
    SensitiveDataExposure,
    DestructiveCommand,
    NetworkAccessAttempt,
    PrivilegeEscalationAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxViolation {
    pub kind: SandboxViolationKind,
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub violations: Vec<SandboxViolation>,
}
