//! Layered configuration. Grounded on
//! `tandem_core::config::ConfigStore`'s `deep_merge` layering, scoped down
//! to the option namespaces this system actually needs: `bandit.*`,
//! `scheduler.*`, `planner.*`, `verification.*`, `attestation.*`, and
//! `policy`. No provider/API-key layer and no secret-scrubbing pass —
//! credential management is out of scope here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence_types::PolicyDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditSettings {
    pub explore: f64,
    pub alpha: f64,
    pub beta: f64,
    pub confidence_width: f64,
}

impl Default for BanditSettings {
    fn default() -> Self {
        let defaults = cadence_router::BanditConfig::default();
        Self {
            explore: defaults.explore,
            alpha: defaults.alpha0,
            beta: defaults.beta0,
            confidence_width: defaults.confidence_width,
        }
    }
}

impl From<BanditSettings> for cadence_router::BanditConfig {
    fn from(settings: BanditSettings) -> Self {
        cadence_router::BanditConfig {
            explore: settings.explore,
            alpha0: settings.alpha,
            beta0: settings.beta,
            confidence_width: settings.confidence_width,
            ..cadence_router::BanditConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub max_parallel: usize,
    pub timeout_ms: u64,
    /// Reserved pass-through flag; not yet consumed by a cost-aware
    /// dispatch path (see DESIGN.md).
    pub market: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            timeout_ms: 300_000,
            market: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSettings {
    pub max_depth: usize,
    pub beam_size: usize,
    pub branch_factor: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_depth: 5,
            beam_size: 3,
            branch_factor: 3,
        }
    }
}

impl From<PlannerSettings> for cadence_planner::BeamConfig {
    fn from(settings: PlannerSettings) -> Self {
        cadence_planner::BeamConfig {
            beam_size: settings.beam_size,
            max_depth: settings.max_depth,
            branch_factor: settings.branch_factor,
            ..cadence_planner::BeamConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSettings {
    pub enable_contracts: bool,
    pub enable_metamorphic: bool,
    pub enable_judge: bool,
    pub judge_rounds: u32,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enable_contracts: true,
            enable_metamorphic: true,
            enable_judge: false,
            judge_rounds: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttestationLevel {
    Slsa1,
    Slsa2,
    Slsa3,
    Slsa4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationSettings {
    pub enable: bool,
    pub default_level: AttestationLevel,
    pub key_path: Option<String>,
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self {
            enable: true,
            default_level: AttestationLevel::Slsa2,
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CadenceConfig {
    #[serde(default)]
    pub bandit: BanditSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub planner: PlannerSettings,
    #[serde(default)]
    pub verification: VerificationSettings,
    #[serde(default)]
    pub attestation: AttestationSettings,
    #[serde(default)]
    pub policy: PolicyDefinition,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
}

/// Loads and merges `defaults -> file -> environment -> runtime overrides`,
/// in that order, re-merging on every `get()` so runtime overrides applied
/// after construction are always reflected.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, runtime_overrides: Option<Value>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_json_file(&path).await.unwrap_or_else(|_| empty_object());
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            runtime: runtime_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn in_memory(runtime_overrides: Option<Value>) -> Self {
        Self {
            path: PathBuf::new(),
            layers: Arc::new(RwLock::new(ConfigLayers {
                file: empty_object(),
                env: env_layer(),
                runtime: runtime_overrides.unwrap_or_else(empty_object),
            })),
        }
    }

    pub async fn get(&self) -> CadenceConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = defaults_value();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    pub async fn set_runtime_override(&self, patch: Value) {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.runtime, &patch);
    }

    pub async fn reload_file(&self) -> anyhow::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let file = read_json_file(&self.path).await.unwrap_or_else(|_| empty_object());
        self.layers.write().await.file = file;
        Ok(())
    }
}

fn defaults_value() -> Value {
    serde_json::to_value(CadenceConfig::default()).unwrap_or_else(|_| empty_object())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

/// Reads a handful of `CADENCE_*` environment variables into the same
/// shape as the file layer, mirroring `tandem_core::config`'s `env_layer`.
fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(explore) = std::env::var("CADENCE_BANDIT_EXPLORE") {
        if let Ok(v) = explore.parse::<f64>() {
            deep_merge(&mut root, &json!({ "bandit": { "explore": v } }));
        }
    }
    if let Ok(max_parallel) = std::env::var("CADENCE_SCHEDULER_MAX_PARALLEL") {
        if let Ok(v) = max_parallel.parse::<usize>() {
            deep_merge(&mut root, &json!({ "scheduler": { "max_parallel": v } }));
        }
    }
    if let Ok(market) = std::env::var("CADENCE_SCHEDULER_MARKET") {
        if let Some(v) = parse_bool_like(&market) {
            deep_merge(&mut root, &json!({ "scheduler": { "market": v } }));
        }
    }
    if let Ok(enable) = std::env::var("CADENCE_ATTESTATION_ENABLE") {
        if let Some(v) = parse_bool_like(&enable) {
            deep_merge(&mut root, &json!({ "attestation": { "enable": v } }));
        }
    }
    if let Ok(enable_judge) = std::env::var("CADENCE_VERIFICATION_ENABLE_JUDGE") {
        if let Some(v) = parse_bool_like(&enable_judge) {
            deep_merge(&mut root, &json!({ "verification": { "enable_judge": v } }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_round_trip_through_merge() {
        let store = ConfigStore::in_memory(None).await;
        let config = store.get().await;
        assert_eq!(config.scheduler.max_parallel, 4);
        assert!((config.bandit.explore - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn runtime_override_wins_over_defaults() {
        let store = ConfigStore::in_memory(Some(json!({ "scheduler": { "max_parallel": 8 } }))).await;
        let config = store.get().await;
        assert_eq!(config.scheduler.max_parallel, 8);
        assert_eq!(config.scheduler.timeout_ms, 300_000);
    }

    #[tokio::test]
    async fn set_runtime_override_is_reflected_immediately() {
        let store = ConfigStore::in_memory(None).await;
        store
            .set_runtime_override(json!({ "attestation": { "enable": false } }))
            .await;
        let config = store.get().await;
        assert!(!config.attestation.enable);
    }
}
