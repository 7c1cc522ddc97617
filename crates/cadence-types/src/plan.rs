use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Todo,
    InProgress,
    Blocked,
    WaitingReview,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlanBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resource_counts: Option<HashMap<String, u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub budget: PlanBudget,
    pub owner: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    pub status: PlanStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn default_priority() -> u8 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub max_resource_counts: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IoContract {
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LeaseFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub plan_id: String,
    pub capability: String,
    #[serde(default)]
    pub critical: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub contract: IoContract,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<ResourceEnvelope>,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u8,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(flatten)]
    pub lease: LeaseFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
    #[serde(default)]
    pub order_index: u32,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

pub fn default_timeout_ms() -> u64 {
    300_000
}

pub fn default_retry_count() -> u8 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<String>,
    pub score: f64,
    #[serde(default)]
    pub rationale: Vec<String>,
    /// References into the plan's step table, not an embedded copy
    /// (design notes §9: "a reference-by-id design ... is preferable").
    pub step_ids: Vec<String>,
    pub active: bool,
}
