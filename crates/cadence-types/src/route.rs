use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub capability: String,
    pub mcp_id: String,
    pub tool: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    pub healthy: bool,
    #[serde(default = "default_weight")]
    pub cost_weight: f64,
    #[serde(default = "default_weight")]
    pub latency_weight: f64,
    #[serde(default = "default_weight")]
    pub reliability_weight: f64,
}

pub fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub route_id: String,
    pub alpha: f64,
    pub beta: f64,
    pub avg_latency_ms: f64,
    pub avg_cost: f64,
    pub avg_reliability: f64,
    pub confidence_radius: f64,
    pub success_count: u64,
    pub total_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reward: Option<f64>,
}

impl LearningRecord {
    pub fn new(route_id: impl Into<String>, alpha0: f64, beta0: f64) -> Self {
        Self {
            route_id: route_id.into(),
            alpha: alpha0.max(1.0),
            beta: beta0.max(1.0),
            avg_latency_ms: 0.0,
            avg_cost: 0.0,
            avg_reliability: 1.0,
            confidence_radius: 1.0,
            success_count: 0,
            total_count: 0,
            last_reward: None,
        }
    }

    pub fn posterior_mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub step_id: String,
    pub route_id: String,
    pub status: TicketStatus,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
