//! The four read-model queries, as plain async methods
//! rather than HTTP routes — the HTTP/CLI wrapper is out of scope here,
//! so these are the shapes a dashboard or CLI outside this repo would
//! call directly.

use cadence_types::{Event, Plan};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StepCounts {
    pub todo: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub waiting_review: u64,
    pub done: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsDashboard {
    pub active_plan_count: u64,
    pub step_counts: StepCounts,
    pub total_attestations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteHealth {
    pub route_id: String,
    pub capability: String,
    pub healthy: bool,
    pub circuit_open: bool,
    pub posterior_mean: f64,
    pub total_pulls: u64,
}

pub type EventsStream = Vec<Event>;
pub type ActivePlans = Vec<Plan>;
