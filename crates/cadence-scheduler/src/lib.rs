//! Dependency-aware dispatch, leases, retries, and execution (component G).
//! Owns the step lifecycle state machine and the six-step dispatch loop:
//! ready-step load, lease/route/policy gate, ticket, invoke, snapshot,
//! verify + attest, reward update. Grounded on
//! `tandem_core::engine_loop::EngineLoop` — a cooperative async loop over
//! a shared store/event-bus/permission-manager/cancellation-registry, the
//! same shape this scheduler has over `cadence-store`/`cadence-policy`/
//! `cadence-router` — and on `tandem_core::permissions::PermissionManager`
//! for the lease-acquire/reclaim coordination pattern.

pub mod sandbox;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_policy::evaluate as evaluate_policy;
use cadence_provenance::BuildInputs;
use cadence_router::{CostClass, Router};
use cadence_store::Store;
use cadence_types::{
    CadenceError, PlanStatus, PolicyContext, PolicyDefinition, ResourceEnvelope, SandboxConfig,
    SandboxRequest, SandboxResult, Step, StepStatus, Ticket, TicketStatus,
};
use cadence_verify::{MetamorphicOutcomes, PropertyRegistry, VariantKind, VerificationReport};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub use sandbox::SandboxExecutor;

/// The execution target adapter: `execute(routeRef, stepContract,
/// inputs, deadline) -> {outputs, ...}`. Implementations include the local
/// sandbox (`SandboxExecutor`, this crate) and a remote RPC client; the
/// dispatch loop below does not care which.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn invoke(&self, request: &SandboxRequest) -> Result<SandboxResult, CadenceError>;
}

#[async_trait]
impl ExecutionAdapter for SandboxExecutor {
    async fn invoke(&self, request: &SandboxRequest) -> Result<SandboxResult, CadenceError> {
        self.execute(request)
            .await
            .map_err(|e| CadenceError::ExecutionError {
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub lease_duration_ms: i64,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
    pub builder_keyid: String,
    pub run_metamorphic: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            lease_duration_ms: 15 * 60 * 1000,
            backoff_base_ms: 1_000,
            backoff_factor: 2.0,
            backoff_cap_ms: 30_000,
            builder_keyid: "cadence-scheduler".to_string(),
            run_metamorphic: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub ticket: Ticket,
    pub verification: Option<VerificationReport>,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    router: Router,
    executor: Arc<dyn ExecutionAdapter>,
    properties: Arc<PropertyRegistry>,
    policy: PolicyDefinition,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Store,
        router: Router,
        executor: Arc<dyn ExecutionAdapter>,
        properties: Arc<PropertyRegistry>,
        policy: PolicyDefinition,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            router,
            executor,
            properties,
            policy,
            config,
        }
    }

    /// One pass of the dispatch loop: loads ready
    /// steps for `plan_id`, respects parallel-group all-or-nothing
    /// dispatch, bounds concurrency at `max_parallel`, and runs each
    /// step's full six-step pipeline.
    pub async fn dispatch_ready(&self, plan_id: &str, owner: &str, now: i64) -> Result<Vec<StepOutcome>, CadenceError> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| CadenceError::Internal {
                message: format!("unknown plan `{plan_id}`"),
            })?;
        if plan.status != PlanStatus::Active {
            return Ok(Vec::new());
        }

        self.store.reclaim_expired_leases(now).await.map_err(internal)?;

        let steps = self.store.list_steps_for_plan(plan_id).await.map_err(internal)?;
        let completed_ids: HashSet<String> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| s.id.clone())
            .collect();

        let ready: Vec<Step> = steps
            .into_iter()
            .filter(|s| cadence_dsl::is_step_ready(s, &completed_ids))
            .collect();

        let groups = cadence_dsl::get_parallel_groups(&ready);
        let mut chosen: Vec<Step> = Vec::new();
        for members in groups.values() {
            chosen.extend(members.iter().map(|s| (*s).clone()));
        }
        chosen.sort_by(|a, b| {
            cadence_dsl::calculate_step_priority(b, &plan)
                .partial_cmp(&cadence_dsl::calculate_step_priority(a, &plan))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut handles = Vec::new();
        for step in chosen {
            let scheduler = self.clone();
            let semaphore = semaphore.clone();
            let owner = owner.to_string();
            let plan = plan.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                scheduler.dispatch_step(&plan, &step, &owner, now).await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(err)) => warn!(error = %err, "step dispatch failed"),
                Err(join_err) => warn!(error = %join_err, "step dispatch task panicked"),
            }
        }
        Ok(outcomes)
    }

    /// The full six-step pipeline for one step, including retry/backoff
    /// (base 1s, factor 2, cap 30s) for retryable errors.
    async fn dispatch_step(
        &self,
        plan: &cadence_types::Plan,
        step: &Step,
        owner: &str,
        now: i64,
    ) -> Result<StepOutcome, CadenceError> {
        let mut attempt = 0u32;
        let mut last_step = step.clone();
        let mut attempt_now = now;
        loop {
            let span = tracing::info_span!("dispatch_step", plan_id = %plan.id, step_id = %step.id, attempt);
            let _enter = span.enter();

            match self.try_dispatch_once(plan, &last_step, owner, attempt_now).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < last_step.retry_count as u32 => {
                    attempt += 1;
                    let backoff_ms = (self.config.backoff_base_ms as f64
                        * self.config.backoff_factor.powi(attempt as i32 - 1))
                    .min(self.config.backoff_cap_ms as f64) as u64;
                    warn!(error = %err, backoff_ms, "retrying step after transient error");
                    last_step.status = StepStatus::Todo;
                    self.store.put_step(&last_step).await.map_err(internal)?;
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt_now = cadence_types::now_ms();
                }
                Err(err @ CadenceError::LeaseLost { .. }) => {
                    return Err(err);
                }
                Err(err) => {
                    self.fail_step(&mut last_step, &err, attempt_now).await?;
                    return Err(err);
                }
            }
        }
    }

    async fn try_dispatch_once(
        &self,
        plan: &cadence_types::Plan,
        step: &Step,
        owner: &str,
        now: i64,
    ) -> Result<StepOutcome, CadenceError> {
        // 2(a): acquire a time-bounded lease in the same step as the
        // status flip to in_progress.
        let lease_expires = now + self.config.lease_duration_ms;
        let acquired = self
            .store
            .acquire_lease(&step.id, owner, now, lease_expires)
            .await
            .map_err(internal)?;
        if !acquired {
            return Err(CadenceError::LeaseLost {
                step_id: step.id.clone(),
            });
        }
        info!("lease acquired");

        let ctx = policy_context_for(step, plan, owner);

        // 2(c): policy-gate before committing to a route pick.
        let decision = evaluate_policy(&ctx, &self.policy);
        if !decision.allowed {
            return Err(CadenceError::PolicyDenied {
                reason: decision
                    .matched_deny
                    .unwrap_or_else(|| "denied by policy".to_string()),
            });
        }

        // 2(b): ask the router for a route.
        let cost_class = classify_cost(step);
        let pick = self
            .router
            .pick_route(&step.capability, &ctx, &self.policy, cost_class, step.timeout_ms, now)
            .await?;

        // 2(d): create the ticket.
        let ticket = Ticket {
            id: format!("ticket-{}-{}", step.id, now),
            step_id: step.id.clone(),
            route_id: pick.route.id.clone(),
            status: TicketStatus::Running,
            started_at: now,
            ended_at: None,
            cost: 0.0,
            latency_ms: None,
            result: None,
            error: None,
        };
        self.store.put_ticket(&ticket).await.map_err(internal)?;
        self.store
            .event(
                "scheduler",
                "ticket.created",
                serde_json::json!({"stepId": step.id, "ticketId": ticket.id, "routeId": pick.route.id}),
            )
            .await
            .map_err(internal)?;

        let request = build_request(step, &pick.route);
        let started = tokio::time::Instant::now();

        let invocation = tokio::time::timeout(
            Duration::from_millis(step.timeout_ms),
            self.executor.invoke(&request),
        )
        .await;

        let result = match invocation {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                self.settle_ticket(&ticket, &pick.route.id, false, started.elapsed().as_millis() as u64, now)
                    .await?;
                return Err(err);
            }
            Err(_) => {
                self.settle_ticket(&ticket, &pick.route.id, false, step.timeout_ms, now)
                    .await?;
                return Err(CadenceError::ExecutionTimeout {
                    elapsed_ms: step.timeout_ms,
                });
            }
        };

        if let Some(violation) = result.violations.first() {
            self.settle_ticket(&ticket, &pick.route.id, false, result.duration_ms, now)
                .await?;
            return Err(CadenceError::SandboxViolation {
                evidence: violation.evidence.clone(),
            });
        }

        // waiting_review between run and verify, per the lifecycle diagram.
        let mut reviewed_step = step.clone();
        reviewed_step.status = StepStatus::WaitingReview;
        self.store.put_step(&reviewed_step).await.map_err(internal)?;

        // 4: deterministic snapshot (sanitized inputs).
        let sanitized_inputs = sanitize(&map_to_value(&request.inputs));
        let outputs_value = map_to_value(&result.outputs);

        // 5: verification, including metamorphic variants when enabled.
        let metamorphic_outcomes = if self.config.run_metamorphic {
            self.run_metamorphic(&request, &step.capability, &outputs_value).await
        } else {
            MetamorphicOutcomes::default()
        };

        let property_ctx = cadence_verify::PropertyContext {
            capability: step.capability.clone(),
            cost: ticket.cost,
            latency_ms: result.duration_ms,
            constraints: step.constraints.clone(),
            required_fields: step.contract.required_fields.clone(),
            error: None,
        };
        let report = cadence_verify::run(
            &self.properties,
            &sanitized_inputs,
            &outputs_value,
            &property_ctx,
            result.outputs.len(),
            &metamorphic_outcomes,
        );

        let mut success = result.success && report.all_critical_passed;
        self.settle_ticket(&ticket, &pick.route.id, success, result.duration_ms, now)
            .await?;

        // 5: attestation.
        let build_inputs = BuildInputs {
            plan_id: plan.id.clone(),
            step_id: step.id.clone(),
            ticket_id: ticket.id.clone(),
            capability: step.capability.clone(),
            route_id: pick.route.id.clone(),
            tool: pick.route.tool.clone(),
            critical: step.critical,
            policy: pick.route.policy.clone(),
            sanitized_inputs: sanitized_inputs.clone(),
            outputs: outputs_value.clone(),
            environment: None,
            context_materials: Vec::new(),
            started_at: now,
            finished_at: now + result.duration_ms as i64,
            deterministic_inputs: true,
            stable_tool_version: true,
            no_external_state_deps: step.constraints.is_none(),
            sandboxed: true,
        };
        let attestation = cadence_provenance::build_attestation(
            &build_inputs,
            &self.config.builder_keyid,
            |bytes| hex_of(bytes),
            now,
        );
        self.store.put_attestation(&attestation).await.map_err(internal)?;

        // `require` obligations are not gates on dispatch, but a step
        // still can't be marked done while one it owes goes unmet.
        if success && !decision.obligations.is_empty() {
            let attestation_level = if attestation.statement.predicate.metadata.reproducible {
                3
            } else {
                2
            };
            let mut obligation_ctx = ctx.clone();
            obligation_ctx
                .extra
                .insert("attestation_level".to_string(), serde_json::json!(attestation_level));
            for obligation in &decision.obligations {
                let clause = cadence_policy::parse_rule(obligation).clause;
                if !cadence_policy::evaluate_clause(&obligation_ctx, &clause) {
                    warn!(step_id = %step.id, obligation = %obligation, "require obligation unmet, failing step");
                    success = false;
                    break;
                }
            }
        }

        // 6: transition to done/failed and feed the reward back.
        let mut final_step = reviewed_step;
        final_step.status = if success { StepStatus::Done } else { StepStatus::Failed };
        final_step.lease.lease_owner = None;
        final_step.lease.lease_expires_at = None;
        final_step.updated_at = now;
        self.store.put_step(&final_step).await.map_err(internal)?;
        self.store
            .event(
                "scheduler",
                if success { "step.done" } else { "step.failed" },
                serde_json::json!({"stepId": step.id, "ticketId": ticket.id}),
            )
            .await
            .map_err(internal)?;

        self.router
            .record_outcome(&pick.route.id, success, result.duration_ms, ticket.cost, now)
            .await?;

        if !success && step.critical {
            self.cancel_plan(&plan.id, now).await?;
        }

        Ok(StepOutcome {
            step_id: final_step.id,
            status: final_step.status,
            ticket,
            verification: Some(report),
        })
    }

    async fn run_metamorphic(
        &self,
        request: &SandboxRequest,
        capability: &str,
        original_outputs: &Value,
    ) -> MetamorphicOutcomes {
        let original_inputs = map_to_value(&request.inputs);
        let variants = cadence_verify::generate_variants(capability, &original_inputs);
        let mut outcomes = MetamorphicOutcomes::default();

        for variant in variants {
            match variant.kind {
                VariantKind::Original => continue,
                VariantKind::Repeat => {
                    let mut repeat_request = request.clone();
                    repeat_request.inputs = value_to_map(&variant.inputs);
                    if let Ok(result) = self.executor.invoke(&repeat_request).await {
                        outcomes.idempotency = Some(cadence_verify::idempotent(
                            original_outputs,
                            &map_to_value(&result.outputs),
                        ));
                    }
                }
                VariantKind::Reverse => {
                    let mut reverse_request = request.clone();
                    reverse_request.inputs = value_to_map(&variant.inputs);
                    if let Ok(result) = self.executor.invoke(&reverse_request).await {
                        outcomes.commutativity = Some(cadence_verify::commutative(
                            original_outputs,
                            &map_to_value(&result.outputs),
                        ));
                    }
                }
            }
        }
        outcomes
    }

    async fn settle_ticket(
        &self,
        ticket: &Ticket,
        route_id: &str,
        success: bool,
        latency_ms: u64,
        now: i64,
    ) -> Result<(), CadenceError> {
        let mut settled = ticket.clone();
        settled.status = if success {
            TicketStatus::Completed
        } else {
            TicketStatus::Failed
        };
        settled.ended_at = Some(now);
        settled.latency_ms = Some(latency_ms);
        settled.route_id = route_id.to_string();
        self.store.put_ticket(&settled).await.map_err(internal)
    }

    async fn fail_step(&self, step: &mut Step, err: &CadenceError, now: i64) -> Result<(), CadenceError> {
        let blocked = matches!(
            err,
            CadenceError::PolicyDenied { .. } | CadenceError::NoRouteAvailable { .. }
        );
        step.status = if blocked { StepStatus::Blocked } else { StepStatus::Failed };
        step.lease.lease_owner = None;
        step.lease.lease_expires_at = None;
        step.updated_at = now;
        self.store.put_step(step).await.map_err(internal)?;
        self.store
            .event(
                "scheduler",
                if blocked { "step.blocked" } else { "step.failed" },
                serde_json::json!({"stepId": step.id, "error": err.code()}),
            )
            .await
            .map_err(internal)?;
        if !blocked && err.is_critical_plan_failure() && step.critical {
            self.cancel_plan(&step.plan_id, now).await?;
        }
        Ok(())
    }

    /// Cancellation of a parent cancels its unresolved children.
    /// Here "parent" is the failed plan: every non-terminal step is marked
    /// `blocked` and its lease released.
    pub async fn cancel_plan(&self, plan_id: &str, now: i64) -> Result<(), CadenceError> {
        if let Some(mut plan) = self.store.get_plan(plan_id).await.map_err(internal)? {
            plan.status = PlanStatus::Failed;
            plan.updated_at = now;
            self.store.put_plan(&plan).await.map_err(internal)?;
        }
        for mut step in self.store.list_steps_for_plan(plan_id).await.map_err(internal)? {
            if !matches!(step.status, StepStatus::Done | StepStatus::Failed) {
                step.status = StepStatus::Blocked;
                step.lease.lease_owner = None;
                step.lease.lease_expires_at = None;
                step.updated_at = now;
                self.store.put_step(&step).await.map_err(internal)?;
            }
        }
        self.store
            .event(
                "scheduler",
                "plan.cancelled",
                serde_json::json!({"planId": plan_id}),
            )
            .await
            .map_err(internal)?;
        Ok(())
    }
}

/// Builds the policy-evaluation context for `step`, pulling
/// `environment`/`project`/`securityLevel` out of the owning plan's
/// free-form context bag (so a rule can gate a step on
/// `environment == "prod"`) and carrying the whole bag through as `extra`
/// so dotted-name lookups on custom fields resolve too.
fn policy_context_for(step: &Step, plan: &cadence_types::Plan, owner: &str) -> PolicyContext {
    PolicyContext {
        capability: step.capability.clone(),
        step_cost: step.constraints.as_ref().and_then(|c| c.max_cost).unwrap_or(0.0),
        cumulative_cost: 0.0,
        elapsed_ms: 0.0,
        user: Some(owner.to_string()),
        project: context_string(plan, "project"),
        environment: context_string(plan, "environment"),
        security_level: context_string(plan, "securityLevel").or_else(|| context_string(plan, "security_level")),
        critical: step.critical,
        extra: plan.context.clone(),
    }
}

fn context_string(plan: &cadence_types::Plan, key: &str) -> Option<String> {
    plan.context.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn classify_cost(step: &Step) -> CostClass {
    match step.constraints.as_ref().and_then(|c| c.max_cost) {
        Some(cost) if cost >= 5.0 => CostClass::High,
        Some(cost) if cost >= 1.0 => CostClass::Mid,
        _ => CostClass::Low,
    }
}

fn build_request(step: &Step, route: &cadence_types::Route) -> SandboxRequest {
    SandboxRequest {
        command: route.tool.clone(),
        args: Vec::new(),
        inputs: step.contract.inputs.clone(),
        files: HashMap::new(),
        config: step
            .constraints
            .as_ref()
            .map(constraints_to_sandbox_config)
            .unwrap_or_default(),
    }
}

fn constraints_to_sandbox_config(constraints: &ResourceEnvelope) -> SandboxConfig {
    SandboxConfig {
        max_duration_ms: constraints.max_latency_ms.unwrap_or(300_000),
        ..Default::default()
    }
}

/// Strips fields whose name looks like a timestamp/uuid/nonce so repeated
/// logical-equivalent runs produce identical sanitized input snapshots.
fn sanitize(inputs: &Value) -> Value {
    const VOLATILE_MARKERS: &[&str] = &["timestamp", "nonce", "uuid", "request_id", "trace_id"];
    match inputs {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::new();
            for (key, value) in map {
                let lowered = key.to_ascii_lowercase();
                if VOLATILE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                    continue;
                }
                sanitized.insert(key.clone(), sanitize(value));
            }
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

fn map_to_value(map: &HashMap<String, Value>) -> Value {
    Value::Object(map.clone().into_iter().collect())
}

fn value_to_map(value: &Value) -> HashMap<String, Value> {
    value
        .as_object()
        .map(|obj| obj.clone().into_iter().collect())
        .unwrap_or_default()
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn internal(err: anyhow::Error) -> CadenceError {
    CadenceError::Internal {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_policy::evaluate;
    use cadence_types::{
        IoContract, LeaseFields, Plan, PlanBudget, PlanStatus, Route, Step, StepStatus,
    };
    use std::collections::HashSet as StdHashSet;

    struct EchoAdapter;

    #[async_trait]
    impl ExecutionAdapter for EchoAdapter {
        async fn invoke(&self, request: &SandboxRequest) -> Result<SandboxResult, CadenceError> {
            Ok(SandboxResult {
                success: true,
                outputs: {
                    let mut outputs = HashMap::new();
                    outputs.insert("result".to_string(), serde_json::json!("ok"));
                    outputs.extend(request.inputs.clone());
                    outputs
                },
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                duration_ms: 10,
                resource_usage: Default::default(),
                violations: Vec::new(),
            })
        }
    }

    async fn seeded_store(plan: &Plan, step: &Step, route: &Route) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.put_plan(plan).await.unwrap();
        store.put_step(step).await.unwrap();
        store.put_route(route).await.unwrap();
        store
    }

    fn sample_plan() -> Plan {
        Plan {
            id: "plan-1".into(),
            goal: "greet service".into(),
            context: HashMap::new(),
            budget: PlanBudget::default(),
            owner: "alice".into(),
            priority: 5,
            deadline: None,
            status: PlanStatus::Active,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn sample_step() -> Step {
        Step {
            id: "s-1".into(),
            plan_id: "plan-1".into(),
            capability: "code.implement".into(),
            critical: true,
            priority: 5,
            contract: IoContract {
                required_fields: vec!["result".to_string()],
                ..Default::default()
            },
            constraints: None,
            dependencies: StdHashSet::new(),
            parallel_group: None,
            timeout_ms: 5_000,
            retry_count: 2,
            status: StepStatus::Todo,
            assignee: None,
            lease: LeaseFields::default(),
            branch: None,
            parent_step_id: None,
            order_index: 0,
            created_at: 0,
            updated_at: 0,
            metadata: HashMap::new(),
        }
    }

    fn sample_route() -> Route {
        Route {
            id: "route-1".into(),
            capability: "code.implement".into(),
            mcp_id: "mcp-1".into(),
            tool: "codegen".into(),
            score: 0.0,
            policy: None,
            healthy: true,
            cost_weight: 1.0,
            latency_weight: 1.0,
            reliability_weight: 1.0,
        }
    }

    #[tokio::test]
    async fn dispatches_ready_step_to_done() {
        let plan = sample_plan();
        let step = sample_step();
        let route = sample_route();
        let store = seeded_store(&plan, &step, &route).await;
        let router = Router::new(store.clone(), cadence_router::BanditConfig::default());
        let scheduler = Scheduler::new(
            store.clone(),
            router,
            Arc::new(EchoAdapter),
            Arc::new(PropertyRegistry::with_builtins()),
            PolicyDefinition::default(),
            SchedulerConfig {
                run_metamorphic: false,
                ..Default::default()
            },
        );

        let outcomes = scheduler.dispatch_ready("plan-1", "worker-a", 1_000).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, StepStatus::Done);

        let persisted = store.get_step("s-1").await.unwrap().unwrap();
        assert_eq!(persisted.status, StepStatus::Done);
        assert!(persisted.lease.lease_owner.is_none());
    }

    #[tokio::test]
    async fn deny_policy_blocks_dispatch() {
        let plan = sample_plan();
        let step = sample_step();
        let route = sample_route();
        let store = seeded_store(&plan, &step, &route).await;
        let router = Router::new(store.clone(), cadence_router::BanditConfig::default());
        let policy = PolicyDefinition {
            allow: vec![],
            deny: vec!["code.implement".to_string()],
            require: vec![],
        };
        let scheduler = Scheduler::new(
            store.clone(),
            router,
            Arc::new(EchoAdapter),
            Arc::new(PropertyRegistry::with_builtins()),
            policy,
            SchedulerConfig::default(),
        );

        let outcomes = scheduler.dispatch_ready("plan-1", "worker-a", 1_000).await.unwrap();
        assert!(outcomes.is_empty());
        let persisted = store.get_step("s-1").await.unwrap().unwrap();
        assert_eq!(persisted.status, StepStatus::Blocked);
        let plan_after = store.get_plan("plan-1").await.unwrap().unwrap();
        assert_eq!(plan_after.status, cadence_types::PlanStatus::Active);
    }

    #[tokio::test]
    async fn conditional_deny_reads_environment_from_plan_context() {
        let mut plan = sample_plan();
        plan.context.insert("environment".to_string(), serde_json::json!("prod"));
        let mut step = sample_step();
        step.capability = "web.fetch".to_string();
        let mut route = sample_route();
        route.capability = "web.fetch".to_string();
        let store = seeded_store(&plan, &step, &route).await;
        let router = Router::new(store.clone(), cadence_router::BanditConfig::default());
        let policy = PolicyDefinition {
            allow: vec![],
            deny: vec!["web.fetch IF environment == \"prod\"".to_string()],
            require: vec![],
        };
        let scheduler = Scheduler::new(
            store.clone(),
            router,
            Arc::new(EchoAdapter),
            Arc::new(PropertyRegistry::with_builtins()),
            policy,
            SchedulerConfig::default(),
        );

        let outcomes = scheduler.dispatch_ready("plan-1", "worker-a", 1_000).await.unwrap();
        assert!(outcomes.is_empty());
        let persisted = store.get_step("s-1").await.unwrap().unwrap();
        assert_eq!(persisted.status, StepStatus::Blocked);
        let plan_after = store.get_plan("plan-1").await.unwrap().unwrap();
        assert_eq!(plan_after.status, cadence_types::PlanStatus::Active);
    }

    #[tokio::test]
    async fn unmet_require_obligation_fails_a_step_that_would_otherwise_be_done() {
        let plan = sample_plan();
        let step = sample_step();
        let route = sample_route();
        let store = seeded_store(&plan, &step, &route).await;
        let router = Router::new(store.clone(), cadence_router::BanditConfig::default());
        let policy = PolicyDefinition {
            allow: vec![],
            deny: vec![],
            require: vec!["attestation_level >= 9 IF capability == code.implement".to_string()],
        };
        let scheduler = Scheduler::new(
            store.clone(),
            router,
            Arc::new(EchoAdapter),
            Arc::new(PropertyRegistry::with_builtins()),
            policy,
            SchedulerConfig {
                run_metamorphic: false,
                ..Default::default()
            },
        );

        let outcomes = scheduler.dispatch_ready("plan-1", "worker-a", 1_000).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, StepStatus::Failed);
        let persisted = store.get_step("s-1").await.unwrap().unwrap();
        assert_eq!(persisted.status, StepStatus::Failed);
    }

    #[test]
    fn sanitize_strips_volatile_fields() {
        let value = serde_json::json!({"goal": "ship", "request_id": "abc", "nested": {"nonce": 1, "data": 2}});
        let sanitized = sanitize(&value);
        assert!(sanitized.get("request_id").is_none());
        assert!(sanitized.get("nested").unwrap().get("nonce").is_none());
        assert_eq!(sanitized.get("goal").unwrap(), "ship");
    }

    #[test]
    fn default_policy_allows_by_default() {
        assert!(evaluate(&PolicyContext::default(), &PolicyDefinition::default()).allowed);
    }
}
