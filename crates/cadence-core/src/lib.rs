//! The coordinator that wires components A-I together. Grounded on
//! `tandem_core::engine_loop::EngineLoop`: a `#[derive(Clone)]`
//! struct-of-registries with a many-argument constructor, whose async
//! methods emit observability events around store-backed state
//! transitions. `Coordinator` plays the same role here over
//! `cadence-store`/`cadence-planner`/`cadence-router`/`cadence-scheduler`/
//! `cadence-verify`/`cadence-provenance` instead of `tandem-core`'s
//! storage/provider/tool registries.

pub mod adapters;
pub mod config;
pub mod readmodel;

use std::collections::HashMap;
use std::sync::Arc;

use cadence_planner::{search, materialize_branches, BeamConfig, MethodRegistry, Node};
use cadence_router::Router;
use cadence_scheduler::{ExecutionAdapter, Scheduler, SchedulerConfig};
use cadence_store::Store;
use cadence_types::{
    Branch, CadenceError, Plan, PlanBudget, PlanStatus, PolicyDefinition, Route, StepStatus,
};
use cadence_verify::PropertyRegistry;
use serde_json::Value;
use tracing::Level;
use uuid::Uuid;

pub use adapters::{ContextAdapter, JudgeAdapter, JudgeVerdict, NullContext, NullJudge};
pub use config::CadenceConfig;
pub use readmodel::{ActivePlans, EventsStream, MetricsDashboard, RouteHealth, StepCounts};

fn internal(err: anyhow::Error) -> CadenceError {
    CadenceError::Internal {
        message: err.to_string(),
    }
}

fn validation_err(err: cadence_dsl::ValidationError) -> CadenceError {
    use cadence_dsl::ValidationError::*;
    match err {
        InvalidField { field, reason } => CadenceError::Validation { field, reason },
        MissingField { field } => CadenceError::Validation {
            field,
            reason: "missing required field".to_string(),
        },
        UnknownDependency { step_id, depends_on } => CadenceError::Validation {
            field: format!("{step_id}.dependencies"),
            reason: format!("unknown dependency `{depends_on}`"),
        },
        SelfDependency { step_id } => CadenceError::Validation {
            field: format!("{step_id}.dependencies"),
            reason: "a step cannot depend on itself".to_string(),
        },
        CyclicDependency { step_id } => CadenceError::Validation {
            field: format!("{step_id}.dependencies"),
            reason: "dependency graph contains a cycle".to_string(),
        },
    }
}

#[derive(Clone)]
pub struct Coordinator {
    store: Store,
    methods: Arc<MethodRegistry>,
    policy: PolicyDefinition,
    router: Router,
    scheduler: Scheduler,
    properties: Arc<PropertyRegistry>,
    judge: Arc<dyn JudgeAdapter>,
    context: Arc<dyn ContextAdapter>,
    config: CadenceConfig,
}

impl Coordinator {
    /// Wires components A-I with the `Null*` adapter stubs for the judge
    /// and context-retrieval peers, both external collaborators specified
    /// only by interface.
    pub fn new(store: Store, executor: Arc<dyn ExecutionAdapter>, config: CadenceConfig) -> Self {
        Self::with_adapters(store, executor, Arc::new(NullJudge), Arc::new(NullContext), config)
    }

    pub fn with_adapters(
        store: Store,
        executor: Arc<dyn ExecutionAdapter>,
        judge: Arc<dyn JudgeAdapter>,
        context: Arc<dyn ContextAdapter>,
        config: CadenceConfig,
    ) -> Self {
        let methods = Arc::new(MethodRegistry::with_builtins());
        let policy = config.policy.clone();
        let router = Router::new(store.clone(), config.bandit.clone().into());
        let properties = Arc::new(PropertyRegistry::with_builtins());
        let scheduler_config = SchedulerConfig {
            max_parallel: config.scheduler.max_parallel.max(1),
            run_metamorphic: config.verification.enable_metamorphic,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(
            store.clone(),
            router.clone(),
            executor,
            properties.clone(),
            policy.clone(),
            scheduler_config,
        );
        Self {
            store,
            methods,
            policy,
            router,
            scheduler,
            properties,
            judge,
            context,
            config,
        }
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    pub fn properties(&self) -> &PropertyRegistry {
        &self.properties
    }

    pub fn policy(&self) -> &PolicyDefinition {
        &self.policy
    }

    /// Registers a route a capability can be dispatched to. The router
    /// lazily initializes the learning record on first pick, so nothing
    /// beyond the route row needs to be seeded here.
    pub async fn register_route(&self, route: Route) -> Result<(), CadenceError> {
        self.store.put_route(&route).await.map_err(internal)
    }

    /// Component D: classifies `goal`, decomposes it into a primitive
    /// step sequence, validates the result, and persists both
    /// the plan and its steps.
    pub async fn submit_plan(
        &self,
        goal: &str,
        owner: &str,
        context: HashMap<String, Value>,
        budget: PlanBudget,
        now: i64,
    ) -> Result<Plan, CadenceError> {
        let plan_id = format!("plan-{}", Uuid::new_v4());
        let mut steps = self.methods.decompose(&plan_id, goal, &context);
        for step in &mut steps {
            step.timeout_ms = self.config.scheduler.timeout_ms;
        }
        cadence_dsl::validate_steps(&steps).map_err(validation_err)?;

        let plan = Plan {
            id: plan_id.clone(),
            goal: goal.to_string(),
            context,
            budget,
            owner: owner.to_string(),
            priority: cadence_types::default_priority(),
            deadline: None,
            status: PlanStatus::Active,
            created_at: now,
            updated_at: now,
        };
        cadence_dsl::validate_plan(&plan).map_err(validation_err)?;

        self.store.put_plan(&plan).await.map_err(internal)?;
        for step in &steps {
            self.store.put_step(step).await.map_err(internal)?;
        }
        self.store
            .event(
                "coordinator",
                "plan.created",
                serde_json::json!({"planId": plan_id, "goal": goal, "stepCount": steps.len()}),
            )
            .await
            .map_err(internal)?;

        cadence_observability::emit_event(
            Level::INFO,
            cadence_observability::ProcessKind::Coordinator,
            cadence_observability::ObservabilityEvent {
                event: "plan.created",
                component: "coordinator",
                correlation_id: Some(plan_id.as_str()),
                session_id: None,
                run_id: None,
                message_id: None,
                provider_id: None,
                model_id: None,
                status: Some("active"),
                error_code: None,
                detail: Some(goal),
            },
        );

        Ok(plan)
    }

    /// Component E: beam-searches alternative step-list mutations for an
    /// existing plan and persists the resulting branches (exactly one
    /// `active=true`, per `materialize_branches`).
    pub async fn propose_branches(&self, plan_id: &str) -> Result<Vec<Branch>, CadenceError> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| CadenceError::Internal {
                message: format!("unknown plan `{plan_id}`"),
            })?;
        let steps = self.store.list_steps_for_plan(plan_id).await.map_err(internal)?;
        let is_deploy_goal = cadence_planner::classify_goal(&plan.goal) == cadence_planner::GoalClass::Deploy;
        let beam_config: BeamConfig = self.config.planner.clone().into();

        let nodes: Vec<Node> = search(steps, &beam_config, is_deploy_goal);
        let branches = materialize_branches(plan_id, &nodes, None);
        for branch in &branches {
            self.store.put_branch(branch).await.map_err(internal)?;
        }
        Ok(branches)
    }

    pub async fn activate_branch(&self, plan_id: &str, branch_id: &str) -> Result<(), CadenceError> {
        self.store.activate_branch(plan_id, branch_id).await.map_err(internal)
    }

    /// One dispatch round (component G), delegating straight to the
    /// scheduler.
    pub async fn dispatch_round(
        &self,
        plan_id: &str,
        owner: &str,
        now: i64,
    ) -> Result<Vec<cadence_scheduler::StepOutcome>, CadenceError> {
        self.scheduler.dispatch_ready(plan_id, owner, now).await
    }

    /// Drives dispatch rounds until the plan leaves `active` status or no
    /// further progress is observed (ready steps exhausted, or blocked on
    /// policy/route denial awaiting operator intervention), up to
    /// `max_rounds`. Advances `now` by a second between rounds so leases
    /// and backoffs elapse the way real wall-clock time would.
    pub async fn run_to_completion(
        &self,
        plan_id: &str,
        owner: &str,
        max_rounds: u32,
        mut now: i64,
    ) -> Result<Plan, CadenceError> {
        let mut previous_snapshot: Option<Vec<(String, StepStatus)>> = None;

        for _ in 0..max_rounds.max(1) {
            let plan = self.get_plan(plan_id).await?;
            if plan.status != PlanStatus::Active {
                return Ok(plan);
            }

            self.scheduler.dispatch_ready(plan_id, owner, now).await?;

            let steps = self.store.list_steps_for_plan(plan_id).await.map_err(internal)?;
            if !steps.is_empty() && steps.iter().all(|s| s.status == StepStatus::Done) {
                return self.complete_plan(plan_id, now).await;
            }

            let refreshed = self.get_plan(plan_id).await?;
            if refreshed.status != PlanStatus::Active {
                return Ok(refreshed);
            }

            let snapshot: Vec<(String, StepStatus)> =
                steps.iter().map(|s| (s.id.clone(), s.status)).collect();
            if previous_snapshot.as_ref() == Some(&snapshot) {
                return Ok(refreshed);
            }
            previous_snapshot = Some(snapshot);
            now += 1_000;
        }

        self.get_plan(plan_id).await
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Plan, CadenceError> {
        self.store
            .get_plan(plan_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| CadenceError::Internal {
                message: format!("unknown plan `{plan_id}`"),
            })
    }

    async fn complete_plan(&self, plan_id: &str, now: i64) -> Result<Plan, CadenceError> {
        let mut plan = self.get_plan(plan_id).await?;
        plan.status = PlanStatus::Completed;
        plan.updated_at = now;
        self.store.put_plan(&plan).await.map_err(internal)?;
        self.store
            .event("coordinator", "plan.completed", serde_json::json!({"planId": plan_id}))
            .await
            .map_err(internal)?;

        cadence_observability::emit_event(
            Level::INFO,
            cadence_observability::ProcessKind::Coordinator,
            cadence_observability::ObservabilityEvent {
                event: "plan.completed",
                component: "coordinator",
                correlation_id: Some(plan_id),
                session_id: None,
                run_id: None,
                message_id: None,
                provider_id: None,
                model_id: None,
                status: Some("completed"),
                error_code: None,
                detail: None,
            },
        );

        Ok(plan)
    }

    pub async fn cancel_plan(&self, plan_id: &str, now: i64) -> Result<(), CadenceError> {
        self.scheduler.cancel_plan(plan_id, now).await
    }

    /// The judge/context external-collaborator contracts: a
    /// caller escalating a verification decision, or a planner step
    /// needing supplemental materials, reaches them through here rather
    /// than through the dispatch loop directly.
    pub async fn adjudicate(
        &self,
        step_id: &str,
        inputs: &Value,
        outputs: &Value,
    ) -> Result<JudgeVerdict, CadenceError> {
        self.judge.adjudicate(step_id, inputs, outputs).await
    }

    pub async fn retrieve_context(&self, capability: &str, query: &Value) -> Result<Vec<Value>, CadenceError> {
        self.context.retrieve(capability, query).await
    }

    // -- Read models -------------------------------------------------------

    pub async fn metrics_dashboard(&self) -> Result<MetricsDashboard, CadenceError> {
        let all_plans = self.store.list_all_plans().await.map_err(internal)?;
        let active_plan_count = all_plans
            .iter()
            .filter(|p| p.status == PlanStatus::Active)
            .count() as u64;
        let mut counts = StepCounts {
            todo: 0,
            in_progress: 0,
            blocked: 0,
            waiting_review: 0,
            done: 0,
            failed: 0,
        };
        let mut total_attestations = 0u64;
        for plan in &all_plans {
            let steps = self.store.list_steps_for_plan(&plan.id).await.map_err(internal)?;
            for step in &steps {
                match step.status {
                    StepStatus::Todo => counts.todo += 1,
                    StepStatus::InProgress => counts.in_progress += 1,
                    StepStatus::Blocked => counts.blocked += 1,
                    StepStatus::WaitingReview => counts.waiting_review += 1,
                    StepStatus::Done => counts.done += 1,
                    StepStatus::Failed => counts.failed += 1,
                }
                total_attestations += self
                    .store
                    .attestations_for_step(&step.id)
                    .await
                    .map_err(internal)?
                    .len() as u64;
            }
        }
        Ok(MetricsDashboard {
            active_plan_count,
            step_counts: counts,
            total_attestations,
        })
    }

    pub async fn events_stream(&self, limit: u32) -> Result<EventsStream, CadenceError> {
        self.store.recent_events(limit).await.map_err(internal)
    }

    pub async fn active_plans(&self) -> Result<ActivePlans, CadenceError> {
        self.store.list_active_plans().await.map_err(internal)
    }

    pub async fn routes_health(&self, capability: &str, now: i64) -> Result<Vec<RouteHealth>, CadenceError> {
        let routes = self
            .store
            .routes_for_capability(capability)
            .await
            .map_err(internal)?;
        let mut health = Vec::with_capacity(routes.len());
        for route in routes {
            let learning = self.store.get_learning(&route.id).await.map_err(internal)?;
            let circuit_open = self.router.is_circuit_open(&route.id, now).await;
            let total_pulls = self.store.total_pulls(&route.capability).await.map_err(internal)?;
            health.push(RouteHealth {
                route_id: route.id.clone(),
                capability: route.capability.clone(),
                healthy: route.healthy,
                circuit_open,
                posterior_mean: learning.map(|l| l.posterior_mean()).unwrap_or(0.5),
                total_pulls,
            });
        }
        Ok(health)
    }
}
