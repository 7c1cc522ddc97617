//! Hierarchical task network decomposition (component D). A registry maps
//! a classified goal to an ordered (by priority) list of decomposition
//! methods; each method optionally guards on the plan context and expands
//! a goal into a step list. Grounded on the registry-of-strategies shape
//! used by `tandem-orchestrator`'s skill/template lookups, generalized
//! here to hold closures instead of static template records.

use std::collections::HashMap;

use cadence_types::{IoContract, LeaseFields, Step, StepStatus};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GoalClass {
    Develop,
    Analyze,
    Fix,
    Deploy,
    Generic,
}

/// `implement/build/create` → develop; `analyze/research` → analyze;
/// `fix/debug/resolve` → fix; `deploy/release` → deploy; else generic.
pub fn classify_goal(goal: &str) -> GoalClass {
    let lower = goal.to_ascii_lowercase();
    const DEVELOP: &[&str] = &["implement", "build", "create"];
    const ANALYZE: &[&str] = &["analyze", "research"];
    const FIX: &[&str] = &["fix", "debug", "resolve"];
    const DEPLOY: &[&str] = &["deploy", "release"];

    if DEVELOP.iter().any(|k| lower.contains(k)) {
        GoalClass::Develop
    } else if ANALYZE.iter().any(|k| lower.contains(k)) {
        GoalClass::Analyze
    } else if FIX.iter().any(|k| lower.contains(k)) {
        GoalClass::Fix
    } else if DEPLOY.iter().any(|k| lower.contains(k)) {
        GoalClass::Deploy
    } else {
        GoalClass::Generic
    }
}

pub type Guard = Box<dyn Fn(&HashMap<String, Value>) -> bool + Send + Sync>;
pub type Decomposer =
    Box<dyn Fn(&str, &str, &HashMap<String, Value>) -> Vec<Step> + Send + Sync>;

pub struct DecompositionMethod {
    pub name: String,
    pub priority: i32,
    pub guard: Option<Guard>,
    pub decompose: Decomposer,
}

impl DecompositionMethod {
    fn applies(&self, context: &HashMap<String, Value>) -> bool {
        self.guard.as_ref().map(|g| g(context)).unwrap_or(true)
    }
}

pub struct MethodRegistry {
    methods: HashMap<GoalClass, Vec<DecompositionMethod>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    pub fn register(&mut self, class: GoalClass, method: DecompositionMethod) {
        let entries = self.methods.entry(class).or_default();
        entries.push(method);
        entries.sort_by_key(|m| -m.priority);
    }

    /// Builds the registry with one built-in method per goal class: a
    /// fixed keyword → capability-sequence mapping per class.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(
            GoalClass::Develop,
            DecompositionMethod {
                name: "develop.default".into(),
                priority: 10,
                guard: None,
                decompose: Box::new(|plan_id, goal, _ctx| {
                    make_steps(
                        plan_id,
                        &[
                            ("context.analyze", &[], false),
                            ("design.create", &["context.analyze"], false),
                            ("code.implement", &["design.create"], true),
                            ("code.verify", &["code.implement"], true),
                        ],
                        goal,
                    )
                }),
            },
        );

        registry.register(
            GoalClass::Analyze,
            DecompositionMethod {
                name: "analyze.default".into(),
                priority: 10,
                guard: None,
                decompose: Box::new(|plan_id, goal, _ctx| {
                    make_steps(
                        plan_id,
                        &[
                            ("context.gather", &[], false),
                            ("analysis.perform", &["context.gather"], false),
                            ("analysis.report", &["analysis.perform"], false),
                        ],
                        goal,
                    )
                }),
            },
        );

        registry.register(
            GoalClass::Fix,
            DecompositionMethod {
                name: "fix.default".into(),
                priority: 10,
                guard: None,
                decompose: Box::new(|plan_id, goal, _ctx| {
                    make_steps(
                        plan_id,
                        &[
                            ("context.analyze", &[], false),
                            ("diagnosis.identify", &["context.analyze"], false),
                            ("code.implement", &["diagnosis.identify"], true),
                            ("code.verify", &["code.implement"], true),
                        ],
                        goal,
                    )
                }),
            },
        );

        registry.register(
            GoalClass::Deploy,
            DecompositionMethod {
                name: "deploy.default".into(),
                priority: 10,
                guard: None,
                decompose: Box::new(|plan_id, goal, _ctx| {
                    make_steps(
                        plan_id,
                        &[
                            ("context.analyze", &[], false),
                            ("deploy.prepare", &["context.analyze"], false),
                            ("deploy.production", &["deploy.prepare"], true),
                            ("monitoring.setup", &["deploy.production"], false),
                        ],
                        goal,
                    )
                }),
            },
        );

        registry
    }

    /// Classifies `goal`, tries that class's methods in priority order
    /// (skipping methods whose guard fails, or whose emitted steps fail
    /// `cadence-dsl` validation), and falls back to a generic three-step
    /// decomposition (`context.build` → `work.plan` → `work.execute`).
    pub fn decompose(&self, plan_id: &str, goal: &str, context: &HashMap<String, Value>) -> Vec<Step> {
        let class = classify_goal(goal);
        if let Some(methods) = self.methods.get(&class) {
            for method in methods {
                if !method.applies(context) {
                    continue;
                }
                let steps = (method.decompose)(plan_id, goal, context);
                if cadence_dsl::validate_steps(&steps).is_ok() {
                    return steps;
                }
                tracing::warn!(method = %method.name, "decomposition method produced invalid steps, trying next");
            }
        }
        generic_fallback(plan_id, goal)
    }
}

fn generic_fallback(plan_id: &str, goal: &str) -> Vec<Step> {
    make_steps(
        plan_id,
        &[
            ("context.build", &[], false),
            ("work.plan", &["context.build"], false),
            ("work.execute", &["work.plan"], false),
        ],
        goal,
    )
}

fn make_steps(plan_id: &str, specs: &[(&str, &[&str], bool)], goal: &str) -> Vec<Step> {
    let now = cadence_types::now_ms();
    let mut id_by_capability = HashMap::new();
    let mut steps = Vec::with_capacity(specs.len());

    for (order_index, (capability, _, _)) in specs.iter().enumerate() {
        let id = format!("step-{}", Uuid::new_v4());
        id_by_capability.insert(*capability, id.clone());
        steps.push((id, *capability, order_index));
    }

    specs
        .iter()
        .zip(steps.into_iter())
        .map(|((capability, deps, critical), (id, _, order_index))| {
            let dependencies = deps
                .iter()
                .filter_map(|dep| id_by_capability.get(dep).cloned())
                .collect();
            Step {
                id,
                plan_id: plan_id.to_string(),
                capability: capability.to_string(),
                critical: *critical,
                priority: cadence_types::default_priority(),
                contract: IoContract::default(),
                constraints: None,
                dependencies,
                parallel_group: None,
                timeout_ms: cadence_types::default_timeout_ms(),
                retry_count: cadence_types::default_retry_count(),
                status: StepStatus::Todo,
                assignee: None,
                lease: LeaseFields::default(),
                branch: None,
                parent_step_id: None,
                order_index: order_index as u32,
                created_at: now,
                updated_at: now,
                metadata: HashMap::from([("goal".to_string(), Value::String(goal.to_string()))]),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_keyword() {
        assert_eq!(classify_goal("implement a login flow"), GoalClass::Develop);
        assert_eq!(classify_goal("analyze the latency regression"), GoalClass::Analyze);
        assert_eq!(classify_goal("fix the flaky test"), GoalClass::Fix);
        assert_eq!(classify_goal("deploy the new release"), GoalClass::Deploy);
        assert_eq!(classify_goal("say hello"), GoalClass::Generic);
    }

    #[test]
    fn develop_goal_decomposes_into_validated_steps() {
        let registry = MethodRegistry::with_builtins();
        let steps = registry.decompose("p1", "implement user auth", &HashMap::new());
        assert_eq!(steps.len(), 4);
        assert!(cadence_dsl::validate_steps(&steps).is_ok());
        let caps: Vec<&str> = steps.iter().map(|s| s.capability.as_str()).collect();
        assert_eq!(
            caps,
            vec!["context.analyze", "design.create", "code.implement", "code.verify"]
        );
    }

    #[test]
    fn unclassified_goal_falls_back_to_generic() {
        let registry = MethodRegistry::with_builtins();
        let steps = registry.decompose("p1", "say hello to the team", &HashMap::new());
        let caps: Vec<&str> = steps.iter().map(|s| s.capability.as_str()).collect();
        assert_eq!(caps, vec!["context.build", "work.plan", "work.execute"]);
    }
}
