use std::collections::{HashMap, HashSet};

use cadence_types::{Branch, IoContract, Plan, Step};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static CAPABILITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(cadence_types::CAPABILITY_PATTERN).expect("valid pattern"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("missing required field '{field}'")]
    MissingField { field: String },
    #[error("step '{step_id}' depends on unknown step '{depends_on}'")]
    UnknownDependency { step_id: String, depends_on: String },
    #[error("step '{step_id}' depends on itself")]
    SelfDependency { step_id: String },
    #[error("dependency graph contains a cycle through step '{step_id}'")]
    CyclicDependency { step_id: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Normalizes defaults (priority=5, retry=2, timeout=300000, already the
/// struct defaults in `cadence-types`) and checks the structural
/// invariants from the data model.
pub fn validate_plan(plan: &Plan) -> Result<(), ValidationError> {
    if plan.id.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "id".into(),
        });
    }
    if plan.goal.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "goal".into(),
        });
    }
    if plan.owner.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "owner".into(),
        });
    }
    if plan.priority > 10 {
        return Err(invalid("priority", "must be in [0, 10]"));
    }
    if let Some(max_cost) = plan.budget.max_cost {
        if max_cost < 0.0 {
            return Err(invalid("budget.max_cost", "must be non-negative"));
        }
    }
    Ok(())
}

pub fn validate_io_contract(contract: &IoContract) -> Result<(), ValidationError> {
    for field in &contract.required_fields {
        if field.trim().is_empty() {
            return Err(invalid("contract.required_fields", "entries must be non-empty"));
        }
    }
    Ok(())
}

pub fn validate_step(step: &Step) -> Result<(), ValidationError> {
    if step.id.trim().is_empty() {
        return Err(ValidationError::MissingField { field: "id".into() });
    }
    if !CAPABILITY_RE.is_match(&step.capability) {
        return Err(invalid(
            "capability",
            "must match [a-z0-9_.-]+ (dotted namespace form)",
        ));
    }
    if step.priority > 10 {
        return Err(invalid("priority", "must be in [0, 10]"));
    }
    if step.timeout_ms == 0 {
        return Err(invalid("timeout_ms", "must be positive"));
    }
    if step.dependencies.contains(&step.id) {
        return Err(ValidationError::SelfDependency {
            step_id: step.id.clone(),
        });
    }
    validate_io_contract(&step.contract)?;
    Ok(())
}

/// Validates a full step set: each step individually, that every
/// declared dependency resolves to a step present in the same set, and
/// that the dependency graph is acyclic.
pub fn validate_steps(steps: &[Step]) -> Result<(), ValidationError> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for step in steps {
        validate_step(step)?;
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step_id: step.id.clone(),
                    depends_on: dep.clone(),
                });
            }
        }
    }
    check_acyclic(steps)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

/// DFS over the dependency edges (`step -> step.dependencies`), reporting
/// the first step found on a back-edge cycle.
fn check_acyclic(steps: &[Step]) -> Result<(), ValidationError> {
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut state: HashMap<&str, VisitState> = HashMap::new();

    for step in steps {
        if !state.contains_key(step.id.as_str()) {
            visit(step, &by_id, &mut state)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    step: &'a Step,
    by_id: &HashMap<&'a str, &'a Step>,
    state: &mut HashMap<&'a str, VisitState>,
) -> Result<(), ValidationError> {
    state.insert(step.id.as_str(), VisitState::Visiting);
    for dep in &step.dependencies {
        match state.get(dep.as_str()) {
            Some(VisitState::Visiting) => {
                return Err(ValidationError::CyclicDependency {
                    step_id: step.id.clone(),
                })
            }
            Some(VisitState::Done) => continue,
            None => {
                if let Some(dep_step) = by_id.get(dep.as_str()) {
                    visit(dep_step, by_id, state)?;
                }
            }
        }
    }
    state.insert(step.id.as_str(), VisitState::Done);
    Ok(())
}

pub fn validate_branch(branch: &Branch) -> Result<(), ValidationError> {
    if branch.id.trim().is_empty() {
        return Err(ValidationError::MissingField { field: "id".into() });
    }
    if !(0.0..=1.0).contains(&branch.score) {
        return Err(invalid("score", "must be in [0, 1]"));
    }
    if branch.step_ids.is_empty() {
        return Err(invalid("step_ids", "a branch must reference at least one step"));
    }
    Ok(())
}

/// A step is ready when every dependency id is already in `completed_ids`
/// and the step itself is still `todo`.
pub fn is_step_ready(step: &Step, completed_ids: &HashSet<String>) -> bool {
    step.status == cadence_types::StepStatus::Todo
        && step.dependencies.iter().all(|d| completed_ids.contains(d))
}

/// Groups ready steps by their `parallel_group`; steps without a group
/// each form a singleton group keyed by their own id, so callers can
/// treat "all members of a group" uniformly.
pub fn get_parallel_groups<'a>(steps: &'a [Step]) -> HashMap<String, Vec<&'a Step>> {
    let mut groups: HashMap<String, Vec<&Step>> = HashMap::new();
    for step in steps {
        let key = step.parallel_group.clone().unwrap_or_else(|| step.id.clone());
        groups.entry(key).or_default().push(step);
    }
    groups
}

/// `step.priority + (critical ? 3 : 0) + plan.priority * 0.1`, clamped to
/// `[0, 10]`.
pub fn calculate_step_priority(step: &Step, plan: &Plan) -> f64 {
    let raw = step.priority as f64
        + if step.critical { 3.0 } else { 0.0 }
        + plan.priority as f64 * 0.1;
    raw.clamp(0.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{LeaseFields, PlanBudget, PlanStatus, StepStatus};

    fn base_step(id: &str) -> Step {
        Step {
            id: id.into(),
            plan_id: "p1".into(),
            capability: "context.build".into(),
            critical: false,
            priority: 5,
            contract: IoContract::default(),
            constraints: None,
            dependencies: HashSet::new(),
            parallel_group: None,
            timeout_ms: 300_000,
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

    fn base_plan() -> Plan {
        Plan {
            id: "p1".into(),
            goal: "ship the thing".into(),
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

    #[test]
    fn rejects_bad_capability_names() {
        let mut step = base_step("s1");
        step.capability = "Context/Build".into();
        assert!(validate_step(&step).is_err());
    }

    #[test]
    fn rejects_self_dependency() {
        let mut step = base_step("s1");
        step.dependencies.insert("s1".into());
        assert_eq!(
            validate_step(&step),
            Err(ValidationError::SelfDependency { step_id: "s1".into() })
        );
    }

    #[test]
    fn detects_unknown_dependency_across_the_set() {
        let mut step = base_step("s2");
        step.dependencies.insert("s-missing".into());
        let err = validate_steps(&[base_step("s1"), step]).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownDependency { .. }));
    }

    #[test]
    fn priority_is_clamped() {
        let mut step = base_step("s1");
        step.priority = 10;
        step.critical = true;
        let plan = base_plan();
        assert_eq!(calculate_step_priority(&step, &plan), 10.0);
    }

    #[test]
    fn parallel_groups_singleton_fallback() {
        let s1 = base_step("s1");
        let mut s2 = base_step("s2");
        s2.parallel_group = Some("g1".into());
        let mut s3 = base_step("s3");
        s3.parallel_group = Some("g1".into());
        let groups = get_parallel_groups(&[s1, s2, s3]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.get("g1").map(|v| v.len()), Some(2));
    }

    #[test]
    fn detects_a_two_step_cycle() {
        let mut s1 = base_step("s1");
        s1.dependencies.insert("s2".into());
        let mut s2 = base_step("s2");
        s2.dependencies.insert("s1".into());
        let err = validate_steps(&[s1, s2]).unwrap_err();
        assert!(matches!(err, ValidationError::CyclicDependency { .. }));
    }

    #[test]
    fn accepts_a_diamond_shaped_graph() {
        let s1 = base_step("s1");
        let mut s2 = base_step("s2");
        s2.dependencies.insert("s1".into());
        let mut s3 = base_step("s3");
        s3.dependencies.insert("s1".into());
        let mut s4 = base_step("s4");
        s4.dependencies.insert("s2".into());
        s4.dependencies.insert("s3".into());
        assert!(validate_steps(&[s1, s2, s3, s4]).is_ok());
    }

    #[test]
    fn readiness_requires_all_dependencies_complete() {
        let mut step = base_step("s2");
        step.dependencies.insert("s1".into());
        let mut completed = HashSet::new();
        assert!(!is_step_ready(&step, &completed));
        completed.insert("s1".to_string());
        assert!(is_step_ready(&step, &completed));
    }
}
