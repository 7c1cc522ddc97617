//! Tree-of-thought planner (component E): beam search over alternative
//! step lists, each scored on five axes and combined into a single
//! composite score. Grounded on the generate/score/select loop shape in
//! `tandem-orchestrator`'s decision structuring, adapted here to operate
//! over step-list candidates instead of agent-spawn candidates.

use std::collections::HashSet;

use cadence_types::{Branch, IoContract, Step};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BeamConfig {
    pub beam_size: usize,
    pub max_depth: usize,
    pub branch_factor: usize,
    pub min_score_threshold: f64,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            beam_size: 3,
            max_depth: 5,
            branch_factor: 3,
            min_score_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub feasibility: f64,
    pub efficiency: f64,
    pub risk: f64,
    pub novelty: f64,
    pub completeness: f64,
}

impl Evaluation {
    /// `0.3*feasibility + 0.2*efficiency + 0.2*(1-risk) + 0.1*novelty +
    /// 0.2*completeness`.
    pub fn composite(&self) -> f64 {
        0.3 * self.feasibility
            + 0.2 * self.efficiency
            + 0.2 * (1.0 - self.risk)
            + 0.1 * self.novelty
            + 0.2 * self.completeness
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub steps: Vec<Step>,
    pub evaluation: Evaluation,
    pub depth: usize,
}

fn is_over_deep(capability: &str) -> bool {
    capability.matches('.').count() >= 3
}

fn has_tight_cost_constraint(step: &Step) -> bool {
    step.constraints
        .as_ref()
        .and_then(|c| c.max_cost)
        .map(|c| c < 1.0)
        .unwrap_or(false)
}

fn is_sub_30s_timeout(step: &Step) -> bool {
    step.timeout_ms < 30_000
}

fn score_feasibility(steps: &[Step]) -> f64 {
    let mut score = 1.0;
    for step in steps {
        if is_over_deep(&step.capability) {
            score *= 0.9;
        }
        if has_tight_cost_constraint(step) {
            score *= 0.8;
        }
        if is_sub_30s_timeout(step) {
            score *= 0.9;
        }
    }
    score
}

fn score_efficiency(steps: &[Step]) -> f64 {
    let n = steps.len() as f64;
    let mut score = (1.0 - (n - 3.0) * 0.1).max(0.1);
    if steps.iter().any(|s| s.parallel_group.is_some()) {
        score *= 1.2;
    }
    let critical_ratio = if steps.is_empty() {
        0.0
    } else {
        steps.iter().filter(|s| s.critical).count() as f64 / n
    };
    if critical_ratio > 0.1 && critical_ratio < 0.5 {
        score *= 1.1;
    }
    score
}

fn score_risk(steps: &[Step]) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let mut raw = 0.0;
    for step in steps {
        if step.critical {
            raw += 0.2;
        }
        if step.capability.contains("deploy") || step.capability.contains("delete") {
            raw += 0.3;
        }
        if step.retry_count < 2 {
            raw += 0.1;
        }
    }
    (raw / steps.len() as f64).clamp(0.0, 1.0)
}

fn score_novelty(steps: &[Step]) -> f64 {
    let mut score = 0.5;
    if steps.iter().any(|s| s.parallel_group.is_some()) {
        score += 0.1;
    }
    if steps.iter().any(|s| s.capability.contains("validation")) {
        score += 0.1;
    }
    if steps.iter().any(|s| s.capability.contains("monitoring")) {
        score += 0.1;
    }
    if steps.iter().any(|s| s.capability.contains("rollback")) {
        score += 0.1;
    }
    score
}

fn score_completeness(steps: &[Step], is_deploy_goal: bool) -> f64 {
    let mut score = 0.5;
    if steps.iter().any(|s| s.capability.contains("context")) {
        score += 0.15;
    }
    if steps.iter().any(|s| s.capability.contains("validation")) {
        score += 0.15;
    }
    if steps
        .iter()
        .any(|s| s.capability.contains("error") || s.retry_count > 0)
    {
        score += 0.1;
    }
    if is_deploy_goal && steps.iter().any(|s| s.capability.contains("deploy")) {
        score += 0.1;
    }
    score
}

pub fn evaluate(steps: &[Step], is_deploy_goal: bool) -> Evaluation {
    Evaluation {
        feasibility: score_feasibility(steps),
        efficiency: score_efficiency(steps),
        risk: score_risk(steps),
        novelty: score_novelty(steps),
        completeness: score_completeness(steps, is_deploy_goal),
    }
}

/// The five expansion strategies, each producing zero or one child
/// candidate step list from a parent.
fn expand(steps: &[Step]) -> Vec<Vec<Step>> {
    let mut children = Vec::new();

    // 1. group independent consecutive steps into a shared parallel group.
    if let Some(child) = group_independent_consecutive(steps) {
        children.push(child);
    }

    // 2. insert validation.verify after every critical step.
    children.push(insert_verification_after_critical(steps));

    // 3. raise retry_count for critical steps, add rollback.prepare after deploys.
    children.push(harden_critical_and_deploy_steps(steps));

    // 4. tighten cost/latency/timeout caps.
    children.push(tighten_constraints(steps));

    // 5. prepend monitoring.setup as a dependency of all subsequent steps.
    children.push(prepend_monitoring(steps));

    children
}

fn group_independent_consecutive(steps: &[Step]) -> Option<Vec<Step>> {
    let mut out = steps.to_vec();
    for window in 0..out.len().saturating_sub(1) {
        let (a, b) = (&out[window], &out[window + 1]);
        if a.parallel_group.is_none()
            && b.parallel_group.is_none()
            && !b.dependencies.contains(&a.id)
        {
            let group = format!("pg-{}", Uuid::new_v4());
            out[window].parallel_group = Some(group.clone());
            out[window + 1].parallel_group = Some(group);
            return Some(out);
        }
    }
    None
}

fn insert_verification_after_critical(steps: &[Step]) -> Vec<Step> {
    let now = cadence_types::now_ms();
    let mut out = Vec::new();
    for step in steps {
        let was_critical = step.critical;
        let id = step.id.clone();
        out.push(step.clone());
        if was_critical {
            out.push(synthetic_step(
                "validation.verify",
                &step.plan_id,
                vec![id],
                false,
                out.len() as u32,
                now,
            ));
        }
    }
    reindex(out)
}

fn harden_critical_and_deploy_steps(steps: &[Step]) -> Vec<Step> {
    let now = cadence_types::now_ms();
    let mut out = Vec::new();
    for step in steps {
        let mut step = step.clone();
        let is_deploy = step.capability.contains("deploy");
        if step.critical {
            step.retry_count = step.retry_count.max(3);
        }
        let id = step.id.clone();
        out.push(step);
        if is_deploy {
            out.push(synthetic_step(
                "rollback.prepare",
                &out.last().unwrap().plan_id,
                vec![id],
                true,
                out.len() as u32,
                now,
            ));
        }
    }
    reindex(out)
}

fn tighten_constraints(steps: &[Step]) -> Vec<Step> {
    steps
        .iter()
        .cloned()
        .map(|mut step| {
            let mut constraints = step.constraints.unwrap_or_default();
            constraints.max_cost = Some(constraints.max_cost.unwrap_or(10.0).min(5.0));
            constraints.max_latency_ms = Some(constraints.max_latency_ms.unwrap_or(30_000).min(15_000));
            step.constraints = Some(constraints);
            step.timeout_ms = step.timeout_ms.min(60_000);
            step
        })
        .collect()
}

fn prepend_monitoring(steps: &[Step]) -> Vec<Step> {
    if steps.is_empty() {
        return steps.to_vec();
    }
    let now = cadence_types::now_ms();
    let plan_id = steps[0].plan_id.clone();
    let monitor_id = format!("step-{}", Uuid::new_v4());
    let monitor = Step {
        id: monitor_id.clone(),
        ..synthetic_step("monitoring.setup", &plan_id, vec![], false, 0, now)
    };
    let mut out = vec![monitor];
    for mut step in steps.iter().cloned() {
        step.dependencies.insert(monitor_id.clone());
        out.push(step);
    }
    reindex(out)
}

fn reindex(mut steps: Vec<Step>) -> Vec<Step> {
    for (idx, step) in steps.iter_mut().enumerate() {
        step.order_index = idx as u32;
    }
    steps
}

fn synthetic_step(
    capability: &str,
    plan_id: &str,
    dependencies: Vec<String>,
    critical: bool,
    order_index: u32,
    now: i64,
) -> Step {
    Step {
        id: format!("step-{}", Uuid::new_v4()),
        plan_id: plan_id.to_string(),
        capability: capability.to_string(),
        critical,
        priority: cadence_types::default_priority(),
        contract: IoContract::default(),
        constraints: None,
        dependencies: dependencies.into_iter().collect::<HashSet<_>>(),
        parallel_group: None,
        timeout_ms: cadence_types::default_timeout_ms(),
        retry_count: cadence_types::default_retry_count(),
        status: cadence_types::StepStatus::Todo,
        assignee: None,
        lease: Default::default(),
        branch: None,
        parent_step_id: None,
        order_index,
        created_at: now,
        updated_at: now,
        metadata: Default::default(),
    }
}

/// Expands a single frontier node, keeping at most `branch_factor`
/// children ranked by score, so one high-scoring node can't crowd out
/// every other node's offspring once candidates are pooled.
fn expand_node(node: &Node, config: &BeamConfig, is_deploy_goal: bool, depth: usize) -> Vec<Node> {
    let mut children: Vec<Node> = expand(&node.steps)
        .into_iter()
        .map(|child_steps| {
            let evaluation = evaluate(&child_steps, is_deploy_goal);
            Node {
                steps: child_steps,
                evaluation,
                depth,
            }
        })
        .collect();
    children.sort_by(|a, b| {
        b.evaluation
            .composite()
            .partial_cmp(&a.evaluation.composite())
            .unwrap()
    });
    children.truncate(config.branch_factor);
    children
}

/// Runs beam search starting from `seed`, returning the final frontier
/// (already sorted, best first) after `max_depth` rounds or early
/// termination once every node in the frontier falls below
/// `min_score_threshold`.
pub fn search(seed: Vec<Step>, config: &BeamConfig, is_deploy_goal: bool) -> Vec<Node> {
    let seed_eval = evaluate(&seed, is_deploy_goal);
    let mut frontier = vec![Node {
        steps: seed,
        evaluation: seed_eval,
        depth: 0,
    }];

    for depth in 1..=config.max_depth {
        if frontier
            .iter()
            .all(|n| n.evaluation.composite() < config.min_score_threshold)
        {
            break;
        }

        let mut candidates: Vec<Node> = Vec::new();
        for node in &frontier {
            candidates.extend(expand_node(node, config, is_deploy_goal, depth));
        }
        if candidates.is_empty() {
            break;
        }

        candidates.sort_by(|a, b| {
            b.evaluation
                .composite()
                .partial_cmp(&a.evaluation.composite())
                .unwrap()
        });
        frontier = candidates;
        frontier.truncate(config.beam_size);
    }

    frontier.sort_by(|a, b| {
        b.evaluation
            .composite()
            .partial_cmp(&a.evaluation.composite())
            .unwrap()
    });
    frontier
}

/// Materializes the final frontier as `Branch` records, the best scoring
/// node marked `active`.
pub fn materialize_branches(plan_id: &str, nodes: &[Node], parent_branch_id: Option<String>) -> Vec<Branch> {
    nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| Branch {
            id: format!("branch-{}", Uuid::new_v4()),
            plan_id: plan_id.to_string(),
            parent_branch_id: parent_branch_id.clone(),
            score: node.evaluation.composite(),
            rationale: vec![format!(
                "feasibility={:.2} efficiency={:.2} risk={:.2} novelty={:.2} completeness={:.2}",
                node.evaluation.feasibility,
                node.evaluation.efficiency,
                node.evaluation.risk,
                node.evaluation.novelty,
                node.evaluation.completeness
            )],
            step_ids: node.steps.iter().map(|s| s.id.clone()).collect(),
            active: idx == 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htn::MethodRegistry;
    use std::collections::HashMap;

    #[test]
    fn composite_score_weights_are_applied() {
        let eval = Evaluation {
            feasibility: 1.0,
            efficiency: 1.0,
            risk: 0.0,
            novelty: 1.0,
            completeness: 1.0,
        };
        assert!((eval.composite() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn beam_search_produces_a_ranked_frontier() {
        let registry = MethodRegistry::with_builtins();
        let seed = registry.decompose("p1", "deploy the release", &HashMap::new());
        let config = BeamConfig::default();
        let frontier = search(seed, &config, true);
        assert!(!frontier.is_empty());
        assert!(frontier.len() <= config.beam_size);
        for pair in frontier.windows(2) {
            assert!(pair[0].evaluation.composite() >= pair[1].evaluation.composite());
        }
    }

    #[test]
    fn expand_node_caps_children_at_branch_factor_regardless_of_frontier_size() {
        let registry = MethodRegistry::with_builtins();
        let seed = registry.decompose("p1", "deploy the release", &HashMap::new());
        let node = Node {
            evaluation: evaluate(&seed, true),
            steps: seed,
            depth: 0,
        };
        let config = BeamConfig {
            branch_factor: 2,
            ..BeamConfig::default()
        };
        let children = expand_node(&node, &config, true, 1);
        assert!(children.len() <= config.branch_factor);
    }

    #[test]
    fn second_round_candidate_pool_draws_from_every_first_round_node() {
        let registry = MethodRegistry::with_builtins();
        let seed = registry.decompose("p1", "deploy the release", &HashMap::new());
        let config = BeamConfig {
            beam_size: 4,
            max_depth: 1,
            branch_factor: 2,
            min_score_threshold: 0.0,
        };
        // One round from a single seed leaves a multi-node frontier.
        let first_round = search(seed, &config, true);
        assert!(first_round.len() > 1);

        // Every surviving first-round node contributes its own capped
        // batch of children; a global truncate-before-pooling bug could
        // let the top node's children fill the whole pool alone, leaving
        // the others empty here.
        for node in &first_round {
            let contributed = expand_node(node, &config, true, 2);
            assert!(
                !contributed.is_empty() && contributed.len() <= config.branch_factor
            );
        }
    }

    #[test]
    fn materialized_branches_mark_exactly_one_active() {
        let registry = MethodRegistry::with_builtins();
        let seed = registry.decompose("p1", "implement feature", &HashMap::new());
        let frontier = search(seed, &BeamConfig::default(), false);
        let branches = materialize_branches("p1", &frontier, None);
        assert_eq!(branches.iter().filter(|b| b.active).count(), 1);
        assert!(branches[0].active);
    }
}
