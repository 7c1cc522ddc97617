//! Rule-string policy engine (component C). Evaluates `{allow[], deny[],
//! require[]}` string rules against a `PolicyContext`, producing a
//! `PolicyDecision`. Grounded on the gating shape of
//! `tandem-orchestrator::agent_team::SpawnPolicy::evaluate` (policy object
//! + request context in, a structured allow/deny decision out) but with a
//! small condition-expression grammar in place of that function's
//! hand-coded field checks, since this engine's rules are data, not code.

use std::collections::HashMap;

use cadence_types::{PolicyContext, PolicyDecision, PolicyDefinition};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    In {
        path: String,
        values: Vec<Value>,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    /// A condition that failed to parse. Evaluates to `false` everywhere;
    /// callers invert as needed to get the fail-safe deny/allow behavior.
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub clause: String,
    pub condition: Option<Condition>,
}

/// Parses `<clause> [IF <condition>]`. Never returns `Err`: a rule that
/// doesn't fit the grammar becomes a `Rule` whose condition is
/// `Some(Condition::Malformed(..))`, which the evaluator treats fail-safe.
pub fn parse_rule(raw: &str) -> Rule {
    let raw = raw.trim();
    match split_on_if(raw) {
        Some((clause, cond_src)) => {
            let condition = parse_condition(cond_src.trim());
            if let Condition::Malformed(reason) = &condition {
                warn!(rule = %raw, %reason, "malformed rule condition, treating fail-safe");
            }
            Rule {
                clause: clause.trim().to_string(),
                condition: Some(condition),
            }
        }
        None => Rule {
            clause: raw.to_string(),
            condition: None,
        },
    }
}

fn split_on_if(raw: &str) -> Option<(&str, &str)> {
    let upper = raw.to_ascii_uppercase();
    upper.find(" IF ").map(|idx| (&raw[..idx], &raw[idx + 4..]))
}

fn parse_condition(src: &str) -> Condition {
    if src.is_empty() {
        return Condition::Malformed("empty condition".into());
    }
    parse_or(src)
}

fn parse_or(src: &str) -> Condition {
    if let Some((lhs, rhs)) = split_top_level(src, " OR ") {
        Condition::Or(Box::new(parse_and(lhs)), Box::new(parse_or(rhs)))
    } else {
        parse_and(src)
    }
}

fn parse_and(src: &str) -> Condition {
    if let Some((lhs, rhs)) = split_top_level(src, " AND ") {
        Condition::And(Box::new(parse_cmp(lhs)), Box::new(parse_and(rhs)))
    } else {
        parse_cmp(src)
    }
}

/// Splits on the first occurrence of `sep` (case-insensitively), ignoring
/// separators inside a `[...]` membership list.
fn split_top_level<'a>(src: &'a str, sep: &str) -> Option<(&'a str, &'a str)> {
    let upper = src.to_ascii_uppercase();
    let sep_upper = sep.to_ascii_uppercase();
    let mut depth = 0i32;
    let bytes = upper.as_bytes();
    let sep_bytes = sep_upper.as_bytes();
    let mut i = 0usize;
    while i + sep_bytes.len() <= bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth -= 1,
            _ => {}
        }
        if depth == 0 && bytes[i..i + sep_bytes.len()] == *sep_bytes {
            return Some((&src[..i], &src[i + sep.len()..]));
        }
        i += 1;
    }
    None
}

fn parse_cmp(src: &str) -> Condition {
    let src = src.trim();
    for (token, op) in [
        ("<=", Some(CompareOp::Le)),
        (">=", Some(CompareOp::Ge)),
        ("==", Some(CompareOp::Eq)),
        ("!=", Some(CompareOp::Ne)),
        ("<", Some(CompareOp::Lt)),
        (">", Some(CompareOp::Gt)),
    ] {
        if let Some(idx) = src.find(token) {
            let path = src[..idx].trim().to_string();
            let value_src = src[idx + token.len()..].trim();
            if path.is_empty() || value_src.is_empty() {
                return Condition::Malformed(src.to_string());
            }
            let value = parse_scalar(value_src);
            return Condition::Compare {
                path,
                op: op.unwrap(),
                value,
            };
        }
    }
    if let Some(idx) = src.to_ascii_uppercase().find(" IN ") {
        let path = src[..idx].trim().to_string();
        let list_src = src[idx + 4..].trim();
        if let Some(values) = parse_list(list_src) {
            return Condition::In { path, values };
        }
        return Condition::Malformed(src.to_string());
    }
    Condition::Malformed(src.to_string())
}

fn parse_list(src: &str) -> Option<Vec<Value>> {
    let inner = src.strip_prefix('[')?.strip_suffix(']')?;
    Some(
        inner
            .split(',')
            .map(|s| parse_scalar(s.trim()))
            .collect(),
    )
}

fn parse_scalar(src: &str) -> Value {
    let unquoted = src.trim().trim_matches('"').trim_matches('\'');
    if let Ok(n) = unquoted.parse::<f64>() {
        return serde_json::json!(n);
    }
    if unquoted.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if unquoted.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(unquoted.to_string())
}

/// Evaluates a bare clause (no `IF`) as a condition expression, fail-safe
/// false on a malformed clause. Used to check whether a `require`
/// obligation's own text — e.g. `"attestation_level >= 2"` — actually
/// holds against a post-execution context, as opposed to `rule_fires`,
/// which only decides whether the obligation applies.
pub fn evaluate_clause(ctx: &PolicyContext, clause: &str) -> bool {
    match parse_condition(clause.trim()) {
        Condition::Malformed(_) => false,
        cond => eval_condition(ctx, &cond),
    }
}

/// Resolves a dotted name against the well-known `PolicyContext` fields,
/// falling back to `extra` for anything else.
pub fn resolve_path(ctx: &PolicyContext, path: &str) -> Option<Value> {
    match path {
        "capability" => Some(Value::String(ctx.capability.clone())),
        "step_cost" => Some(serde_json::json!(ctx.step_cost)),
        "cumulative_cost" => Some(serde_json::json!(ctx.cumulative_cost)),
        "elapsed_ms" => Some(serde_json::json!(ctx.elapsed_ms)),
        "user" => ctx.user.clone().map(Value::String),
        "project" => ctx.project.clone().map(Value::String),
        "environment" => ctx.environment.clone().map(Value::String),
        "security_level" => ctx.security_level.clone().map(Value::String),
        "critical" => Some(Value::Bool(ctx.critical)),
        other => lookup_extra(&ctx.extra, other),
    }
}

fn lookup_extra(extra: &HashMap<String, Value>, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = extra.get(first)?.clone();
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

fn compare(a: &Value, op: &CompareOp, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return match op {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
        };
    }
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        _ => false,
    }
}

/// Evaluates a condition fail-safe: malformed sub-expressions are `false`.
pub fn eval_condition(ctx: &PolicyContext, cond: &Condition) -> bool {
    match cond {
        Condition::Malformed(_) => false,
        Condition::Compare { path, op, value } => match resolve_path(ctx, path) {
            Some(actual) => compare(&actual, op, value),
            None => false,
        },
        Condition::In { path, values } => match resolve_path(ctx, path) {
            Some(actual) => values.iter().any(|v| v == &actual),
            None => false,
        },
        Condition::And(a, b) => eval_condition(ctx, a) && eval_condition(ctx, b),
        Condition::Or(a, b) => eval_condition(ctx, a) || eval_condition(ctx, b),
    }
}

fn clause_matches(clause: &str, capability: &str) -> bool {
    clause == "*" || clause == capability
}

/// A malformed rule's clause-match is unaffected; only its *condition*
/// fails safe: allow-clauses evaluate false, deny-clauses evaluate true,
/// so a matching malformed allow rule never grants, and a matching
/// malformed deny rule always denies.
fn rule_fires(ctx: &PolicyContext, rule: &Rule, fail_safe_value: bool) -> bool {
    if !clause_matches(&rule.clause, &ctx.capability) {
        return false;
    }
    condition_holds(ctx, &rule.condition, fail_safe_value)
}

/// A `require` rule's clause is obligation text, not a capability name,
/// so it is never matched against `ctx.capability` — only its `IF`
/// condition gates whether it fires.
fn obligation_fires(ctx: &PolicyContext, rule: &Rule) -> bool {
    condition_holds(ctx, &rule.condition, true)
}

fn condition_holds(ctx: &PolicyContext, condition: &Option<Condition>, fail_safe_value: bool) -> bool {
    match condition {
        None => true,
        Some(Condition::Malformed(_)) => fail_safe_value,
        Some(cond) => eval_condition(ctx, cond),
    }
}

/// Evaluates a `PolicyDefinition` against a `PolicyContext`. `deny`
/// matches override `allow` matches; if any `allow` rule targets this
/// capability and none of them fires, the result defaults to denied
/// (default-deny under an allow-list); if there are no `allow` rules at
/// all, the default is allow. `require` rules never gate the decision —
/// their clauses that fire become obligations on the returned decision.
pub fn evaluate(ctx: &PolicyContext, policy: &PolicyDefinition) -> PolicyDecision {
    for raw in &policy.deny {
        let rule = parse_rule(raw);
        if rule_fires(ctx, &rule, true) {
            return PolicyDecision::deny(raw.clone());
        }
    }

    let allow_rules: Vec<Rule> = policy.allow.iter().map(|r| parse_rule(r)).collect();
    let relevant_allow: Vec<&Rule> = allow_rules
        .iter()
        .filter(|r| clause_matches(&r.clause, &ctx.capability))
        .collect();

    let mut matched_allow = None;
    let allowed = if relevant_allow.is_empty() {
        true
    } else {
        let mut any_fired = false;
        for (raw, rule) in policy.allow.iter().zip(allow_rules.iter()) {
            if clause_matches(&rule.clause, &ctx.capability) && rule_fires(ctx, rule, false) {
                any_fired = true;
                matched_allow = Some(raw.clone());
                break;
            }
        }
        any_fired
    };

    let obligations: Vec<String> = policy
        .require
        .iter()
        .filter(|raw| obligation_fires(ctx, &parse_rule(raw)))
        .cloned()
        .collect();

    if allowed {
        PolicyDecision {
            allowed: true,
            matched_deny: None,
            matched_allow,
            obligations,
        }
    } else {
        PolicyDecision {
            allowed: false,
            matched_deny: None,
            matched_allow: None,
            obligations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::PolicyDefinition;

    fn ctx(capability: &str) -> PolicyContext {
        PolicyContext {
            capability: capability.into(),
            step_cost: 1.0,
            cumulative_cost: 5.0,
            elapsed_ms: 1_000.0,
            user: Some("alice".into()),
            project: Some("demo".into()),
            environment: Some("staging".into()),
            security_level: Some("standard".into()),
            critical: false,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn unconditional_rule_always_fires() {
        let def = PolicyDefinition {
            allow: vec![],
            deny: vec!["deploy.release".into()],
            require: vec![],
        };
        let decision = evaluate(&ctx("deploy.release"), &def);
        assert!(!decision.allowed);
        assert_eq!(decision.matched_deny.as_deref(), Some("deploy.release"));
    }

    #[test]
    fn deny_overrides_allow() {
        let def = PolicyDefinition {
            allow: vec!["deploy.release".into()],
            deny: vec!["deploy.release IF environment == production".into()],
            require: vec![],
        };
        let mut context = ctx("deploy.release");
        context.environment = Some("production".into());
        let decision = evaluate(&context, &def);
        assert!(!decision.allowed);
    }

    #[test]
    fn default_deny_under_allowlist() {
        let def = PolicyDefinition {
            allow: vec!["deploy.release IF environment == production".into()],
            deny: vec![],
            require: vec![],
        };
        let decision = evaluate(&ctx("deploy.release"), &def);
        assert!(!decision.allowed);
    }

    #[test]
    fn default_allow_without_any_allow_rules() {
        let def = PolicyDefinition {
            allow: vec![],
            deny: vec![],
            require: vec![],
        };
        assert!(evaluate(&ctx("context.build"), &def).allowed);
    }

    #[test]
    fn malformed_deny_rule_fails_safe_to_deny() {
        let def = PolicyDefinition {
            allow: vec![],
            deny: vec!["deploy.release IF environment ===".into()],
            require: vec![],
        };
        let decision = evaluate(&ctx("deploy.release"), &def);
        assert!(!decision.allowed);
    }

    #[test]
    fn malformed_allow_rule_fails_safe_to_deny() {
        let def = PolicyDefinition {
            allow: vec!["deploy.release IF environment ===".into()],
            deny: vec![],
            require: vec![],
        };
        let decision = evaluate(&ctx("deploy.release"), &def);
        assert!(!decision.allowed);
    }

    #[test]
    fn in_clause_and_boolean_connectives() {
        let def = PolicyDefinition {
            allow: vec!["commit_result IF environment in [staging, production] AND critical == false".into()],
            deny: vec![],
            require: vec![],
        };
        assert!(evaluate(&ctx("commit_result"), &def).allowed);
    }

    #[test]
    fn require_rules_surface_as_obligations_without_gating() {
        let def = PolicyDefinition {
            allow: vec![],
            deny: vec![],
            require: vec!["attestation_level >= 2 IF capability == commit_result".into()],
        };
        let decision = evaluate(&ctx("commit_result"), &def);
        assert!(decision.allowed);
        assert_eq!(decision.obligations.len(), 1);
    }

    #[test]
    fn evaluate_clause_checks_the_obligation_text_itself() {
        let mut context = ctx("commit_result");
        context.extra.insert("attestation_level".into(), serde_json::json!(3));
        assert!(evaluate_clause(&context, "attestation_level >= 2"));
        context.extra.insert("attestation_level".into(), serde_json::json!(1));
        assert!(!evaluate_clause(&context, "attestation_level >= 2"));
    }
}
