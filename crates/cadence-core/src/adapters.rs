//! The two external collaborators specified only by interface: the
//! remote judge/adjudicator and the context-retrieval
//! peer. Neither ships a production client here — only the trait and a
//! `Null*` stub used by tests and the demonstration driver. The third
//! external adapter, execution (`ExecutionAdapter`), lives in
//! `cadence-scheduler` instead of here: `Coordinator` already depends on
//! `cadence-scheduler` to wire component G, and a trait defined in this
//! crate would make that a circular dependency.

use async_trait::async_trait;
use cadence_types::CadenceError;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub passed: bool,
    pub rationale: String,
}

/// A remote adjudicator consulted when `verification.enable_judge` is
/// set and the property registry alone can't settle a step.
#[async_trait]
pub trait JudgeAdapter: Send + Sync {
    async fn adjudicate(
        &self,
        step_id: &str,
        inputs: &Value,
        outputs: &Value,
    ) -> Result<JudgeVerdict, CadenceError>;
}

/// Always passes. Used where no judge is configured, and in tests.
pub struct NullJudge;

#[async_trait]
impl JudgeAdapter for NullJudge {
    async fn adjudicate(
        &self,
        _step_id: &str,
        _inputs: &Value,
        _outputs: &Value,
    ) -> Result<JudgeVerdict, CadenceError> {
        Ok(JudgeVerdict {
            passed: true,
            rationale: "no judge adapter configured".to_string(),
        })
    }
}

/// A context-retrieval peer consulted by the planner/scheduler for
/// supplemental materials.
#[async_trait]
pub trait ContextAdapter: Send + Sync {
    async fn retrieve(&self, capability: &str, query: &Value) -> Result<Vec<Value>, CadenceError>;
}

/// Returns no materials. Used where no context peer is configured, and
/// in tests.
pub struct NullContext;

#[async_trait]
impl ContextAdapter for NullContext {
    async fn retrieve(&self, _capability: &str, _query: &Value) -> Result<Vec<Value>, CadenceError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn null_judge_always_passes() {
        let verdict = NullJudge.adjudicate("s-1", &json!({}), &json!({})).await.unwrap();
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn null_context_returns_nothing() {
        let materials = NullContext.retrieve("code.implement", &json!({})).await.unwrap();
        assert!(materials.is_empty());
    }
}
