use thiserror::Error;

/// The stable error taxonomy shared across components. Component-local error enums
/// (`ValidationError` in `cadence-dsl`, `SandboxError` in
/// `cadence-scheduler`, ...) convert into this one at crate boundaries so
/// the scheduler's dispatch loop can match on `kind()` once rather than
/// threading every crate's error type through.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("validation error on field `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("no healthy route available for capability `{capability}`")]
    NoRouteAvailable { capability: String },

    #[error("lease lost for step `{step_id}`")]
    LeaseLost { step_id: String },

    #[error("execution timed out after {elapsed_ms}ms")]
    ExecutionTimeout { elapsed_ms: u64 },

    #[error("execution error: {message}")]
    ExecutionError { message: String },

    #[error("sandbox policy violation: {evidence}")]
    SandboxViolation { evidence: String },

    #[error("verification failed: {property_id}")]
    VerificationFailed { property_id: String },

    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl CadenceError {
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Validation { .. } => "ValidationError",
            CadenceError::PolicyDenied { .. } => "PolicyDenied",
            CadenceError::NoRouteAvailable { .. } => "NoRouteAvailable",
            CadenceError::LeaseLost { .. } => "LeaseLost",
            CadenceError::ExecutionTimeout { .. } => "ExecutionTimeout",
            CadenceError::ExecutionError { .. } => "ExecutionError",
            CadenceError::SandboxViolation { .. } => "SandboxViolation",
            CadenceError::VerificationFailed { .. } => "VerificationFailed",
            CadenceError::Internal { .. } => "Internal",
        }
    }

    /// Transient errors are retried with exponential backoff up to a
    /// step's `retry_count`; terminal errors never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CadenceError::ExecutionTimeout { .. } | CadenceError::ExecutionError { .. }
        )
    }

    pub fn is_critical_plan_failure(&self) -> bool {
        matches!(
            self,
            CadenceError::SandboxViolation { .. }
                | CadenceError::VerificationFailed { .. }
                | CadenceError::Internal { .. }
        )
    }
}
