use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A policy definition: three lists of rule strings of the form
/// `<clause> [IF <condition>]`, parsed and evaluated by `cadence-policy`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyDefinition {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub require: Vec<String>,
}

/// The context bag a policy rule's `IF` condition is evaluated against.
/// Dotted-name resolution first checks the named fields, then falls back
/// to `extra` for forward-compatible/custom attributes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyContext {
    pub capability: String,
    pub step_cost: f64,
    pub cumulative_cost: f64,
    pub elapsed_ms: f64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub security_level: Option<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    #[serde(default)]
    pub matched_deny: Option<String>,
    #[serde(default)]
    pub matched_allow: Option<String>,
    /// Obligations from `require` rules the caller must satisfy before
    /// the guarded action completes: not gates but obligations returned
    /// alongside the decision.
    #[serde(default)]
    pub obligations: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            matched_deny: None,
            matched_allow: None,
            obligations: Vec::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            matched_deny: Some(reason.into()),
            matched_allow: None,
            obligations: Vec::new(),
        }
    }
}
