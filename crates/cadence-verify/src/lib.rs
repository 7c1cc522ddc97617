//! Property-based post-condition verification (component H). A registry
//! of named predicates, keyed `FUNC-*`/`SEC-*`/`PERF-*`/`META-*`, each
//! evaluated over `(inputs, outputs, context)`. Grounded on
//! `tandem_core::hooks::HookHandler`/`HookResult<T>` — a priority-ordered
//! pipeline of handlers that can continue or cancel — the same shape as
//! running a property registry in sequence with a critical/non-critical
//! distinction mapped onto terminal-failure vs. logged-failure.

use cadence_types::ResourceEnvelope;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct PropertyContext {
    pub capability: String,
    pub cost: f64,
    pub latency_ms: u64,
    pub constraints: Option<ResourceEnvelope>,
    pub required_fields: Vec<String>,
    pub error: Option<String>,
}

impl PropertyContext {
    fn max_latency_ms(&self) -> u64 {
        self.constraints
            .as_ref()
            .and_then(|c| c.max_latency_ms)
            .unwrap_or(30_000)
    }

    fn max_cost(&self) -> f64 {
        self.constraints.as_ref().and_then(|c| c.max_cost).unwrap_or(10.0)
    }
}

pub type Predicate = Box<dyn Fn(&Value, &Value, &PropertyContext) -> bool + Send + Sync>;

pub struct Property {
    pub id: &'static str,
    pub critical: bool,
    pub metamorphic: bool,
    pub predicate: Predicate,
}

pub struct PropertyRegistry {
    properties: Vec<Property>,
}

impl Default for PropertyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PropertyRegistry {
    pub fn new() -> Self {
        Self { properties: Vec::new() }
    }

    pub fn register(&mut self, property: Property) {
        self.properties.push(property);
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// The eight built-in properties, covering functional, security,
    /// performance, and metamorphic checks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(Property {
            id: "FUNC-001",
            critical: true,
            metamorphic: false,
            predicate: Box::new(|_inputs, outputs, ctx| {
                ctx.required_fields
                    .iter()
                    .all(|field| outputs.get(field).is_some())
            }),
        });

        registry.register(Property {
            id: "FUNC-002",
            critical: true,
            metamorphic: false,
            predicate: Box::new(|_inputs, _outputs, ctx| {
                !ctx.error
                    .as_deref()
                    .unwrap_or("")
                    .to_ascii_lowercase()
                    .contains("invalid input")
            }),
        });

        registry.register(Property {
            id: "SEC-001",
            critical: true,
            metamorphic: false,
            predicate: Box::new(|_inputs, outputs, _ctx| {
                const BANNED: &[&str] = &["password", "secret", "key", "token", "credential"];
                let text = outputs.to_string().to_ascii_lowercase();
                !BANNED.iter().any(|word| text.contains(word))
            }),
        });

        registry.register(Property {
            id: "SEC-002",
            critical: true,
            metamorphic: false,
            predicate: Box::new(|_inputs, outputs, ctx| {
                let text = format!("{} {}", outputs, ctx.error.as_deref().unwrap_or(""))
                    .to_ascii_lowercase();
                !text.contains("permission denied")
            }),
        });

        registry.register(Property {
            id: "PERF-001",
            critical: false,
            metamorphic: false,
            predicate: Box::new(|_inputs, _outputs, ctx| ctx.latency_ms <= ctx.max_latency_ms()),
        });

        registry.register(Property {
            id: "PERF-002",
            critical: false,
            metamorphic: false,
            predicate: Box::new(|_inputs, _outputs, ctx| ctx.cost <= ctx.max_cost()),
        });

        registry.register(Property {
            id: "META-001",
            critical: false,
            metamorphic: true,
            predicate: Box::new(|_inputs, _outputs, _ctx| true),
        });

        registry.register(Property {
            id: "META-002",
            critical: false,
            metamorphic: true,
            predicate: Box::new(|_inputs, _outputs, _ctx| true),
        });

        registry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    Original,
    Repeat,
    Reverse,
}

#[derive(Debug, Clone)]
pub struct Variant {
    pub kind: VariantKind,
    pub inputs: Value,
}

/// Generates metamorphic variants: original always; repeat if the
/// capability is non-destructive; reverse if an input field is a list.
pub fn generate_variants(capability: &str, inputs: &Value) -> Vec<Variant> {
    let mut variants = vec![Variant {
        kind: VariantKind::Original,
        inputs: inputs.clone(),
    }];

    if is_non_destructive(capability) {
        variants.push(Variant {
            kind: VariantKind::Repeat,
            inputs: inputs.clone(),
        });
    }

    if let Some(reversed) = reverse_list_input(inputs) {
        variants.push(Variant {
            kind: VariantKind::Reverse,
            inputs: reversed,
        });
    }

    variants
}

fn is_non_destructive(capability: &str) -> bool {
    const DESTRUCTIVE: &[&str] = &["delete", "deploy", "destroy", "remove"];
    !DESTRUCTIVE.iter().any(|word| capability.contains(word))
}

fn reverse_list_input(inputs: &Value) -> Option<Value> {
    let obj = inputs.as_object()?;
    let mut reversed = obj.clone();
    let mut changed = false;
    for (_key, value) in reversed.iter_mut() {
        if let Some(arr) = value.as_array() {
            if arr.len() > 1 {
                let mut rev = arr.clone();
                rev.reverse();
                *value = Value::Array(rev);
                changed = true;
            }
        }
    }
    changed.then(|| Value::Object(reversed))
}

/// META-001: re-execution with identical inputs must deep-equal the
/// original output.
pub fn idempotent(original: &Value, repeat: &Value) -> bool {
    original == repeat
}

/// META-002: reversing independent input order must produce an output
/// equal under multiset (order-independent) semantics for any list
/// fields, and deep-equal for everything else.
pub fn commutative(original: &Value, reordered: &Value) -> bool {
    multiset_equal(original, reordered)
}

fn multiset_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return false;
            }
            let mut remaining: Vec<&Value> = b.iter().collect();
            for item in a {
                if let Some(pos) = remaining.iter().position(|v| multiset_equal(item, v)) {
                    remaining.remove(pos);
                } else {
                    return false;
                }
            }
            true
        }
        (Value::Object(a), Value::Object(b)) => {
            if a.len() != b.len() {
                return false;
            }
            a.iter()
                .all(|(k, v)| b.get(k).map(|bv| multiset_equal(v, bv)).unwrap_or(false))
        }
        _ => a == b,
    }
}

#[derive(Debug, Clone)]
pub struct PropertyResult {
    pub property_id: String,
    pub passed: bool,
    pub critical: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub results: Vec<PropertyResult>,
    pub all_critical_passed: bool,
}

impl VerificationReport {
    pub fn critical_failures(&self) -> Vec<&PropertyResult> {
        self.results
            .iter()
            .filter(|r| r.critical && !r.passed)
            .collect()
    }
}

/// `0.8` if passed else `0.2`; `+0.1` for >= 3 evidence items; `+0.1` for
/// >= 2 metamorphic variants executed; a critical property that passed
/// floors at `0.9`.
fn confidence_for(passed: bool, critical: bool, evidence_count: usize, metamorphic_variants: usize) -> f64 {
    let mut confidence = if passed { 0.8 } else { 0.2 };
    if evidence_count >= 3 {
        confidence += 0.1;
    }
    if metamorphic_variants >= 2 {
        confidence += 0.1;
    }
    if critical && passed {
        confidence = confidence.max(0.9);
    }
    confidence.min(1.0)
}

/// Runs every registered non-metamorphic property plus, when
/// `metamorphic_outcomes` supplies enough variant results, the
/// metamorphic ones, folding everything into a single report. A step may
/// transition to `done` only if `all_critical_passed`.
pub fn run(
    registry: &PropertyRegistry,
    inputs: &Value,
    outputs: &Value,
    context: &PropertyContext,
    evidence_count: usize,
    metamorphic_outcomes: &MetamorphicOutcomes,
) -> VerificationReport {
    let metamorphic_variant_count = metamorphic_outcomes.variant_count();
    let mut results = Vec::new();

    for property in registry.properties() {
        if property.metamorphic {
            let passed = match property.id {
                "META-001" => metamorphic_outcomes.idempotency.unwrap_or(true),
                "META-002" => metamorphic_outcomes.commutativity.unwrap_or(true),
                _ => (property.predicate)(inputs, outputs, context),
            };
            results.push(PropertyResult {
                property_id: property.id.to_string(),
                passed,
                critical: property.critical,
                confidence: confidence_for(passed, property.critical, evidence_count, metamorphic_variant_count),
            });
            continue;
        }

        let passed = (property.predicate)(inputs, outputs, context);
        results.push(PropertyResult {
            property_id: property.id.to_string(),
            passed,
            critical: property.critical,
            confidence: confidence_for(passed, property.critical, evidence_count, metamorphic_variant_count),
        });
    }

    let all_critical_passed = results.iter().filter(|r| r.critical).all(|r| r.passed);
    VerificationReport {
        results,
        all_critical_passed,
    }
}

/// Results of any metamorphic variant executions the caller already ran.
/// `None` means the variant was not applicable (e.g. no list input for
/// the reverse variant) and so is excluded from both the pass/fail check
/// and the variant count used by the confidence formula.
#[derive(Debug, Clone, Default)]
pub struct MetamorphicOutcomes {
    pub idempotency: Option<bool>,
    pub commutativity: Option<bool>,
}

impl MetamorphicOutcomes {
    fn variant_count(&self) -> usize {
        self.idempotency.is_some() as usize + self.commutativity.is_some() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> PropertyContext {
        PropertyContext {
            capability: "code.implement".to_string(),
            cost: 1.0,
            latency_ms: 1_000,
            constraints: None,
            required_fields: vec!["result".to_string()],
            error: None,
        }
    }

    #[test]
    fn func_001_requires_all_required_fields() {
        let registry = PropertyRegistry::with_builtins();
        let outputs = json!({"result": "ok"});
        let report = run(&registry, &json!({}), &outputs, &ctx(), 1, &MetamorphicOutcomes::default());
        assert!(report.all_critical_passed);

        let missing = json!({"other": 1});
        let report = run(&registry, &json!({}), &missing, &ctx(), 1, &MetamorphicOutcomes::default());
        assert!(!report.all_critical_passed);
    }

    #[test]
    fn sec_001_flags_sensitive_terms() {
        let registry = PropertyRegistry::with_builtins();
        let mut ctx = ctx();
        ctx.required_fields = vec![];
        let outputs = json!({"result": "token=abc123"});
        let report = run(&registry, &json!({}), &outputs, &ctx, 1, &MetamorphicOutcomes::default());
        let sec001 = report.results.iter().find(|r| r.property_id == "SEC-001").unwrap();
        assert!(!sec001.passed);
    }

    #[test]
    fn perf_001_uses_default_30s_bound() {
        let registry = PropertyRegistry::with_builtins();
        let mut ctx = ctx();
        ctx.required_fields = vec![];
        ctx.latency_ms = 30_001;
        let report = run(&registry, &json!({}), &json!({}), &ctx, 1, &MetamorphicOutcomes::default());
        let perf001 = report.results.iter().find(|r| r.property_id == "PERF-001").unwrap();
        assert!(!perf001.passed);
    }

    #[test]
    fn confidence_floors_at_point_nine_for_critical_pass() {
        assert_eq!(confidence_for(true, true, 0, 0), 0.9);
        assert_eq!(confidence_for(true, false, 0, 0), 0.8);
        assert_eq!(confidence_for(false, true, 0, 0), 0.2);
    }

    #[test]
    fn commutative_handles_reordered_lists() {
        let original = json!({"items": [1, 2, 3]});
        let reversed = json!({"items": [3, 2, 1]});
        assert!(commutative(&original, &reversed));

        let different = json!({"items": [1, 2, 4]});
        assert!(!commutative(&original, &different));
    }

    #[test]
    fn generate_variants_skips_repeat_for_destructive_capabilities() {
        let variants = generate_variants("deploy.production", &json!({"x": 1}));
        assert!(!variants.iter().any(|v| v.kind == VariantKind::Repeat));
        assert!(variants.iter().any(|v| v.kind == VariantKind::Original));
    }

    #[test]
    fn generate_variants_adds_reverse_for_list_inputs() {
        let variants = generate_variants("analysis.perform", &json!({"items": [1, 2, 3]}));
        assert!(variants.iter().any(|v| v.kind == VariantKind::Reverse));
    }
}
