//! Contextual multi-armed bandit route selection (component F). Scores
//! every healthy, policy-passing route for a capability with a Beta-UCB
//! rule, samples per the configured exploration probability, and folds
//! execution outcomes back into the posterior. Grounded on
//! `tandem_providers::ProviderRegistry` — a registry of named backends
//! with a `select_provider` step already present there;
//! generalized here from "pick the configured default provider" into
//! "score every healthy, policy-passing route and sample per the bandit
//! policy."

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cadence_policy::evaluate as evaluate_policy;
use cadence_store::Store;
use cadence_types::{CadenceError, LearningRecord, PolicyContext, PolicyDefinition, Route};
use rand::Rng;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostClass {
    High,
    Mid,
    Low,
}

#[derive(Debug, Clone)]
pub struct BanditConfig {
    pub explore: f64,
    pub alpha0: f64,
    pub beta0: f64,
    pub confidence_width: f64,
    pub latency_smoothing: f64,
    pub confidence_floor: f64,
    pub confidence_decay: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_window_ms: i64,
    pub circuit_open_ms: i64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            explore: 0.1,
            alpha0: 1.0,
            beta0: 1.0,
            confidence_width: 1.0,
            latency_smoothing: 0.2,
            confidence_floor: 0.05,
            confidence_decay: 0.9,
            circuit_failure_threshold: 5,
            circuit_window_ms: 30_000,
            circuit_open_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CircuitState {
    failures: VecDeque<i64>,
    open_until: Option<i64>,
}

impl CircuitState {
    fn is_open(&self, now: i64) -> bool {
        self.open_until.map(|until| now < until).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ScoredRoute {
    pub route: Route,
    pub learning: LearningRecord,
    pub score: f64,
}

/// A picked route plus the bookkeeping the caller needs to feed back into
/// `record_outcome` once the execution completes.
#[derive(Debug, Clone)]
pub struct Pick {
    pub route: Route,
    pub total_pulls: u64,
}

#[derive(Clone)]
pub struct Router {
    store: Store,
    config: BanditConfig,
    circuits: Arc<Mutex<HashMap<String, CircuitState>>>,
}

impl Router {
    pub fn new(store: Store, config: BanditConfig) -> Self {
        Self {
            store,
            config,
            circuits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetches candidates, policy-gates them, scores with UCB, samples
    /// exploration-vs-exploitation, and tie-breaks deterministically.
    pub async fn pick_route(
        &self,
        capability: &str,
        context: &PolicyContext,
        policy: &PolicyDefinition,
        _cost_class: CostClass,
        _budget_ms: u64,
        now: i64,
    ) -> Result<Pick, CadenceError> {
        let routes = self
            .store
            .routes_for_capability(capability)
            .await
            .map_err(|e| CadenceError::Internal {
                message: e.to_string(),
            })?;

        if routes.is_empty() {
            return Err(CadenceError::NoRouteAvailable {
                capability: capability.to_string(),
            });
        }

        let circuits = self.circuits.lock().await;
        let mut candidates = Vec::new();
        for route in routes {
            if circuits
                .get(&route.id)
                .map(|c| c.is_open(now))
                .unwrap_or(false)
            {
                continue;
            }
            let decision = evaluate_policy(context, policy);
            if !decision.allowed {
                continue;
            }
            candidates.push(route);
        }
        drop(circuits);

        if candidates.is_empty() {
            return Err(CadenceError::NoRouteAvailable {
                capability: capability.to_string(),
            });
        }

        let mut learning_by_route = HashMap::new();
        let mut total_pulls: u64 = 0;
        for route in &candidates {
            let record = match self
                .store
                .get_learning(&route.id)
                .await
                .map_err(|e| CadenceError::Internal {
                    message: e.to_string(),
                })? {
                Some(r) => r,
                None => LearningRecord::new(route.id.clone(), self.config.alpha0, self.config.beta0),
            };
            total_pulls += record.total_count;
            learning_by_route.insert(route.id.clone(), record);
        }
        // T in the UCB formula is at least 1 so ln(T) stays finite before any pulls.
        let t = total_pulls.max(1) as f64;

        let max_cost = candidates
            .iter()
            .map(|r| learning_by_route[&r.id].avg_cost)
            .fold(0.0_f64, f64::max)
            .max(1e-9);
        let max_latency = candidates
            .iter()
            .map(|r| learning_by_route[&r.id].avg_latency_ms)
            .fold(0.0_f64, f64::max)
            .max(1e-9);

        let mut scored: Vec<ScoredRoute> = candidates
            .into_iter()
            .map(|route| {
                let learning = learning_by_route.remove(&route.id).unwrap();
                let n = learning.total_count.max(1) as f64;
                let mean = learning.posterior_mean();
                let radius = self.config.confidence_width * (t.ln() / n).sqrt();
                let cost_penalty = route.cost_weight * (learning.avg_cost / max_cost);
                let latency_penalty = route.latency_weight * (learning.avg_latency_ms / max_latency);
                let reliability_boost = route.reliability_weight * learning.avg_reliability;
                let score = mean + radius - cost_penalty - latency_penalty + reliability_boost;
                ScoredRoute {
                    route,
                    learning,
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.learning
                        .avg_cost
                        .partial_cmp(&b.learning.avg_cost)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    b.learning
                        .avg_reliability
                        .partial_cmp(&a.learning.avg_reliability)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.route.id.cmp(&b.route.id))
        });

        let picked = if rand::thread_rng().gen_bool(self.config.explore.clamp(0.0, 1.0)) {
            let k = scored.len().min(3);
            let idx = rand::thread_rng().gen_range(0..k);
            scored[idx].route.clone()
        } else {
            scored[0].route.clone()
        };

        Ok(Pick {
            route: picked,
            total_pulls,
        })
    }

    /// Updates the posterior and the circuit breaker: `alpha += 1` on
    /// success, `beta += 1` on failure; EMA-update latency/cost with
    /// smoothing 0.2; decay the confidence radius toward a floor.
    pub async fn record_outcome(
        &self,
        route_id: &str,
        success: bool,
        latency_ms: u64,
        cost: f64,
        now: i64,
    ) -> Result<(), CadenceError> {
        let mut record = match self
            .store
            .get_learning(route_id)
            .await
            .map_err(|e| CadenceError::Internal {
                message: e.to_string(),
            })? {
            Some(r) => r,
            None => LearningRecord::new(route_id, self.config.alpha0, self.config.beta0),
        };

        if success {
            record.alpha += 1.0;
            record.success_count += 1;
        } else {
            record.beta += 1.0;
        }
        record.total_count += 1;

        let smoothing = self.config.latency_smoothing;
        record.avg_latency_ms = ema(record.avg_latency_ms, latency_ms as f64, smoothing);
        record.avg_cost = ema(record.avg_cost, cost, smoothing);
        record.avg_reliability = ema(
            record.avg_reliability,
            if success { 1.0 } else { 0.0 },
            smoothing,
        );
        record.confidence_radius =
            (record.confidence_radius * self.config.confidence_decay).max(self.config.confidence_floor);
        record.last_reward = Some(if success { 1.0 } else { 0.0 });

        self.store
            .put_learning(&record)
            .await
            .map_err(|e| CadenceError::Internal {
                message: e.to_string(),
            })?;

        self.update_circuit(route_id, success, now).await;
        Ok(())
    }

    /// Consecutive-failure circuit breaker: >= `circuit_failure_threshold`
    /// failures within `circuit_window_ms` opens the breaker for
    /// `circuit_open_ms`; a successful use closes it immediately.
    async fn update_circuit(&self, route_id: &str, success: bool, now: i64) {
        let mut circuits = self.circuits.lock().await;
        let state = circuits.entry(route_id.to_string()).or_default();
        if success {
            state.failures.clear();
            state.open_until = None;
            return;
        }
        state.failures.push_back(now);
        let window_start = now - self.config.circuit_window_ms;
        while state.failures.front().map(|t| *t < window_start).unwrap_or(false) {
            state.failures.pop_front();
        }
        if state.failures.len() as u32 >= self.config.circuit_failure_threshold {
            state.open_until = Some(now + self.config.circuit_open_ms);
        }
    }

    pub async fn is_circuit_open(&self, route_id: &str, now: i64) -> bool {
        self.circuits
            .lock()
            .await
            .get(route_id)
            .map(|c| c.is_open(now))
            .unwrap_or(false)
    }
}

fn ema(previous: f64, sample: f64, smoothing: f64) -> f64 {
    if previous == 0.0 {
        return sample;
    }
    smoothing * sample + (1.0 - smoothing) * previous
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{PolicyContext, PolicyDefinition};

    async fn store_with_routes(routes: &[Route]) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        for route in routes {
            store.put_route(route).await.unwrap();
        }
        store
    }

    fn route(id: &str, cost_weight: f64) -> Route {
        Route {
            id: id.to_string(),
            capability: "analysis.perform".to_string(),
            mcp_id: "mcp-1".to_string(),
            tool: "analyze".to_string(),
            score: 0.0,
            policy: None,
            healthy: true,
            cost_weight,
            latency_weight: 1.0,
            reliability_weight: 1.0,
        }
    }

    fn ctx() -> PolicyContext {
        PolicyContext {
            capability: "analysis.perform".to_string(),
            step_cost: 1.0,
            cumulative_cost: 1.0,
            elapsed_ms: 0.0,
            user: None,
            project: None,
            environment: None,
            security_level: None,
            critical: false,
            extra: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn errors_when_no_routes_registered() {
        let store = store_with_routes(&[]).await;
        let router = Router::new(store, BanditConfig::default());
        let result = router
            .pick_route(
                "analysis.perform",
                &ctx(),
                &PolicyDefinition::default(),
                CostClass::Mid,
                1_000,
                0,
            )
            .await;
        assert!(matches!(result, Err(CadenceError::NoRouteAvailable { .. })));
    }

    #[tokio::test]
    async fn reward_update_increments_posterior() {
        let store = store_with_routes(&[route("r1", 1.0)]).await;
        let router = Router::new(store, BanditConfig::default());
        router.record_outcome("r1", true, 100, 1.0, 0).await.unwrap();
        let record = router.store.get_learning("r1").await.unwrap().unwrap();
        assert_eq!(record.alpha, 2.0);
        assert_eq!(record.beta, 1.0);
        assert_eq!(record.total_count, 1);
    }

    #[tokio::test]
    async fn cheap_route_is_favored_under_equal_reliability() {
        let store = store_with_routes(&[route("expensive", 1.0), route("cheap", 1.0)]).await;
        router_seed_cost(&store, "expensive", 10.0).await;
        router_seed_cost(&store, "cheap", 1.0).await;
        let mut config = BanditConfig::default();
        config.explore = 0.0;
        let router = Router::new(store, config);
        let pick = router
            .pick_route(
                "analysis.perform",
                &ctx(),
                &PolicyDefinition::default(),
                CostClass::Mid,
                1_000,
                1_000,
            )
            .await
            .unwrap();
        assert_eq!(pick.route.id, "cheap");
    }

    async fn router_seed_cost(store: &Store, route_id: &str, avg_cost: f64) {
        let mut record = LearningRecord::new(route_id, 5.0, 5.0);
        record.avg_cost = avg_cost;
        record.total_count = 10;
        store.put_learning(&record).await.unwrap();
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_consecutive_failures_and_closes_on_success() {
        let store = store_with_routes(&[route("r1", 1.0)]).await;
        let router = Router::new(store, BanditConfig::default());
        for i in 0..5 {
            router.record_outcome("r1", false, 100, 1.0, i * 1_000).await.unwrap();
        }
        assert!(router.is_circuit_open("r1", 5_000).await);
        router.record_outcome("r1", true, 100, 1.0, 6_000).await.unwrap();
        assert!(!router.is_circuit_open("r1", 6_001).await);
    }
}
