//! The seed end-to-end scenario suite, run against a real
//! `Coordinator` wired over an in-memory store and the local sandbox
//! executor. Each scenario writes a tiny shell-script "tool" the sandbox
//! spawns as the route's command, the same way a real route's `tool`
//! field names a binary on the MCP host under the sandbox contract.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use cadence_core::{CadenceConfig, Coordinator};
use cadence_scheduler::SandboxExecutor;
use cadence_store::Store;
use cadence_types::{
    default_priority, now_ms, IoContract, LeaseFields, Plan, PlanBudget, PlanStatus,
    PolicyContext, PolicyDefinition, Route, Step, StepStatus,
};
use clap::ValueEnum;
use serde_json::json;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScenarioName {
    LinearHappyPath,
    PolicyDeny,
    BanditExploration,
    LeaseReclaim,
    SandboxViolation,
    VerificationFailure,
    All,
}

pub async fn run(name: ScenarioName) -> anyhow::Result<()> {
    let scenarios = match name {
        ScenarioName::All => vec![
            ScenarioName::LinearHappyPath,
            ScenarioName::PolicyDeny,
            ScenarioName::BanditExploration,
            ScenarioName::LeaseReclaim,
            ScenarioName::SandboxViolation,
            ScenarioName::VerificationFailure,
        ],
        other => vec![other],
    };

    let mut failures = 0;
    for scenario in scenarios {
        let label = format!("{scenario:?}");
        match run_one(scenario).await {
            Ok(()) => println!("[PASS] {label}"),
            Err(err) => {
                failures += 1;
                println!("[FAIL] {label}: {err:#}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} scenario(s) failed");
    }
    Ok(())
}

async fn run_one(scenario: ScenarioName) -> anyhow::Result<()> {
    match scenario {
        ScenarioName::LinearHappyPath => linear_happy_path().await,
        ScenarioName::PolicyDeny => policy_deny().await,
        ScenarioName::BanditExploration => bandit_exploration().await,
        ScenarioName::LeaseReclaim => lease_reclaim().await,
        ScenarioName::SandboxViolation => sandbox_violation().await,
        ScenarioName::VerificationFailure => verification_failure().await,
        ScenarioName::All => unreachable!("expanded by the caller"),
    }
}

async fn sandbox_workspace() -> anyhow::Result<(tempfile::TempDir, Arc<SandboxExecutor>)> {
    let dir = tempfile::tempdir()?;
    let executor = Arc::new(SandboxExecutor::new(dir.path().to_path_buf()));
    Ok((dir, executor))
}

/// Writes an executable shell script at `dir/name`, used as a route's
/// `tool` so the sandbox has something real to spawn.
pub async fn write_tool(dir: &Path, name: &str, body: &str) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(name);
    tokio::fs::write(&path, body).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&path).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await?;
    }
    Ok(path)
}

pub fn route_for(capability: &str, tool: &Path, id_suffix: &str) -> Route {
    Route {
        id: format!("route-{capability}-{id_suffix}"),
        capability: capability.to_string(),
        mcp_id: "local-sandbox".to_string(),
        tool: tool.display().to_string(),
        score: 0.0,
        policy: None,
        healthy: true,
        cost_weight: 1.0,
        latency_weight: 1.0,
        reliability_weight: 1.0,
    }
}

fn blank_plan(id: &str, goal: &str, context: HashMap<String, serde_json::Value>, now: i64) -> Plan {
    Plan {
        id: id.to_string(),
        goal: goal.to_string(),
        context,
        budget: PlanBudget::default(),
        owner: "operator".to_string(),
        priority: default_priority(),
        deadline: None,
        status: PlanStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

fn blank_step(id: &str, plan_id: &str, capability: &str, critical: bool, contract: IoContract, now: i64) -> Step {
    Step {
        id: id.to_string(),
        plan_id: plan_id.to_string(),
        capability: capability.to_string(),
        critical,
        priority: default_priority(),
        contract,
        constraints: None,
        dependencies: Default::default(),
        parallel_group: None,
        timeout_ms: 5_000,
        retry_count: 0,
        status: StepStatus::Todo,
        assignee: None,
        lease: LeaseFields::default(),
        branch: None,
        parent_step_id: None,
        order_index: 0,
        created_at: now,
        updated_at: now,
        metadata: HashMap::new(),
    }
}

const SUCCEED_SCRIPT: &str = "#!/bin/sh\ncat >/dev/null\necho '{\"result\":\"ok\"}' > outputs.json\n";

/// Scenario 1: linear plan, happy path.
async fn linear_happy_path() -> anyhow::Result<()> {
    let (workdir, executor) = sandbox_workspace().await?;
    let store = Store::open_in_memory().await?;
    let tool = write_tool(workdir.path(), "succeed.sh", SUCCEED_SCRIPT).await?;

    let coordinator = Coordinator::new(store, executor, CadenceConfig::default());
    for capability in ["context.analyze", "design.create", "code.implement", "code.verify"] {
        coordinator.register_route(route_for(capability, &tool, "1")).await?;
    }

    let now = now_ms();
    let plan = coordinator
        .submit_plan("build greet service", "operator", HashMap::new(), PlanBudget::default(), now)
        .await?;

    let finished = coordinator.run_to_completion(&plan.id, "operator", 20, now).await?;
    if finished.status != PlanStatus::Completed {
        bail!("expected plan completed, got {:?}", finished.status);
    }

    let dashboard = coordinator.metrics_dashboard().await?;
    if dashboard.total_attestations != 4 {
        bail!("expected exactly 4 attestations, got {}", dashboard.total_attestations);
    }

    for capability in ["context.analyze", "design.create", "code.implement", "code.verify"] {
        let health = coordinator.routes_health(capability, now).await?;
        let route = health.first().context("route health missing")?;
        if (route.posterior_mean - (2.0 / 3.0)).abs() > 1e-9 {
            bail!(
                "expected posterior alpha=2,beta=1 (mean 2/3) for {capability}, got {}",
                route.posterior_mean
            );
        }
    }
    Ok(())
}

/// Scenario 2: policy deny on an environment-gated capability.
async fn policy_deny() -> anyhow::Result<()> {
    let (workdir, executor) = sandbox_workspace().await?;
    let store = Store::open_in_memory().await?;
    let tool = write_tool(workdir.path(), "fetch.sh", SUCCEED_SCRIPT).await?;

    let mut config = CadenceConfig::default();
    config.policy = PolicyDefinition {
        allow: vec![],
        deny: vec!["web.fetch IF environment == \"prod\"".to_string()],
        require: vec![],
    };
    let coordinator = Coordinator::new(store.clone(), executor, config);
    coordinator.register_route(route_for("web.fetch", &tool, "1")).await?;

    let now = now_ms();
    let context = HashMap::from([("environment".to_string(), json!("prod"))]);
    let plan = blank_plan("plan-policy-deny", "fetch remote pricing page", context, now);
    store.put_plan(&plan).await?;
    let step = blank_step("step-web-fetch", &plan.id, "web.fetch", false, IoContract::default(), now);
    store.put_step(&step).await?;

    coordinator.dispatch_round(&plan.id, "operator", now).await?;

    let persisted = store.get_step(&step.id).await?.context("step missing")?;
    if persisted.status != StepStatus::Blocked {
        bail!("expected step blocked by policy, got {:?}", persisted.status);
    }
    let plan_after = store.get_plan(&plan.id).await?.context("plan missing")?;
    if plan_after.status != PlanStatus::Active {
        bail!(
            "expected plan to remain active pending operator resolution, got {:?}",
            plan_after.status
        );
    }
    let events = coordinator.events_stream(50).await?;
    let denied = events.iter().any(|e| {
        e.event_type == "step.blocked" && e.payload.get("error").and_then(|v| v.as_str()) == Some("PolicyDenied")
    });
    if !denied {
        bail!("expected a step.blocked event classified as PolicyDenied");
    }
    Ok(())
}

/// Scenario 3: bandit exploration favors the cheap route over 100 rounds.
async fn bandit_exploration() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    let cheap = Route {
        id: "route-cheap".into(),
        capability: "analysis.perform".into(),
        mcp_id: "m".into(),
        tool: "t".into(),
        score: 0.0,
        policy: None,
        healthy: true,
        cost_weight: 1.0,
        latency_weight: 1.0,
        reliability_weight: 1.0,
    };
    let pricey = Route {
        id: "route-pricey".into(),
        ..cheap.clone()
    };
    store.put_route(&cheap).await?;
    store.put_route(&pricey).await?;

    let router = cadence_router::Router::new(store.clone(), cadence_router::BanditConfig::default());
    let ctx = PolicyContext::default();
    let policy = PolicyDefinition::default();
    let now = now_ms();

    let mut cheap_picks = 0u32;
    for round in 0..100i64 {
        let pick = router
            .pick_route(
                "analysis.perform",
                &ctx,
                &policy,
                cadence_router::CostClass::Low,
                30_000,
                now + round,
            )
            .await?;
        let is_cheap = pick.route.id == "route-cheap";
        if is_cheap {
            cheap_picks += 1;
        }
        let cost = if is_cheap { 1.0 } else { 10.0 };
        router
            .record_outcome(&pick.route.id, true, 100, cost, now + round)
            .await?;
    }

    if cheap_picks < 80 {
        bail!("expected the cheap route picked at least 80/100 rounds, got {cheap_picks}");
    }

    let cheap_learning = store.get_learning("route-cheap").await?.context("missing cheap learning")?;
    let pricey_learning = store.get_learning("route-pricey").await?.context("missing pricey learning")?;
    if (cheap_learning.posterior_mean() - pricey_learning.posterior_mean()).abs() > 0.05 {
        bail!(
            "expected posterior means within 0.05, cheap={} pricey={}",
            cheap_learning.posterior_mean(),
            pricey_learning.posterior_mean()
        );
    }
    Ok(())
}

/// Scenario 4: a stalled worker's lease is reclaimed and a new worker
/// acquires it cleanly.
async fn lease_reclaim() -> anyhow::Result<()> {
    let store = Store::open_in_memory().await?;
    let now = now_ms();
    let plan = blank_plan("plan-lease-reclaim", "build greet service", HashMap::new(), now);
    store.put_plan(&plan).await?;
    let step = blank_step("step-s", &plan.id, "code.implement", false, IoContract::default(), now);
    store.put_step(&step).await?;

    if !store.acquire_lease(&step.id, "worker-a", now, now + 1_000).await? {
        bail!("expected the first lease acquisition to succeed");
    }

    let reclaimed = store.reclaim_expired_leases(now + 1_001).await?;
    if reclaimed != vec![step.id.clone()] {
        bail!("expected the stalled step to be reclaimed, got {:?}", reclaimed);
    }
    let persisted = store.get_step(&step.id).await?.context("step missing")?;
    if persisted.status != StepStatus::Todo {
        bail!("expected the step back to todo after reclaim, got {:?}", persisted.status);
    }

    let events = store.recent_events(50).await?;
    if !events.iter().any(|e| e.event_type == "lease.reclaimed") {
        bail!("expected a lease.reclaimed event");
    }

    if !store.acquire_lease(&step.id, "worker-b", now + 1_100, now + 2_000).await? {
        bail!("expected a new worker to acquire the reclaimed lease cleanly");
    }
    Ok(())
}

/// Scenario 5: a tool that leaks a network call trips a sandbox
/// violation, with no retry.
async fn sandbox_violation() -> anyhow::Result<()> {
    let (workdir, executor) = sandbox_workspace().await?;
    let store = Store::open_in_memory().await?;
    let tool = write_tool(
        workdir.path(),
        "leaky.sh",
        "#!/bin/sh\ncat >/dev/null\necho 'curl http://evil'\n",
    )
    .await?;

    let coordinator = Coordinator::new(store.clone(), executor, CadenceConfig::default());
    coordinator.register_route(route_for("tool.shell", &tool, "1")).await?;

    let now = now_ms();
    let plan = blank_plan("plan-sandbox-violation", "run shell tool", HashMap::new(), now);
    store.put_plan(&plan).await?;
    let step = blank_step("step-shell", &plan.id, "tool.shell", false, IoContract::default(), now);
    store.put_step(&step).await?;

    coordinator.dispatch_round(&plan.id, "operator", now).await?;

    let persisted = store.get_step(&step.id).await?.context("step missing")?;
    if persisted.status != StepStatus::Failed {
        bail!("expected the step to fail after a sandbox violation, got {:?}", persisted.status);
    }
    let events = coordinator.events_stream(50).await?;
    let classified = events.iter().any(|e| {
        e.event_type == "step.failed" && e.payload.get("error").and_then(|v| v.as_str()) == Some("SandboxViolation")
    });
    if !classified {
        bail!("expected a step.failed event classified as SandboxViolation");
    }
    Ok(())
}

/// Scenario 6: a critical step whose output omits a required field fails
/// verification and takes the whole plan down with it.
async fn verification_failure() -> anyhow::Result<()> {
    let (workdir, executor) = sandbox_workspace().await?;
    let store = Store::open_in_memory().await?;
    let tool = write_tool(
        workdir.path(),
        "incomplete.sh",
        "#!/bin/sh\ncat >/dev/null\necho '{}' > outputs.json\n",
    )
    .await?;

    let coordinator = Coordinator::new(store.clone(), executor, CadenceConfig::default());
    coordinator.register_route(route_for("analysis.report", &tool, "1")).await?;

    let now = now_ms();
    let plan = blank_plan("plan-verify-fail", "summarize findings", HashMap::new(), now);
    store.put_plan(&plan).await?;
    let contract = IoContract {
        required_fields: vec!["summary".to_string()],
        ..Default::default()
    };
    let step = blank_step("step-report", &plan.id, "analysis.report", true, contract, now);
    store.put_step(&step).await?;

    coordinator.dispatch_round(&plan.id, "operator", now).await?;

    let persisted = store.get_step(&step.id).await?.context("step missing")?;
    if persisted.status != StepStatus::Failed {
        bail!(
            "expected the step to fail critical verification, got {:?}",
            persisted.status
        );
    }
    let plan_after = store.get_plan(&plan.id).await?.context("plan missing")?;
    if plan_after.status != PlanStatus::Failed {
        bail!(
            "expected the plan to fail because the step was critical, got {:?}",
            plan_after.status
        );
    }
    Ok(())
}
