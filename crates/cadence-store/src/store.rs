use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use cadence_types::{
    Attestation, Branch, Event, LearningRecord, Plan, Route, Step, Ticket,
};

use crate::schema;

/// The durable event log and relational state store. A single
/// `rusqlite::Connection` guarded by a `tokio::sync::Mutex`, following the
/// same layering `tandem-memory::db::MemoryDatabase` uses: lock the async
/// mutex, then call the (fast, local-file) blocking `rusqlite` API
/// directly rather than round-tripping through `spawn_blocking`.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside a SQLite transaction and records `event_type`/
    /// `payload` as a single event inside the *same* transaction, so a
    /// failure of either half aborts both.
    pub async fn transaction<T, F>(
        &self,
        actor: &str,
        event_type: &str,
        payload: Value,
        f: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        insert_event_tx(&tx, actor, event_type, &payload)?;
        tx.commit()?;
        Ok(result)
    }

    /// Convenience append-only event insert outside of a wider transaction.
    pub async fn event(&self, actor: &str, event_type: &str, payload: Value) -> anyhow::Result<i64> {
        let conn = self.conn.lock().await;
        let seq = insert_event(&conn, actor, event_type, &payload)?;
        Ok(seq)
    }

    pub async fn recent_events(&self, limit: u32) -> anyhow::Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, ts, actor, type, payload FROM events ORDER BY seq ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let payload_text: String = row.get(4)?;
                Ok(Event {
                    seq: row.get(0)?,
                    ts: row.get(1)?,
                    actor: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: serde_json::from_str(&payload_text)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- plans -------------------------------------------------------

    pub async fn put_plan(&self, plan: &Plan) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(plan)?;
        conn.execute(
            "INSERT INTO plans (id, owner, status, priority, created_at, updated_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                owner=excluded.owner, status=excluded.status, priority=excluded.priority,
                updated_at=excluded.updated_at, body=excluded.body",
            params![
                plan.id,
                plan.owner,
                status_tag(&plan.status),
                plan.priority as i64,
                plan.created_at,
                plan.updated_at,
                body
            ],
        )?;
        Ok(())
    }

    pub async fn get_plan(&self, id: &str) -> anyhow::Result<Option<Plan>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row("SELECT body FROM plans WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(match body {
            Some(b) => Some(serde_json::from_str(&b)?),
            None => None,
        })
    }

    pub async fn list_active_plans(&self) -> anyhow::Result<Vec<Plan>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT body FROM plans WHERE status = 'active'")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    /// All plans regardless of status, for read-models (the metrics
    /// dashboard) that must keep counting a plan's steps and attestations
    /// after it leaves `active`.
    pub async fn list_all_plans(&self) -> anyhow::Result<Vec<Plan>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT body FROM plans")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    pub async fn delete_plan(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM plans WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ---- steps ---------------------------------------------------------

    pub async fn put_step(&self, step: &Step) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        put_step_tx(&conn, step)?;
        Ok(())
    }

    pub async fn get_step(&self, id: &str) -> anyhow::Result<Option<Step>> {
        let conn = self.conn.lock().await;
        get_step_tx(&conn, id)
    }

    pub async fn list_steps_for_plan(&self, plan_id: &str) -> anyhow::Result<Vec<Step>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT body FROM steps WHERE plan_id = ?1 ORDER BY order_index ASC",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    /// Atomic lease acquisition: `UPDATE ... WHERE id=? AND (lease_owner IS
    /// NULL OR lease_expires_at < now)`. Returns `true` if this call won
    /// the lease.
    pub async fn acquire_lease(
        &self,
        step_id: &str,
        owner: &str,
        now: i64,
        expires_at: i64,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE steps SET lease_owner = ?1, lease_expires_at = ?2, status = 'in_progress',
                updated_at = ?3
             WHERE id = ?4 AND (lease_owner IS NULL OR lease_expires_at < ?3)",
            params![owner, expires_at, now, step_id],
        )?;
        if changed > 0 {
            // keep the JSON body's lease/status fields in sync with the
            // indexed columns used by the WHERE clause above.
            if let Some(mut step) = get_step_tx(&conn, step_id)? {
                step.lease.lease_owner = Some(owner.to_string());
                step.lease.lease_expires_at = Some(expires_at);
                step.status = cadence_types::StepStatus::InProgress;
                step.updated_at = now;
                put_step_tx(&conn, &step)?;
            }
        }
        Ok(changed > 0)
    }

    /// Finds leases past `lease_expires_at` and resets them to `todo`,
    /// returning the reclaimed step ids so callers can surface
    /// `LeaseLost`. Each reclaim pairs the status flip with a
    /// `lease.reclaimed` event in the same transaction, since every state
    /// transition must emit exactly one event.
    pub async fn reclaim_expired_leases(&self, now: i64) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM steps WHERE lease_owner IS NOT NULL AND lease_expires_at < ?1",
            )?;
            stmt.query_map(params![now], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        for id in &ids {
            tx.execute(
                "UPDATE steps SET lease_owner = NULL, lease_expires_at = NULL,
                    status = 'todo', updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            if let Some(mut step) = get_step_tx(&tx, id)? {
                step.lease.lease_owner = None;
                step.lease.lease_expires_at = None;
                step.status = cadence_types::StepStatus::Todo;
                step.updated_at = now;
                put_step_tx(&tx, &step)?;
            }
            insert_event_tx(&tx, "scheduler", "lease.reclaimed", &serde_json::json!({"stepId": id}))?;
        }
        tx.commit()?;
        Ok(ids)
    }

    // ---- branches --------------------------------------------------------

    pub async fn put_branch(&self, branch: &Branch) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(branch)?;
        conn.execute(
            "INSERT INTO branches (id, plan_id, parent_branch_id, score, active, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET score=excluded.score, active=excluded.active, body=excluded.body",
            params![
                branch.id,
                branch.plan_id,
                branch.parent_branch_id,
                branch.score,
                branch.active as i64,
                body
            ],
        )?;
        Ok(())
    }

    /// Activates exactly one branch per plan (invariant: "exactly one
    /// branch per plan has active=true").
    pub async fn activate_branch(&self, plan_id: &str, branch_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE branches SET active = 0 WHERE plan_id = ?1",
            params![plan_id],
        )?;
        tx.execute(
            "UPDATE branches SET active = 1 WHERE id = ?1",
            params![branch_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn list_branches_for_plan(&self, plan_id: &str) -> anyhow::Result<Vec<Branch>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT body FROM branches WHERE plan_id = ?1")?;
        let rows = stmt
            .query_map(params![plan_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    // ---- routes & learning ----------------------------------------------

    pub async fn put_route(&self, route: &Route) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(route)?;
        conn.execute(
            "INSERT INTO routes (id, capability, healthy, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET capability=excluded.capability, healthy=excluded.healthy, body=excluded.body",
            params![route.id, route.capability, route.healthy as i64, body],
        )?;
        Ok(())
    }

    pub async fn routes_for_capability(&self, capability: &str) -> anyhow::Result<Vec<Route>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT body FROM routes WHERE capability = ?1 AND healthy = 1")?;
        let rows = stmt
            .query_map(params![capability], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }

    pub async fn set_route_health(&self, route_id: &str, healthy: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE routes SET healthy = ?2 WHERE id = ?1",
            params![route_id, healthy as i64],
        )?;
        if let Some(body) = conn
            .query_row("SELECT body FROM routes WHERE id = ?1", params![route_id], |r| {
                r.get::<_, String>(0)
            })
            .optional()?
        {
            if let Ok(mut route) = serde_json::from_str::<Route>(&body) {
                route.healthy = healthy;
                let body = serde_json::to_string(&route)?;
                conn.execute("UPDATE routes SET body = ?2 WHERE id = ?1", params![route_id, body])?;
            }
        }
        Ok(())
    }

    pub async fn get_learning(&self, route_id: &str) -> anyhow::Result<Option<LearningRecord>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM learning WHERE route_id = ?1",
                params![route_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match body {
            Some(b) => Some(serde_json::from_str(&b)?),
            None => None,
        })
    }

    pub async fn put_learning(&self, record: &LearningRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(record)?;
        conn.execute(
            "INSERT INTO learning (route_id, alpha, beta, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(route_id) DO UPDATE SET alpha=excluded.alpha, beta=excluded.beta, body=excluded.body",
            params![record.route_id, record.alpha, record.beta, body],
        )?;
        Ok(())
    }

    pub async fn total_pulls(&self, capability: &str) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT l.body FROM learning l JOIN routes r ON r.id = l.route_id WHERE r.capability = ?1",
        )?;
        let rows = stmt
            .query_map(params![capability], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|b| serde_json::from_str::<LearningRecord>(&b).ok())
            .map(|r| r.total_count)
            .sum())
    }

    // ---- tickets ---------------------------------------------------------

    pub async fn put_ticket(&self, ticket: &Ticket) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(ticket)?;
        conn.execute(
            "INSERT INTO tickets (id, step_id, route_id, status, started_at, ended_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET status=excluded.status, ended_at=excluded.ended_at, body=excluded.body",
            params![
                ticket.id,
                ticket.step_id,
                ticket.route_id,
                status_tag_ticket(&ticket.status),
                ticket.started_at,
                ticket.ended_at,
                body
            ],
        )?;
        Ok(())
    }

    // ---- attestations ------------------------------------------------

    pub async fn put_attestation(&self, attestation: &Attestation) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let body = serde_json::to_string(attestation)?;
        conn.execute(
            "INSERT INTO attestations (id, step_id, ticket_id, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET body=excluded.body",
            params![
                attestation.id,
                attestation.step_id,
                attestation.ticket_id,
                attestation.created_at,
                body
            ],
        )?;
        Ok(())
    }

    pub async fn attestations_for_step(&self, step_id: &str) -> anyhow::Result<Vec<Attestation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT body FROM attestations WHERE step_id = ?1")?;
        let rows = stmt
            .query_map(params![step_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|b| serde_json::from_str(&b).ok())
            .collect())
    }
}

fn put_step_tx(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    let body = serde_json::to_string(step).expect("step serializes");
    conn.execute(
        "INSERT INTO steps (id, plan_id, capability, status, parallel_group, parent_step_id,
            lease_owner, lease_expires_at, order_index, created_at, updated_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
            status=excluded.status, parallel_group=excluded.parallel_group,
            lease_owner=excluded.lease_owner, lease_expires_at=excluded.lease_expires_at,
            order_index=excluded.order_index, updated_at=excluded.updated_at, body=excluded.body",
        params![
            step.id,
            step.plan_id,
            step.capability,
            status_tag_step(&step.status),
            step.parallel_group,
            step.parent_step_id,
            step.lease.lease_owner,
            step.lease.lease_expires_at,
            step.order_index,
            step.created_at,
            step.updated_at,
            body
        ],
    )?;
    conn.execute(
        "DELETE FROM step_dependencies WHERE step_id = ?1",
        params![step.id],
    )?;
    for dep in &step.dependencies {
        conn.execute(
            "INSERT OR IGNORE INTO step_dependencies (step_id, depends_on) VALUES (?1, ?2)",
            params![step.id, dep],
        )?;
    }
    Ok(())
}

fn get_step_tx(conn: &Connection, id: &str) -> anyhow::Result<Option<Step>> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM steps WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(match body {
        Some(b) => Some(serde_json::from_str(&b)?),
        None => None,
    })
}

fn insert_event(
    conn: &Connection,
    actor: &str,
    event_type: &str,
    payload: &Value,
) -> rusqlite::Result<i64> {
    let now = chrono::Utc::now().timestamp_millis();
    let payload_text = payload.to_string();
    conn.execute(
        "INSERT INTO events (ts, actor, type, payload) VALUES (?1, ?2, ?3, ?4)",
        params![now, actor, event_type, payload_text],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_event_tx(
    tx: &rusqlite::Transaction<'_>,
    actor: &str,
    event_type: &str,
    payload: &Value,
) -> rusqlite::Result<i64> {
    let now = chrono::Utc::now().timestamp_millis();
    let payload_text = payload.to_string();
    tx.execute(
        "INSERT INTO events (ts, actor, type, payload) VALUES (?1, ?2, ?3, ?4)",
        params![now, actor, event_type, payload_text],
    )?;
    Ok(tx.last_insert_rowid())
}

fn status_tag(status: &cadence_types::PlanStatus) -> &'static str {
    match status {
        cadence_types::PlanStatus::Active => "active",
        cadence_types::PlanStatus::Paused => "paused",
        cadence_types::PlanStatus::Completed => "completed",
        cadence_types::PlanStatus::Failed => "failed",
    }
}

fn status_tag_step(status: &cadence_types::StepStatus) -> &'static str {
    match status {
        cadence_types::StepStatus::Todo => "todo",
        cadence_types::StepStatus::InProgress => "in_progress",
        cadence_types::StepStatus::Blocked => "blocked",
        cadence_types::StepStatus::WaitingReview => "waiting_review",
        cadence_types::StepStatus::Done => "done",
        cadence_types::StepStatus::Failed => "failed",
    }
}

fn status_tag_ticket(status: &cadence_types::TicketStatus) -> &'static str {
    match status {
        cadence_types::TicketStatus::Pending => "pending",
        cadence_types::TicketStatus::Running => "running",
        cadence_types::TicketStatus::Completed => "completed",
        cadence_types::TicketStatus::Failed => "failed",
        cadence_types::TicketStatus::Timeout => "timeout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{IoContract, LeaseFields, Plan, PlanBudget, PlanStatus, Step, StepStatus};
    use std::collections::{HashMap, HashSet};

    fn sample_plan() -> Plan {
        Plan {
            id: "plan-1".into(),
            goal: "build greet service".into(),
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

    fn sample_step(id: &str, plan_id: &str) -> Step {
        Step {
            id: id.into(),
            plan_id: plan_id.into(),
            capability: "context.analyze".into(),
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

    #[tokio::test]
    async fn round_trips_a_plan() {
        let store = Store::open_in_memory().await.unwrap();
        let plan = sample_plan();
        store.put_plan(&plan).await.unwrap();
        let fetched = store.get_plan("plan-1").await.unwrap().unwrap();
        assert_eq!(fetched.goal, "build greet service");
        assert_eq!(store.list_active_plans().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_plans_drop_out_of_active_but_not_all() {
        let store = Store::open_in_memory().await.unwrap();
        let mut plan = sample_plan();
        store.put_plan(&plan).await.unwrap();
        plan.status = PlanStatus::Completed;
        store.put_plan(&plan).await.unwrap();

        assert!(store.list_active_plans().await.unwrap().is_empty());
        assert_eq!(store.list_all_plans().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transaction_pairs_mutation_with_event() {
        let store = Store::open_in_memory().await.unwrap();
        let plan = sample_plan();
        store
            .transaction(
                "system",
                "plan.created",
                serde_json::json!({"planId": plan.id}),
                |tx| {
                    tx.execute(
                        "INSERT INTO plans (id, owner, status, priority, created_at, updated_at, body)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            plan.id,
                            plan.owner,
                            "active",
                            5,
                            0,
                            0,
                            serde_json::to_string(&plan).unwrap()
                        ],
                    )?;
                    Ok(())
                },
            )
            .await
            .unwrap();

        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "plan.created");
    }

    #[tokio::test]
    async fn lease_acquisition_is_exclusive_until_expiry() {
        let store = Store::open_in_memory().await.unwrap();
        let plan = sample_plan();
        store.put_plan(&plan).await.unwrap();
        let step = sample_step("s-1", "plan-1");
        store.put_step(&step).await.unwrap();

        let now = 1_000;
        assert!(store.acquire_lease("s-1", "worker-a", now, now + 1_000).await.unwrap());
        assert!(!store.acquire_lease("s-1", "worker-b", now + 500, now + 1_500).await.unwrap());

        let reclaimed = store.reclaim_expired_leases(now + 2_000).await.unwrap();
        assert_eq!(reclaimed, vec!["s-1".to_string()]);
        assert!(store.acquire_lease("s-1", "worker-b", now + 2_100, now + 3_000).await.unwrap());

        let events = store.recent_events(10).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "lease.reclaimed"));
    }

    #[tokio::test]
    async fn activating_a_branch_deactivates_siblings() {
        let store = Store::open_in_memory().await.unwrap();
        let plan = sample_plan();
        store.put_plan(&plan).await.unwrap();
        store
            .put_branch(&Branch {
                id: "b-1".into(),
                plan_id: "plan-1".into(),
                parent_branch_id: None,
                score: 0.8,
                rationale: vec![],
                step_ids: vec![],
                active: true,
            })
            .await
            .unwrap();
        store
            .put_branch(&Branch {
                id: "b-2".into(),
                plan_id: "plan-1".into(),
                parent_branch_id: None,
                score: 0.6,
                rationale: vec![],
                step_ids: vec![],
                active: false,
            })
            .await
            .unwrap();

        store.activate_branch("plan-1", "b-2").await.unwrap();
        let branches = store.list_branches_for_plan("plan-1").await.unwrap();
        let active: Vec<_> = branches.iter().filter(|b| b.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b-2");
    }
}
