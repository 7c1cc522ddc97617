/// Schema migrations for the Cadence state store. Every persistent entity
/// gets one table; complex nested fields are kept as
/// canonical JSON text columns alongside the indexed columns the
/// scheduler/router query hot paths need (status, capability, plan_id,
/// ...), the same layering `tandem-memory`'s `db.rs` uses for its chunk
/// tables (typed columns plus a JSON `metadata` column).
pub const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS plans (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        plan_id TEXT NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
        capability TEXT NOT NULL,
        status TEXT NOT NULL,
        parallel_group TEXT,
        parent_step_id TEXT,
        lease_owner TEXT,
        lease_expires_at INTEGER,
        order_index INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_steps_plan ON steps(plan_id)",
    "CREATE TABLE IF NOT EXISTS step_dependencies (
        step_id TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
        depends_on TEXT NOT NULL,
        PRIMARY KEY (step_id, depends_on)
    )",
    "CREATE TABLE IF NOT EXISTS branches (
        id TEXT PRIMARY KEY,
        plan_id TEXT NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
        parent_branch_id TEXT,
        score REAL NOT NULL,
        active INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_branches_plan ON branches(plan_id)",
    "CREATE TABLE IF NOT EXISTS capabilities (
        name TEXT PRIMARY KEY,
        registered_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS routes (
        id TEXT PRIMARY KEY,
        capability TEXT NOT NULL,
        healthy INTEGER NOT NULL DEFAULT 1,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_routes_capability ON routes(capability)",
    "CREATE TABLE IF NOT EXISTS learning (
        route_id TEXT PRIMARY KEY REFERENCES routes(id) ON DELETE CASCADE,
        alpha REAL NOT NULL,
        beta REAL NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tickets (
        id TEXT PRIMARY KEY,
        step_id TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
        route_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        ended_at INTEGER,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tickets_step ON tickets(step_id)",
    "CREATE TABLE IF NOT EXISTS attestations (
        id TEXT PRIMARY KEY,
        step_id TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
        ticket_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_attestations_step ON attestations(step_id)",
    "CREATE TABLE IF NOT EXISTS events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        actor TEXT NOT NULL,
        type TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
];

pub fn apply(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    for stmt in MIGRATIONS {
        conn.execute(stmt, [])?;
    }
    Ok(())
}
