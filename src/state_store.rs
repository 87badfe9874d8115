//! Persistent plan/action state store (spec.md §4.8, §6 schema).
//!
//! Grounded in the teacher's `storage_backends::sqlite_archive::SqliteArchive`
//! for the `Arc<Mutex<Connection>>` + `execute_batch` schema-bootstrap idiom,
//! generalised from a single content-addressable `objects` table to the
//! three-table plan/action/permission schema this spec names.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use crate::error::{OrchestratorError, Result};
use crate::types::{Action, ActionState, ActionStatus, Plan, PlanState, PlanStatus, PlanSummary};

#[async_trait]
pub trait PlanStateStore: Send + Sync {
    async fn create(&self, plan: &Plan) -> Result<()>;
    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    async fn update_action(
        &self,
        plan_id: &str,
        action_id: &str,
        status: ActionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        attempts: u32,
    ) -> Result<()>;
    async fn get_plan(&self, plan_id: &str) -> Result<PlanState>;
    async fn list_plans(&self) -> Result<Vec<PlanSummary>>;
    async fn purge_older_than(&self, hours: i64) -> Result<u64>;
    /// Marks every non-terminal plan `failed` with reason "daemon restart".
    /// Called once at startup (spec.md §4.8 "Durability").
    async fn recover_on_startup(&self) -> Result<u64>;
}

/// `rusqlite`-backed implementation (spec.md §6's three-table schema).
pub struct SqlitePlanStateStore {
    conn: Mutex<Connection>,
}

impl SqlitePlanStateStore {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS plans (
                plan_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                description TEXT,
                execution_mode TEXT NOT NULL,
                plan_mode TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                plan_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS actions (
                plan_id TEXT NOT NULL REFERENCES plans(plan_id),
                action_id TEXT NOT NULL,
                status TEXT NOT NULL,
                module TEXT NOT NULL,
                action TEXT NOT NULL,
                params_json TEXT NOT NULL,
                result_json TEXT,
                error_json TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                finished_at TEXT,
                PRIMARY KEY (plan_id, action_id)
            );
            CREATE TABLE IF NOT EXISTS permissions (
                permission TEXT NOT NULL,
                module_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                granted_by TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (permission, module_id)
            );
            CREATE INDEX IF NOT EXISTS idx_plans_status ON plans(status);
            CREATE INDEX IF NOT EXISTS idx_plans_updated_at ON plans(updated_at);
            COMMIT;",
        )?;
        Ok(())
    }

    fn row_to_action_state(row: &rusqlite::Row) -> rusqlite::Result<ActionState> {
        let status: String = row.get("status")?;
        let result_json: Option<String> = row.get("result_json")?;
        let error: Option<String> = row.get("error_json")?;
        let started_at: Option<String> = row.get("started_at")?;
        let finished_at: Option<String> = row.get("finished_at")?;
        Ok(ActionState {
            action_id: row.get("action_id")?,
            status: parse_action_status(&status),
            attempts: row.get("attempts")?,
            result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
            error,
            started_at: started_at.and_then(|s| s.parse().ok()),
            finished_at: finished_at.and_then(|s| s.parse().ok()),
        })
    }
}

fn parse_action_status(s: &str) -> ActionStatus {
    match s {
        "pending" => ActionStatus::Pending,
        "waiting" => ActionStatus::Waiting,
        "running" => ActionStatus::Running,
        "awaiting_approval" => ActionStatus::AwaitingApproval,
        "completed" => ActionStatus::Completed,
        "failed" => ActionStatus::Failed,
        "skipped" => ActionStatus::Skipped,
        "rolled_back" => ActionStatus::RolledBack,
        _ => ActionStatus::Pending,
    }
}

fn parse_plan_status(s: &str) -> PlanStatus {
    match s {
        "pending" => PlanStatus::Pending,
        "running" => PlanStatus::Running,
        "completed" => PlanStatus::Completed,
        "failed" => PlanStatus::Failed,
        "cancelled" => PlanStatus::Cancelled,
        "paused" => PlanStatus::Paused,
        _ => PlanStatus::Pending,
    }
}

fn status_str(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Pending => "pending",
        ActionStatus::Waiting => "waiting",
        ActionStatus::Running => "running",
        ActionStatus::AwaitingApproval => "awaiting_approval",
        ActionStatus::Completed => "completed",
        ActionStatus::Failed => "failed",
        ActionStatus::Skipped => "skipped",
        ActionStatus::RolledBack => "rolled_back",
    }
}

fn plan_status_str(status: PlanStatus) -> &'static str {
    match status {
        PlanStatus::Pending => "pending",
        PlanStatus::Running => "running",
        PlanStatus::Completed => "completed",
        PlanStatus::Failed => "failed",
        PlanStatus::Cancelled => "cancelled",
        PlanStatus::Paused => "paused",
    }
}

#[async_trait]
impl PlanStateStore for SqlitePlanStateStore {
    async fn create(&self, plan: &Plan) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let metadata_json = serde_json::to_string(&plan.metadata)?;
        let plan_json = serde_json::to_string(plan)?;
        conn.execute(
            "INSERT INTO plans (plan_id, status, description, execution_mode, plan_mode, created_at, updated_at, metadata_json, plan_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)",
            params![
                plan.plan_id,
                plan_status_str(PlanStatus::Pending),
                plan.description,
                serde_json::to_string(&plan.execution_mode)?,
                serde_json::to_string(&plan.plan_mode)?,
                now,
                metadata_json,
                plan_json,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
                OrchestratorError::DuplicatePlan(plan.plan_id.clone())
            }
            other => OrchestratorError::from(other),
        })?;

        for action in &plan.actions {
            conn.execute(
                "INSERT INTO actions (plan_id, action_id, status, module, action, params_json, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    plan.plan_id,
                    action.id,
                    status_str(ActionStatus::Pending),
                    action.module,
                    action.action,
                    serde_json::to_string(&action.params)?,
                ],
            )?;
        }
        Ok(())
    }

    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE plans SET status = ?1, updated_at = ?2 WHERE plan_id = ?3",
            params![plan_status_str(status), Utc::now().to_rfc3339(), plan_id],
        )?;
        if rows == 0 {
            return Err(OrchestratorError::PlanNotFound(plan_id.to_string()));
        }
        Ok(())
    }

    async fn update_action(
        &self,
        plan_id: &str,
        action_id: &str,
        status: ActionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        attempts: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let result_json = result.map(|r| serde_json::to_string(&r)).transpose()?;
        let (started_clause, finished_clause) = match status {
            ActionStatus::Running => (Some(now.clone()), None),
            s if s.is_terminal() => (None, Some(now.clone())),
            _ => (None, None),
        };
        conn.execute(
            "UPDATE actions SET status = ?1, result_json = COALESCE(?2, result_json),
             error_json = ?3, attempts = ?4,
             started_at = COALESCE(?5, started_at), finished_at = COALESCE(?6, finished_at)
             WHERE plan_id = ?7 AND action_id = ?8",
            params![
                status_str(status),
                result_json,
                error,
                attempts,
                started_clause,
                finished_clause,
                plan_id,
                action_id,
            ],
        )?;
        conn.execute(
            "UPDATE plans SET updated_at = ?1 WHERE plan_id = ?2",
            params![now, plan_id],
        )?;
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<PlanState> {
        let conn = self.conn.lock().unwrap();
        let (status_str_val, created_at, updated_at, plan_json): (String, String, String, String) = conn
            .query_row(
                "SELECT status, created_at, updated_at, plan_json FROM plans WHERE plan_id = ?1",
                params![plan_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;

        let plan: Plan = serde_json::from_str(&plan_json)?;
        let mut stmt = conn.prepare(
            "SELECT action_id, status, attempts, result_json, error_json, started_at, finished_at
             FROM actions WHERE plan_id = ?1",
        )?;
        let mut actions = BTreeMap::new();
        let rows = stmt.query_map(params![plan_id], Self::row_to_action_state)?;
        for row in rows {
            let state = row?;
            actions.insert(state.action_id.clone(), state);
        }

        Ok(PlanState {
            plan,
            status: parse_plan_status(&status_str_val),
            created_at: created_at.parse().map_err(|_| OrchestratorError::Internal("corrupt created_at".to_string()))?,
            updated_at: updated_at.parse().map_err(|_| OrchestratorError::Internal("corrupt updated_at".to_string()))?,
            actions,
        })
    }

    async fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT plan_id, status, description, created_at, updated_at FROM plans ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(1)?;
            let created_at: String = row.get(3)?;
            let updated_at: String = row.get(4)?;
            Ok((row.get::<_, String>(0)?, status, row.get::<_, Option<String>>(2)?, created_at, updated_at))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (plan_id, status, description, created_at, updated_at) = row?;
            out.push(PlanSummary {
                plan_id,
                status: parse_plan_status(&status),
                description,
                created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }

    async fn purge_older_than(&self, hours: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::hours(hours);
        let plan_ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT plan_id FROM plans WHERE updated_at < ?1 AND status IN ('completed','failed','cancelled')",
            )?;
            stmt.query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?
        };
        for plan_id in &plan_ids {
            conn.execute("DELETE FROM actions WHERE plan_id = ?1", params![plan_id])?;
            conn.execute("DELETE FROM plans WHERE plan_id = ?1", params![plan_id])?;
        }
        Ok(plan_ids.len() as u64)
    }

    async fn recover_on_startup(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let affected = conn.execute(
            "UPDATE plans SET status = 'failed', updated_at = ?1
             WHERE status IN ('running', 'pending')",
            params![now],
        )?;
        if affected > 0 {
            tracing::warn!(count = affected, "recovered non-terminal plans from previous process as failed");
        }
        Ok(affected as u64)
    }
}

/// Plain in-memory implementation for tests and ephemeral (non-durable) runs,
/// distinct from `SqlitePlanStateStore::open_in_memory` (which still pays the
/// `rusqlite` row (de)serialization cost). Holds `Plan`/`ActionState` values
/// directly behind a `RwLock<HashMap<..>>`, following the teacher's
/// `InMemoryApprovalStorage` shape.
#[derive(Default)]
pub struct InMemoryPlanStateStore {
    plans: RwLock<HashMap<String, StoredPlan>>,
}

struct StoredPlan {
    plan: Plan,
    status: PlanStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    actions: BTreeMap<String, ActionState>,
}

impl InMemoryPlanStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStateStore for InMemoryPlanStateStore {
    async fn create(&self, plan: &Plan) -> Result<()> {
        let mut plans = self.plans.write().unwrap();
        if plans.contains_key(&plan.plan_id) {
            return Err(OrchestratorError::DuplicatePlan(plan.plan_id.clone()));
        }
        let now = Utc::now();
        let actions = plan
            .actions
            .iter()
            .map(|action| {
                (
                    action.id.clone(),
                    ActionState {
                        action_id: action.id.clone(),
                        status: ActionStatus::Pending,
                        attempts: 0,
                        result: None,
                        error: None,
                        started_at: None,
                        finished_at: None,
                    },
                )
            })
            .collect();
        plans.insert(
            plan.plan_id.clone(),
            StoredPlan {
                plan: plan.clone(),
                status: PlanStatus::Pending,
                created_at: now,
                updated_at: now,
                actions,
            },
        );
        Ok(())
    }

    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        let mut plans = self.plans.write().unwrap();
        let stored = plans
            .get_mut(plan_id)
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        stored.status = status;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn update_action(
        &self,
        plan_id: &str,
        action_id: &str,
        status: ActionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        attempts: u32,
    ) -> Result<()> {
        let mut plans = self.plans.write().unwrap();
        let stored = plans
            .get_mut(plan_id)
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        let now = Utc::now();
        if let Some(action_state) = stored.actions.get_mut(action_id) {
            action_state.status = status;
            action_state.attempts = attempts;
            if result.is_some() {
                action_state.result = result;
            }
            action_state.error = error;
            if status == ActionStatus::Running {
                action_state.started_at = Some(now);
            } else if status.is_terminal() {
                action_state.finished_at = Some(now);
            }
        }
        stored.updated_at = now;
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<PlanState> {
        let plans = self.plans.read().unwrap();
        let stored = plans
            .get(plan_id)
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        Ok(PlanState {
            plan: stored.plan.clone(),
            status: stored.status,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            actions: stored.actions.clone(),
        })
    }

    async fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        let plans = self.plans.read().unwrap();
        let mut out: Vec<PlanSummary> = plans
            .values()
            .map(|stored| PlanSummary {
                plan_id: stored.plan.plan_id.clone(),
                status: stored.status,
                description: stored.plan.description.clone(),
                created_at: stored.created_at,
                updated_at: stored.updated_at,
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn purge_older_than(&self, hours: i64) -> Result<u64> {
        let mut plans = self.plans.write().unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let doomed: Vec<String> = plans
            .values()
            .filter(|stored| {
                stored.updated_at < cutoff
                    && matches!(
                        stored.status,
                        PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
                    )
            })
            .map(|stored| stored.plan.plan_id.clone())
            .collect();
        for plan_id in &doomed {
            plans.remove(plan_id);
        }
        Ok(doomed.len() as u64)
    }

    async fn recover_on_startup(&self) -> Result<u64> {
        let mut plans = self.plans.write().unwrap();
        let mut affected = 0u64;
        for stored in plans.values_mut() {
            if matches!(stored.status, PlanStatus::Running | PlanStatus::Pending) {
                stored.status = PlanStatus::Failed;
                stored.updated_at = Utc::now();
                affected += 1;
            }
        }
        if affected > 0 {
            tracing::warn!(count = affected, "recovered non-terminal plans from previous process as failed");
        }
        Ok(affected)
    }
}
