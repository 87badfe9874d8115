//! Orchestrator facade: submit, poll, cancel, approve (spec.md §4, last row
//! of the dependency table).
//!
//! Grounded in the teacher's `orchestrator::Orchestrator` for the overall
//! shape of a facade that owns the shared collaborators and drives a plan
//! through them to a terminal state (`execute_plan` there, `run_plan` via
//! `scheduler::Scheduler` here). Unlike the teacher, a submission here
//! returns immediately and the plan runs on a detached task — this crate has
//! no RTFS yield/checkpoint machinery to suspend into, so "drive to terminal"
//! happens in the background and callers observe progress through `poll`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::approval::{ApprovalGate, Decision as ApprovalDecision};
use crate::audit::{AuditLogger, AuditSink, TOPIC_INTENT, TOPIC_PLANS, TOPIC_SECURITY};
use crate::config::BridgeConfig;
use crate::error::{OrchestratorError, Result};
use crate::intent_verifier::IntentVerifier;
use crate::memory::MemoryStore;
use crate::module_registry::ModuleRegistry;
use crate::parser::{self, ParseInput};
use crate::permission::{PermissionGuard, PermissionProfile, PermissionStore};
use crate::scanner::ScannerPipeline;
use crate::scheduler::Scheduler;
use crate::state_store::PlanStateStore;
use crate::types::{PermissionGrant, PlanState, PlanStatus, PlanSummary, Verdict};

/// Everything the orchestrator needs to construct itself, already assembled
/// by the caller (daemon entry point, test harness, ...). Kept as a plain
/// struct rather than threading a dozen constructor arguments, matching how
/// the teacher's `Orchestrator::new` takes already-built `Arc` collaborators.
pub struct OrchestratorDeps {
    pub registry: Arc<ModuleRegistry>,
    pub permissions: Arc<PermissionStore>,
    pub store: Arc<dyn PlanStateStore>,
    pub audit: Arc<AuditLogger>,
    pub intent_verifier: Option<Arc<IntentVerifier>>,
    pub scanner: Arc<ScannerPipeline>,
    pub memory: Arc<MemoryStore>,
    pub config: BridgeConfig,
}

struct RunningPlan {
    cancel_tx: watch::Sender<bool>,
}

/// Top-level facade wiring the security pipeline and scheduler together
/// (spec.md §4's data-flow row: parse → scan → verify → store → schedule).
pub struct Orchestrator {
    registry: Arc<ModuleRegistry>,
    permissions: Arc<PermissionStore>,
    store: Arc<dyn PlanStateStore>,
    audit: Arc<AuditLogger>,
    intent_verifier: Option<Arc<IntentVerifier>>,
    scanner: Arc<ScannerPipeline>,
    approval: Arc<ApprovalGate>,
    scheduler: Arc<Scheduler>,
    max_concurrent_plans: u32,
    running: Arc<DashMap<String, RunningPlan>>,
}

impl Orchestrator {
    /// Builds the orchestrator from its collaborators and runs startup
    /// recovery (spec.md §4.8 "Durability": non-terminal plans from a prior
    /// process are marked `failed`).
    pub async fn new(deps: OrchestratorDeps) -> Result<Self> {
        let profile = PermissionProfile::by_name(&deps.config.security.permission_profile)
            .unwrap_or_else(PermissionProfile::local_worker)
            .with_sandbox_paths(deps.config.security.sandbox_paths.clone());
        let guard = Arc::new(PermissionGuard::new(
            profile,
            deps.config.security.require_approval_for.clone(),
        ));
        let approval = Arc::new(ApprovalGate::new());

        let scheduler = Arc::new(Scheduler::new(
            deps.registry.clone(),
            guard,
            deps.permissions.clone(),
            approval.clone(),
            deps.memory.clone(),
            deps.audit.clone(),
            deps.intent_verifier.clone(),
            deps.config.resources.default_concurrency.max(1) as usize,
            deps.config.resources.module_limits.clone(),
        ));

        let recovered = deps.store.recover_on_startup().await?;
        if recovered > 0 {
            tracing::info!(count = recovered, "recovered stale plans from previous process");
        }

        Ok(Self {
            registry: deps.registry,
            permissions: deps.permissions,
            store: deps.store,
            audit: deps.audit,
            intent_verifier: deps.intent_verifier,
            scanner: deps.scanner,
            approval,
            scheduler,
            max_concurrent_plans: deps.config.security.max_concurrent_plans,
            running: Arc::new(DashMap::new()),
        })
    }

    /// Parses, scans, verifies, and persists a plan, then launches it on a
    /// detached task and returns its id immediately (spec.md §5
    /// "Backpressure": submitters over the concurrent-plan cap get an
    /// immediate error, never queued).
    pub async fn submit(&self, input: ParseInput<'_>) -> Result<String> {
        if self.running.len() as u32 >= self.max_concurrent_plans {
            return Err(OrchestratorError::ConcurrencyLimitExceeded(self.max_concurrent_plans));
        }

        let plan = parser::parse(input, &self.registry)?;
        let plan_id = plan.plan_id.clone();

        let serialised = parser::to_json(&plan)?;
        let scan = self.scanner.run(&serialised).await;
        self.audit
            .record(
                TOPIC_SECURITY,
                serde_json::json!({
                    "type": "SCAN_COMPLETED",
                    "plan_id": plan_id,
                    "verdict": scan.verdict,
                    "risk_score": scan.risk_score,
                    "short_circuited": scan.short_circuited,
                }),
            )
            .await;
        if scan.verdict == crate::types::ScanVerdict::Reject {
            self.store.create(&plan).await?;
            self.store.update_plan_status(&plan_id, PlanStatus::Failed).await?;
            self.audit
                .record(TOPIC_PLANS, serde_json::json!({"type": "PLAN_FAILED", "plan_id": plan_id, "reason": "SuspiciousIntent"}))
                .await;
            return Err(OrchestratorError::SuspiciousIntent(scan.details));
        }

        if let Some(verifier) = &self.intent_verifier {
            let verdict = verifier.verify_plan(&plan).await;
            self.audit
                .record(
                    TOPIC_INTENT,
                    serde_json::json!({
                        "type": if verdict.verdict == Verdict::Reject { "INTENT_REJECTED" } else { "INTENT_VERIFIED" },
                        "plan_id": plan_id,
                        "verdict": verdict.verdict,
                        "risk_level": verdict.risk_level,
                        "reasoning": verdict.reasoning,
                    }),
                )
                .await;
            if verdict.verdict == Verdict::Reject {
                self.store.create(&plan).await?;
                self.store.update_plan_status(&plan_id, PlanStatus::Failed).await?;
                self.audit
                    .record(TOPIC_PLANS, serde_json::json!({"type": "PLAN_FAILED", "plan_id": plan_id, "reason": "SuspiciousIntent"}))
                    .await;
                return Err(OrchestratorError::SuspiciousIntent(verdict.reasoning));
            }
        }

        self.store.create(&plan).await?;
        self.audit
            .record(TOPIC_PLANS, serde_json::json!({"type": "PLAN_SUBMITTED", "plan_id": plan_id}))
            .await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running.insert(plan_id.clone(), RunningPlan { cancel_tx });

        let scheduler = self.scheduler.clone();
        let store = self.store.clone();
        let audit = self.audit.clone();
        let running = self.running.clone();
        let task_plan_id = plan_id.clone();
        tokio::spawn(async move {
            let outcome = scheduler.run_plan(store, plan, cancel_rx).await;
            running.remove(&task_plan_id);
            match outcome {
                Ok(status) => {
                    audit
                        .record(
                            TOPIC_PLANS,
                            serde_json::json!({"type": "PLAN_TERMINAL", "plan_id": task_plan_id, "status": status}),
                        )
                        .await;
                }
                Err(err) => {
                    tracing::error!(plan_id = %task_plan_id, error = %err, "plan run failed before reaching a terminal state");
                    audit
                        .record(
                            TOPIC_PLANS,
                            serde_json::json!({"type": "PLAN_FAILED", "plan_id": task_plan_id, "reason": err.classification()}),
                        )
                        .await;
                }
            }
        });

        Ok(plan_id)
    }

    /// Returns the full header + per-action state of a plan (spec.md §4.8
    /// `get_plan`). Polling observers see monotonic progress since each
    /// transition is committed before `run_action`/`run_plan` moves on.
    pub async fn poll(&self, plan_id: &str) -> Result<PlanState> {
        self.store.get_plan(plan_id).await
    }

    pub async fn list(&self) -> Result<Vec<PlanSummary>> {
        self.store.list_plans().await
    }

    /// Transitions the plan to `cancelled`, rejects its pending approvals,
    /// and signals cooperative cancellation into its running task (spec.md
    /// §5 "Cancellation"). In-flight module calls finish naturally; their
    /// results are simply not acted upon once the plan is terminal.
    pub async fn cancel(&self, plan_id: &str) -> Result<()> {
        let entry = self
            .running
            .get(plan_id)
            .ok_or_else(|| OrchestratorError::PlanNotFound(plan_id.to_string()))?;
        let _ = entry.cancel_tx.send(true);
        drop(entry);
        self.approval.cancel(plan_id);
        // Mark the plan cancelled immediately rather than waiting for the
        // background loop's next opportunity to notice the signal (which may
        // be minutes away if the current action is mid-dispatch).
        self.store.update_plan_status(plan_id, PlanStatus::Cancelled).await?;
        self.audit
            .record(TOPIC_PLANS, serde_json::json!({"type": "PLAN_CANCELLED", "plan_id": plan_id}))
            .await;
        Ok(())
    }

    /// Resolves a pending approval request (spec.md §4.7 `submit_decision`).
    pub fn approve(
        &self,
        plan_id: &str,
        action_id: &str,
        decision: ApprovalDecision,
        approved_by: &str,
    ) -> Result<()> {
        self.approval.submit_decision(plan_id, action_id, decision, approved_by)
    }

    pub fn pending_approvals(&self, plan_id: Option<&str>) -> Vec<crate::approval::PendingRequest> {
        self.approval.list_pending(plan_id)
    }

    /// Background maintenance hook (spec.md §4.8 `purge_older_than`); callers
    /// schedule this on their own interval, e.g. `resources.default_concurrency`
    /// permitting, daily.
    pub async fn purge_older_than(&self, hours: i64) -> Result<u64> {
        self.store.purge_older_than(hours).await
    }

    pub fn module_manifests(&self) -> Vec<crate::module_registry::ModuleManifest> {
        self.registry.list()
    }

    /// Grants a permission outside the approval flow, e.g. via an explicit
    /// `security.grant_permission` action (spec.md §3 "Permission grant").
    pub fn grant_permission(&self, grant: PermissionGrant) {
        self.permissions.grant(grant);
    }

    pub fn revoke_permission(&self, module_id: &str, permission: &str) {
        self.permissions.revoke(module_id, permission);
    }

    pub fn list_permission_grants(&self) -> Vec<PermissionGrant> {
        self.permissions.list()
    }
}
