//! DAG scheduler and per-action runtime (spec.md §4.9, "the hardest part").
//!
//! Grounded in the teacher's `orchestrator::Orchestrator` for the overall
//! drive-to-terminal shape (minus RTFS yield/checkpoint machinery, which has
//! no counterpart here) and in `capability_marketplace::resource_monitor.rs`
//! for the per-capability rate/usage-tracking idiom generalised into this
//! module's per-module concurrency semaphores and rate limiter.
//!
//! Scanning (scanner pipeline + intent verifier) happens in `orchestrator.rs`
//! before a plan reaches this scheduler, not inside it: those are distinct
//! components at spec.md §4.4/§4.5 and the orchestrator is their sole
//! consumer, so duplicating the check here would just re-run it. Everything
//! else in spec.md §4.9's algorithm (module-version check, cycle detection,
//! the ready-set loop, and the 9-step per-action runtime) lives here.

use dashmap::DashMap;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::approval::ApprovalGate;
use crate::audit::{AuditLogger, AuditSink, TOPIC_ACTIONS};
use crate::error::{OrchestratorError, Result};
use crate::intent_verifier::IntentVerifier;
use crate::memory::MemoryStore;
use crate::module_registry::ModuleRegistry;
use crate::permission::{Decision as GuardDecision, PermissionGuard, PermissionStore};
use crate::state_store::PlanStateStore;
use crate::template::{self, ResolutionContext};
use crate::types::{
    Action, ActionStatus, ApprovalTimeoutBehavior, ExecutionMode, OnError, Plan, PlanStatus,
};

/// Per-module call-rate limiter (sliding one-minute window). `None` limit
/// means unbounded.
struct RateLimiter {
    limits: BTreeMap<String, u32>,
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    fn new(limits: BTreeMap<String, u32>) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    fn check_and_record(&self, module_id: &str) -> bool {
        let Some(&limit) = self.limits.get(module_id) else {
            return true;
        };
        if limit == 0 {
            return true;
        }
        let window = self
            .windows
            .entry(module_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut calls = window.lock().unwrap();
        let cutoff = Instant::now() - Duration::from_secs(60);
        while calls.front().is_some_and(|t| *t < cutoff) {
            calls.pop_front();
        }
        if calls.len() as u32 >= limit {
            return false;
        }
        calls.push_back(Instant::now());
        true
    }
}

/// Shared mutable view of in-flight action state, read by ready-set
/// computation and written by completed dispatches.
#[derive(Default)]
struct ExecutionState {
    statuses: BTreeMap<String, ActionStatus>,
    results: BTreeMap<String, Json>,
}

pub struct Scheduler {
    registry: Arc<ModuleRegistry>,
    guard: Arc<PermissionGuard>,
    permissions: Arc<PermissionStore>,
    approval: Arc<ApprovalGate>,
    memory: Arc<MemoryStore>,
    audit: Arc<AuditLogger>,
    intent_verifier: Option<Arc<IntentVerifier>>,
    module_semaphores: DashMap<String, Arc<Semaphore>>,
    default_concurrency: usize,
    rate_limiter: RateLimiter,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ModuleRegistry>,
        guard: Arc<PermissionGuard>,
        permissions: Arc<PermissionStore>,
        approval: Arc<ApprovalGate>,
        memory: Arc<MemoryStore>,
        audit: Arc<AuditLogger>,
        intent_verifier: Option<Arc<IntentVerifier>>,
        default_concurrency: usize,
        module_limits: BTreeMap<String, u32>,
    ) -> Self {
        Self {
            registry,
            guard,
            permissions,
            approval,
            memory,
            audit,
            intent_verifier,
            module_semaphores: DashMap::new(),
            default_concurrency,
            rate_limiter: RateLimiter::new(module_limits),
        }
    }

    fn semaphore_for(&self, module_id: &str) -> Arc<Semaphore> {
        self.module_semaphores
            .entry(module_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.default_concurrency.max(1))))
            .clone()
    }

    /// Drives a single plan to a terminal state (spec.md §4.9 steps 1-9).
    /// Takes `self` behind `Arc` so the parallel/reactive branch can move a
    /// handle into each spawned action task.
    pub async fn run_plan(
        self: Arc<Self>,
        store: Arc<dyn PlanStateStore>,
        plan: Plan,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<PlanStatus> {
        let unmet = self.registry.check_version_requirements(&plan.module_requirements);
        if !unmet.is_empty() {
            store.update_plan_status(&plan.plan_id, PlanStatus::Failed).await?;
            return Err(OrchestratorError::VersionRequirementUnmet(unmet.join("; ")));
        }

        topological_order(&plan.actions)?;

        store.update_plan_status(&plan.plan_id, PlanStatus::Running).await?;

        let state = Arc::new(Mutex::new(ExecutionState {
            statuses: plan.actions.iter().map(|a| (a.id.clone(), ActionStatus::Pending)).collect(),
            results: BTreeMap::new(),
        }));
        let action_by_id: BTreeMap<String, &Action> = plan.actions.iter().map(|a| (a.id.clone(), a)).collect();
        let mut aborted = false;

        loop {
            if *cancel_rx.borrow() {
                store.update_plan_status(&plan.plan_id, PlanStatus::Cancelled).await?;
                return Ok(PlanStatus::Cancelled);
            }

            let ready = compute_ready_set(&plan.actions, &state);
            let non_terminal_remaining = {
                let guard = state.lock().unwrap();
                guard.statuses.values().any(|s| !s.is_terminal())
            };

            if !non_terminal_remaining {
                break;
            }
            if ready.is_empty() {
                store.update_plan_status(&plan.plan_id, PlanStatus::Failed).await?;
                return Err(OrchestratorError::Deadlock);
            }
            if aborted {
                // Abort in progress: remaining non-terminal actions were
                // already marked skipped by run_action's dependent-skip pass.
                break;
            }

            match plan.execution_mode {
                ExecutionMode::Sequential => {
                    for action_id in &ready {
                        let action = action_by_id[action_id];
                        let outcome = self
                            .run_action(store.as_ref(), &plan, action, &state, cancel_rx.clone())
                            .await?;
                        if outcome == ActionOutcome::Abort {
                            skip_dependents_transitively(&plan.actions, action_id, &state);
                            aborted = true;
                            break;
                        }
                    }
                }
                ExecutionMode::Parallel | ExecutionMode::Reactive => {
                    // Reactive has no distinct scheduling behaviour from
                    // parallel here: both run the ready set concurrently up
                    // to per-module caps, and reactive's defining extra
                    // semantic (start a newly-ready action without waiting
                    // for the rest of the wave) already holds for a
                    // continuously-recomputed ready-set loop like this one.
                    let mut joinset: JoinSet<(String, Result<ActionOutcome>)> = JoinSet::new();
                    for action_id in &ready {
                        let action = action_by_id[action_id].clone();
                        let state = state.clone();
                        let plan = plan.clone();
                        let cancel_rx = cancel_rx.clone();
                        let this = self.clone();
                        let store = store.clone();
                        joinset.spawn(async move {
                            let result = this.run_action(store.as_ref(), &plan, &action, &state, cancel_rx).await;
                            (action.id.clone(), result)
                        });
                    }
                    while let Some(joined) = joinset.join_next().await {
                        let (action_id, outcome) = joined.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                        if outcome? == ActionOutcome::Abort {
                            skip_dependents_transitively(&plan.actions, &action_id, &state);
                            aborted = true;
                        }
                    }
                }
            }
        }

        let final_status = {
            let guard = state.lock().unwrap();
            if guard.statuses.values().any(|s| *s == ActionStatus::Failed) {
                PlanStatus::Failed
            } else {
                PlanStatus::Completed
            }
        };
        store.update_plan_status(&plan.plan_id, final_status).await?;
        Ok(final_status)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_action(
        &self,
        store: &dyn PlanStateStore,
        plan: &Plan,
        action: &Action,
        state: &Arc<Mutex<ExecutionState>>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<ActionOutcome> {
        mark_status(state, &action.id, ActionStatus::Running);
        store
            .update_action(&plan.plan_id, &action.id, ActionStatus::Running, None, None, 0)
            .await?;
        let started = Instant::now();
        let mut attempt: u32 = 1;
        let mut current_params = action.params.clone();

        let outcome = loop {
            if *cancel_rx.borrow() {
                break Err(OrchestratorError::Internal("plan cancelled during action dispatch".to_string()));
            }

            let ctx = self.build_context(state, action);
            let resolved = match template::resolve_params(&current_params, &ctx) {
                Ok(p) => p,
                Err(e) => break Err(e),
            };

            let decision = self.guard.check(
                &self.registry,
                &self.permissions,
                &action.module,
                &action.action,
                &resolved,
            );
            match decision {
                GuardDecision::Denied => {
                    break Err(OrchestratorError::PermissionDenied(format!(
                        "{}.{}",
                        action.module, action.action
                    )));
                }
                GuardDecision::NotGranted => {
                    break Err(OrchestratorError::PermissionNotGranted(format!(
                        "{}.{}",
                        action.module, action.action
                    )));
                }
                GuardDecision::RequiresApproval => {
                    mark_status(state, &action.id, ActionStatus::AwaitingApproval);
                    store
                        .update_action(&plan.plan_id, &action.id, ActionStatus::AwaitingApproval, None, None, attempt)
                        .await?;
                    let approval_cfg = action.approval.as_ref();
                    let timeout = approval_cfg.and_then(|c| c.timeout_seconds).unwrap_or(300);
                    let behavior = approval_cfg
                        .and_then(|c| c.timeout_behavior)
                        .unwrap_or(ApprovalTimeoutBehavior::Reject);
                    let message = approval_cfg.and_then(|c| c.message.clone());
                    let risk = approval_cfg.and_then(|c| c.risk.clone());
                    let options = approval_cfg.map(|c| c.clarification_options.clone()).unwrap_or_default();

                    let response = self
                        .approval
                        .request(&plan.plan_id, &action.id, message, risk, options, timeout, behavior)
                        .await;
                    match response {
                        Ok(crate::approval::ApprovalResponse::Approved { modified_params, .. }) => {
                            if let Some(modified) = modified_params {
                                current_params = modified.into_iter().collect();
                            }
                        }
                        Ok(crate::approval::ApprovalResponse::Rejected { reason }) => {
                            break Err(OrchestratorError::ApprovalRejected(reason));
                        }
                        Ok(crate::approval::ApprovalResponse::Skipped) => {
                            break Ok(ActionOutcome::Skipped);
                        }
                        Err(e) => break Err(e),
                    }
                }
                GuardDecision::Allowed => {}
            }

            let wants_intent_check = self
                .registry
                .get(&action.module)
                .and_then(|m| m.manifest().action_spec(&action.action).map(|a| a.intent_verified))
                .unwrap_or(false);
            if wants_intent_check {
                if let Some(verifier) = &self.intent_verifier {
                    let verdict = verifier
                        .verify_action(action, &plan.plan_id, plan.description.as_deref().unwrap_or(""))
                        .await;
                    if verdict.verdict == crate::types::Verdict::Reject {
                        break Err(OrchestratorError::SuspiciousIntent(verdict.reasoning));
                    }
                }
            }

            if !self.rate_limiter.check_and_record(&action.module) {
                break Err(OrchestratorError::RateLimited(action.module.clone()));
            }

            let permit = self
                .semaphore_for(&action.module)
                .acquire_owned()
                .await
                .expect("module semaphore is never closed");
            let dispatch = tokio::time::timeout(
                Duration::from_secs(action.timeout),
                self.registry.dispatch(&action.module, &action.action, &resolved),
            )
            .await;
            drop(permit);

            let dispatch_result = match dispatch {
                Ok(inner) => inner,
                Err(_) => Err(OrchestratorError::ActionTimeout(action.timeout)),
            };

            match dispatch_result {
                Ok(result) => break Ok(ActionOutcome::ResultValue(result)),
                Err(err) => {
                    let retryable = action.on_error == OnError::Retry && err.is_retryable();
                    if retryable {
                        if let Some(retry) = &action.retry {
                            let allowed = retry.allows_retry_on(err.classification());
                            if allowed && attempt < retry.max_attempts {
                                let delay = retry.delay_before_attempt(attempt + 1);
                                attempt += 1;
                                tokio::select! {
                                    _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => continue,
                                    _ = cancel_rx.changed() => {
                                        break Err(OrchestratorError::Internal("plan cancelled during retry delay".to_string()));
                                    }
                                }
                            }
                        }
                    }
                    break Err(err);
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(ActionOutcome::ResultValue(result)) => {
                if let Some(memory_cfg) = &action.memory {
                    if let Some(key) = &memory_cfg.write_key {
                        self.memory.write(key, result.clone());
                    }
                }
                mark_status(state, &action.id, ActionStatus::Completed);
                store
                    .update_action(&plan.plan_id, &action.id, ActionStatus::Completed, Some(result.clone()), None, attempt)
                    .await?;
                {
                    let mut guard = state.lock().unwrap();
                    guard.results.insert(action.id.clone(), result);
                }
                self.audit
                    .record(
                        TOPIC_ACTIONS,
                        serde_json::json!({
                            "event": "ACTION_COMPLETED",
                            "plan_id": plan.plan_id,
                            "action_id": action.id,
                            "module": action.module,
                            "action": action.action,
                            "attempts": attempt,
                            "duration_ms": duration_ms,
                        }),
                    )
                    .await;
                Ok(ActionOutcome::Continue)
            }
            Ok(ActionOutcome::Skipped) => {
                mark_status(state, &action.id, ActionStatus::Skipped);
                store
                    .update_action(&plan.plan_id, &action.id, ActionStatus::Skipped, None, None, attempt)
                    .await?;
                Ok(ActionOutcome::Continue)
            }
            Ok(other) => Ok(other),
            Err(err) => {
                self.audit
                    .record(
                        TOPIC_ACTIONS,
                        serde_json::json!({
                            "event": "ACTION_FAILED",
                            "plan_id": plan.plan_id,
                            "action_id": action.id,
                            "module": action.module,
                            "action": action.action,
                            "attempts": attempt,
                            "duration_ms": duration_ms,
                            "error": err.to_string(),
                        }),
                    )
                    .await;

                match action.on_error {
                    OnError::Skip => {
                        mark_status(state, &action.id, ActionStatus::Skipped);
                        store
                            .update_action(&plan.plan_id, &action.id, ActionStatus::Skipped, None, Some(err.to_string()), attempt)
                            .await?;
                        Ok(ActionOutcome::Continue)
                    }
                    OnError::Continue => {
                        mark_status(state, &action.id, ActionStatus::Failed);
                        store
                            .update_action(&plan.plan_id, &action.id, ActionStatus::Failed, None, Some(err.to_string()), attempt)
                            .await?;
                        Ok(ActionOutcome::Continue)
                    }
                    OnError::Rollback => {
                        mark_status(state, &action.id, ActionStatus::Failed);
                        store
                            .update_action(&plan.plan_id, &action.id, ActionStatus::Failed, None, Some(err.to_string()), attempt)
                            .await?;
                        if let Some(rollback) = &action.rollback {
                            let ctx = self.build_context(state, action);
                            if let Ok(resolved) = template::resolve_params(&rollback.params, &ctx) {
                                let _ = self.registry.dispatch(&action.module, &rollback.action, &resolved).await;
                            }
                        }
                        Ok(ActionOutcome::Abort)
                    }
                    OnError::Abort | OnError::Retry => {
                        mark_status(state, &action.id, ActionStatus::Failed);
                        store
                            .update_action(&plan.plan_id, &action.id, ActionStatus::Failed, None, Some(err.to_string()), attempt)
                            .await?;
                        Ok(ActionOutcome::Abort)
                    }
                }
            }
        }
    }

    fn build_context(&self, state: &Arc<Mutex<ExecutionState>>, action: &Action) -> ResolutionContext {
        let mut ctx = ResolutionContext::default();
        {
            let guard = state.lock().unwrap();
            ctx.results = guard.results.clone();
        }
        if let Some(memory_cfg) = &action.memory {
            ctx.memory = self.memory.read_many(&memory_cfg.read_keys);
        }
        ctx.env = self.allowed_env_snapshot();
        ctx
    }

    /// Snapshot of process env vars filtered to the active profile's
    /// `allowed_env_vars` (spec.md §4.3's resolution context). `"*"` exposes
    /// every currently-set env var.
    fn allowed_env_snapshot(&self) -> BTreeMap<String, String> {
        let allowed = &self.guard.profile().allowed_env_vars;
        if allowed.iter().any(|n| n == "*") {
            return std::env::vars().collect();
        }
        allowed
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ActionOutcome {
    ResultValue(Json),
    Continue,
    Skipped,
    Abort,
}

fn mark_status(state: &Arc<Mutex<ExecutionState>>, action_id: &str, status: ActionStatus) {
    state.lock().unwrap().statuses.insert(action_id.to_string(), status);
}

/// Ready set: `pending` actions all of whose `depends_on` are `completed`.
/// Declaration order is preserved (spec.md §4.9 "Tie-breaking").
fn compute_ready_set(actions: &[Action], state: &Arc<Mutex<ExecutionState>>) -> Vec<String> {
    let guard = state.lock().unwrap();
    actions
        .iter()
        .filter(|a| guard.statuses.get(&a.id) == Some(&ActionStatus::Pending))
        .filter(|a| {
            a.depends_on
                .iter()
                .all(|dep| guard.statuses.get(dep) == Some(&ActionStatus::Completed))
        })
        .map(|a| a.id.clone())
        .collect()
}

/// Marks every action transitively depending on `root` as skipped (abort /
/// rollback error policy, spec.md §4.9 step 8).
fn skip_dependents_transitively(actions: &[Action], root: &str, state: &Arc<Mutex<ExecutionState>>) {
    let mut to_skip: BTreeSet<String> = BTreeSet::new();
    let mut frontier = vec![root.to_string()];
    while let Some(current) = frontier.pop() {
        for action in actions {
            if action.depends_on.contains(&current) && !to_skip.contains(&action.id) {
                to_skip.insert(action.id.clone());
                frontier.push(action.id.clone());
            }
        }
    }
    let mut guard = state.lock().unwrap();
    for id in to_skip {
        if !guard.statuses.get(&id).is_some_and(|s| s.is_terminal()) {
            guard.statuses.insert(id, ActionStatus::Skipped);
        }
    }
}

/// Kahn's algorithm cycle check over `depends_on` edges. The parser already
/// rejects unknown-id references (spec.md §3); this catches cycles among
/// otherwise-valid ids.
fn topological_order(actions: &[Action]) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<String, usize> = actions.iter().map(|a| (a.id.clone(), 0)).collect();
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for action in actions {
        for dep in &action.depends_on {
            *in_degree.get_mut(&action.id).unwrap() += 1;
            dependents.entry(dep.clone()).or_default().push(action.id.clone());
        }
    }
    let mut queue: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::new();
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        if let Some(deps) = dependents.get(&id) {
            for dep in deps {
                let degree = in_degree.get_mut(dep).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dep.clone());
                }
            }
        }
    }
    if order.len() != actions.len() {
        let cyclic: Vec<String> = in_degree
            .into_iter()
            .filter(|(id, _)| !order.contains(id))
            .map(|(id, _)| id)
            .collect();
        return Err(OrchestratorError::DependencyCycle(cyclic));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str, depends_on: &[&str]) -> Action {
        Action {
            id: id.to_string(),
            module: "noop".to_string(),
            action: "run".to_string(),
            params: BTreeMap::new(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            on_error: OnError::Abort,
            timeout: 5,
            requires_approval: false,
            retry: None,
            rollback: None,
            perception: None,
            memory: None,
            approval: None,
            target_node: None,
        }
    }

    #[test]
    fn topological_order_detects_cycle() {
        let actions = vec![action("a", &["b"]), action("b", &["a"])];
        let err = topological_order(&actions).unwrap_err();
        assert_eq!(err.classification(), "DependencyCycle");
    }

    #[test]
    fn topological_order_succeeds_on_dag() {
        let actions = vec![action("a", &[]), action("b", &["a"]), action("c", &["a", "b"])];
        let order = topological_order(&actions).unwrap();
        assert_eq!(order.len(), 3);
        assert!(order.iter().position(|x| x == "a").unwrap() < order.iter().position(|x| x == "b").unwrap());
    }

    #[test]
    fn ready_set_respects_dependencies() {
        let actions = vec![action("a", &[]), action("b", &["a"])];
        let state = Arc::new(Mutex::new(ExecutionState {
            statuses: actions.iter().map(|a| (a.id.clone(), ActionStatus::Pending)).collect(),
            results: BTreeMap::new(),
        }));
        let ready = compute_ready_set(&actions, &state);
        assert_eq!(ready, vec!["a".to_string()]);
        mark_status(&state, "a", ActionStatus::Completed);
        let ready = compute_ready_set(&actions, &state);
        assert_eq!(ready, vec!["b".to_string()]);
    }

    #[test]
    fn skip_dependents_is_transitive() {
        let actions = vec![action("a", &[]), action("b", &["a"]), action("c", &["b"])];
        let state = Arc::new(Mutex::new(ExecutionState {
            statuses: actions.iter().map(|a| (a.id.clone(), ActionStatus::Pending)).collect(),
            results: BTreeMap::new(),
        }));
        skip_dependents_transitively(&actions, "a", &state);
        let guard = state.lock().unwrap();
        assert_eq!(guard.statuses["b"], ActionStatus::Skipped);
        assert_eq!(guard.statuses["c"], ActionStatus::Skipped);
    }
}
