//! IML plan/action data model (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

pub const PROTOCOL_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Reactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Standard,
    Compiler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Abort,
    Continue,
    Retry,
    Rollback,
    Skip,
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Abort
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Waiting,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Failed
                | ActionStatus::Skipped
                | ActionStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_seconds: f64,
    pub backoff_factor: f64,
    #[serde(default)]
    pub retry_on: Vec<String>,
}

impl RetryConfig {
    pub fn default_synthesized() -> Self {
        Self {
            max_attempts: 3,
            delay_seconds: 1.0,
            backoff_factor: 2.0,
            retry_on: Vec::new(),
        }
    }

    /// Delay before attempt `n` (1-indexed: n=2 is the delay before the 2nd attempt).
    pub fn delay_before_attempt(&self, n: u32) -> f64 {
        self.delay_seconds * self.backoff_factor.powi((n - 1) as i32)
    }

    pub fn allows_retry_on(&self, error_class: &str) -> bool {
        self.retry_on.is_empty() || self.retry_on.iter().any(|c| c == error_class)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub action: String,
    #[serde(default)]
    pub params: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub read_keys: Vec<String>,
    pub write_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTimeoutBehavior {
    Reject,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub message: Option<String>,
    pub risk: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub timeout_behavior: Option<ApprovalTimeoutBehavior>,
    #[serde(default)]
    pub clarification_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerTrace {
    pub generation_approved: bool,
    #[serde(default)]
    pub phases: Vec<Json>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub creator: Option<String>,
    pub llm_model: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub module: String,
    pub action: String,
    #[serde(default)]
    pub params: BTreeMap<String, Json>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub requires_approval: bool,
    pub retry: Option<RetryConfig>,
    pub rollback: Option<RollbackConfig>,
    pub perception: Option<Json>,
    pub memory: Option<MemoryConfig>,
    pub approval: Option<ApprovalConfig>,
    pub target_node: Option<String>,
}

fn default_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    pub description: Option<String>,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub plan_mode: PlanMode,
    pub compiler_trace: Option<CompilerTrace>,
    #[serde(default)]
    pub metadata: PlanMetadata,
    #[serde(default)]
    pub module_requirements: BTreeMap<String, String>,
    pub actions: Vec<Action>,
}

impl Default for PlanMode {
    fn default() -> Self {
        PlanMode::Standard
    }
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Per-action execution state as tracked by the plan state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionState {
    pub action_id: String,
    pub status: ActionStatus,
    pub attempts: u32,
    pub result: Option<Json>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ActionState {
    pub fn pending(action_id: &str) -> Self {
        Self {
            action_id: action_id.to_string(),
            status: ActionStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Full state of a plan as returned by `get_plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanState {
    pub plan: Plan,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub actions: BTreeMap<String, ActionState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: String,
    pub status: PlanStatus,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Session,
    Permanent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub permission: String,
    pub module_id: String,
    pub scope: PermissionScope,
    pub granted_by: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
    Warn,
    Clarify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatDetail {
    pub threat_type: String,
    pub description: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verdict: Verdict,
    pub risk_level: RiskLevel,
    pub reasoning: String,
    #[serde(default)]
    pub threats: Vec<ThreatDetail>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub analysis_duration_ms: u64,
    pub source_model: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanVerdict {
    Allow,
    Warn,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scanner_id: String,
    pub verdict: ScanVerdict,
    pub risk_score: f64,
    #[serde(default)]
    pub threat_types: Vec<String>,
    #[serde(default)]
    pub matched_pattern_ids: Vec<String>,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub verdict: ScanVerdict,
    pub risk_score: f64,
    pub short_circuited: bool,
    pub scan_results: Vec<ScanResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_sequence_matches_exponential_backoff() {
        let retry = RetryConfig {
            max_attempts: 4,
            delay_seconds: 1.0,
            backoff_factor: 2.0,
            retry_on: Vec::new(),
        };
        let delays: Vec<f64> = (1..retry.max_attempts).map(|n| retry.delay_before_attempt(n)).collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn max_attempts_one_allows_no_retry_delay_lookup() {
        let retry = RetryConfig {
            max_attempts: 1,
            delay_seconds: 1.0,
            backoff_factor: 2.0,
            retry_on: Vec::new(),
        };
        assert!((1..retry.max_attempts).next().is_none());
    }
}
