//! Approval gate: human-in-the-loop suspend/resume for actions requiring
//! sign-off (spec.md §4.7).
//!
//! Request/category shape grounded in the teacher's `approval::types`
//! (`ApprovalCategory`, status enum); the oneshot-per-request suspend idiom
//! grounded in the teacher's `chat::connector` use of `tokio::sync::oneshot`
//! for request/response pairing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as Json;
use tokio::sync::oneshot;

use crate::error::{OrchestratorError, Result};
use crate::types::ApprovalTimeoutBehavior;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Approved, optionally overriding the action's resolved params.
    Approve { modified_params: Option<serde_json::Map<String, Json>> },
    Reject { reason: String },
    Skip,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub plan_id: String,
    pub action_id: String,
    pub message: Option<String>,
    pub risk: Option<String>,
    pub clarification_options: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalResponse {
    Approved { modified_params: Option<serde_json::Map<String, Json>>, approved_by: String },
    Rejected { reason: String },
    Skipped,
}

struct Entry {
    pending: PendingRequest,
    responder: oneshot::Sender<(Decision, String)>,
}

/// Owns the map of outstanding approval requests and resolves them on
/// decision, timeout, or plan cancellation.
pub struct ApprovalGate {
    entries: DashMap<(String, String), Entry>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Suspends the caller until a decision arrives, the timeout elapses, or
    /// the plan is cancelled. `timeout_behavior` governs what happens on
    /// expiry.
    pub async fn request(
        &self,
        plan_id: &str,
        action_id: &str,
        message: Option<String>,
        risk: Option<String>,
        clarification_options: Vec<String>,
        timeout_seconds: u64,
        timeout_behavior: ApprovalTimeoutBehavior,
    ) -> Result<ApprovalResponse> {
        let (tx, rx) = oneshot::channel();
        let key = (plan_id.to_string(), action_id.to_string());
        let pending = PendingRequest {
            plan_id: plan_id.to_string(),
            action_id: action_id.to_string(),
            message,
            risk,
            clarification_options,
            requested_at: Utc::now(),
        };
        self.entries.insert(
            key.clone(),
            Entry {
                pending,
                responder: tx,
            },
        );
        tracing::info!(plan_id, action_id, "approval requested");

        let outcome = tokio::select! {
            received = rx => received.map_err(|_| OrchestratorError::Internal("approval responder dropped".to_string())),
            _ = tokio::time::sleep(std::time::Duration::from_secs(timeout_seconds)) => {
                self.entries.remove(&key);
                return match timeout_behavior {
                    ApprovalTimeoutBehavior::Reject => Err(OrchestratorError::ApprovalTimeout),
                    ApprovalTimeoutBehavior::Skip => Ok(ApprovalResponse::Skipped),
                };
            }
        };

        self.entries.remove(&key);
        let (decision, approved_by) = outcome?;
        Ok(match decision {
            Decision::Approve { modified_params } => ApprovalResponse::Approved {
                modified_params,
                approved_by,
            },
            Decision::Reject { reason } => ApprovalResponse::Rejected { reason },
            Decision::Skip => ApprovalResponse::Skipped,
        })
    }

    /// Resolves a pending request. Returns an error if no matching request exists.
    pub fn submit_decision(
        &self,
        plan_id: &str,
        action_id: &str,
        decision: Decision,
        approved_by: &str,
    ) -> Result<()> {
        let key = (plan_id.to_string(), action_id.to_string());
        let (_, entry) = self.entries.remove(&key).ok_or_else(|| {
            OrchestratorError::Internal(format!(
                "no pending approval for plan '{}' action '{}'",
                plan_id, action_id
            ))
        })?;
        let _ = entry.responder.send((decision, approved_by.to_string()));
        Ok(())
    }

    pub fn list_pending(&self, plan_id: Option<&str>) -> Vec<PendingRequest> {
        self.entries
            .iter()
            .filter(|e| plan_id.map_or(true, |p| e.key().0 == p))
            .map(|e| e.value().pending.clone())
            .collect()
    }

    /// Resolves every pending request for a plan as rejected.
    pub fn cancel(&self, plan_id: &str) {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == plan_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                let _ = entry.responder.send((
                    Decision::Reject {
                        reason: "plan cancelled".to_string(),
                    },
                    "system".to_string(),
                ));
            }
        }
    }
}
