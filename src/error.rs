//! Crate-wide error taxonomy.
//!
//! Every variant maps to a stable classification string used at the API
//! boundary and in audit events (see `classification()`).

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    #[error("failed to parse plan input: {0}")]
    Parse(String),

    #[error("validation failed at {location}: {message}")]
    Validation { location: String, message: String },

    #[error("module '{0}' failed to load: {1}")]
    ModuleLoad(String, String),

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("action '{action}' not found in module '{module}'")]
    ActionNotFound { module: String, action: String },

    #[error("action execution failed: {0}")]
    ActionExecution(String),

    #[error("action timed out after {0}s")]
    ActionTimeout(u64),

    #[error("template resolution failed: {0}")]
    TemplateResolution(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("permission not granted: {0} (request via the security module)")]
    PermissionNotGranted(String),

    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("approval timed out")]
    ApprovalTimeout,

    #[error("rate limited on module '{0}'")]
    RateLimited(String),

    #[error("suspicious intent detected: {0}")]
    SuspiciousIntent(String),

    #[error("intent verifier failure: {0}")]
    IntentVerifierFailure(String),

    #[error("module version requirement unmet: {0}")]
    VersionRequirementUnmet(String),

    #[error("dependency cycle detected among actions: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("deadlock: no ready actions but plan not terminal")]
    Deadlock,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("plan id '{0}' already exists")]
    DuplicatePlan(String),

    #[error("concurrent plan limit ({0}) reached; resubmit later")]
    ConcurrencyLimitExceeded(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable classification string, e.g. for HTTP status mapping or audit payloads.
    pub fn classification(&self) -> &'static str {
        match self {
            OrchestratorError::Parse(_) => "ParseError",
            OrchestratorError::Validation { .. } => "ValidationError",
            OrchestratorError::ModuleLoad(..) => "ModuleLoadError",
            OrchestratorError::UnknownModule(_) => "UnknownModuleError",
            OrchestratorError::ActionNotFound { .. } => "ActionNotFoundError",
            OrchestratorError::ActionExecution(_) => "ActionExecutionError",
            OrchestratorError::ActionTimeout(_) => "ActionTimeout",
            OrchestratorError::TemplateResolution(_) => "TemplateResolutionError",
            OrchestratorError::PermissionDenied(_) => "PermissionDenied",
            OrchestratorError::PermissionNotGranted(_) => "PermissionNotGranted",
            OrchestratorError::ApprovalRejected(_) => "ApprovalRejected",
            OrchestratorError::ApprovalTimeout => "ApprovalTimeout",
            OrchestratorError::RateLimited(_) => "RateLimited",
            OrchestratorError::SuspiciousIntent(_) => "SuspiciousIntent",
            OrchestratorError::IntentVerifierFailure(_) => "IntentVerifierFailure",
            OrchestratorError::VersionRequirementUnmet(_) => "VersionRequirementUnmet",
            OrchestratorError::DependencyCycle(_) => "DependencyCycle",
            OrchestratorError::Deadlock => "Deadlock",
            OrchestratorError::Storage(_) => "StorageError",
            OrchestratorError::PlanNotFound(_) => "PlanNotFound",
            OrchestratorError::DuplicatePlan(_) => "DuplicatePlan",
            OrchestratorError::ConcurrencyLimitExceeded(_) => "ConcurrencyLimitExceeded",
            OrchestratorError::Internal(_) => "InternalError",
        }
    }

    /// Whether this error class is eligible for the action-level retry loop.
    /// Errors from security/policy layers short-circuit before dispatch and
    /// are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ActionExecution(_)
                | OrchestratorError::ActionTimeout(_)
                | OrchestratorError::RateLimited(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Parse(e.to_string())
    }
}
