//! Permission store and permission guard (spec.md §4.6).
//!
//! Profile presets are grounded in the teacher's `SecurityPolicies` preset
//! methods (`security_policies.rs`), adapted from RTFS capability allowlists
//! to this spec's risk-tiered profile names and sandbox-path enforcement.
//! The guard's position ahead of dispatch mirrors the teacher's
//! `governance_kernel.rs` policy enforcement point.

use dashmap::DashMap;
use std::collections::BTreeSet;

use crate::module_registry::ModuleRegistry;
use crate::types::{PermissionGrant, PermissionScope, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    RequiresApproval,
    Denied,
    /// The action declares `permission_required` and neither auto-grants
    /// under the active profile nor has a matching grant in the permission
    /// store (spec.md §3 "denied" branch of the grant model; surfaced as
    /// `PermissionNotGranted`, distinct from a risk-ceiling `Denied`).
    NotGranted,
}

#[derive(Debug, Clone)]
pub struct PermissionProfile {
    pub name: &'static str,
    /// Risk at or below this auto-executes.
    pub auto_allow_up_to: RiskLevel,
    /// Risk at or below this is allowed subject to approval; above it is denied outright.
    pub max_permitted: RiskLevel,
    pub sandbox_paths: Vec<String>,
    /// Env var names the template resolver's `{{env.NAME}}` is allowed to
    /// read under this profile (spec.md §4.3's "filtered set of env vars the
    /// profile allows"). Empty means no env var is exposed to templates.
    pub allowed_env_vars: Vec<String>,
}

impl PermissionProfile {
    pub fn readonly() -> Self {
        Self {
            name: "readonly",
            auto_allow_up_to: RiskLevel::Low,
            max_permitted: RiskLevel::Low,
            sandbox_paths: Vec::new(),
            allowed_env_vars: Vec::new(),
        }
    }

    pub fn local_worker() -> Self {
        Self {
            name: "local_worker",
            auto_allow_up_to: RiskLevel::Medium,
            max_permitted: RiskLevel::High,
            sandbox_paths: Vec::new(),
            allowed_env_vars: vec!["PATH".to_string(), "HOME".to_string()],
        }
    }

    pub fn power_user() -> Self {
        Self {
            name: "power_user",
            auto_allow_up_to: RiskLevel::High,
            max_permitted: RiskLevel::Critical,
            sandbox_paths: Vec::new(),
            allowed_env_vars: vec!["PATH".to_string(), "HOME".to_string(), "USER".to_string()],
        }
    }

    pub fn unrestricted() -> Self {
        Self {
            name: "unrestricted",
            auto_allow_up_to: RiskLevel::Critical,
            max_permitted: RiskLevel::Critical,
            sandbox_paths: Vec::new(),
            allowed_env_vars: vec!["*".to_string()],
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "readonly" => Some(Self::readonly()),
            "local_worker" => Some(Self::local_worker()),
            "power_user" => Some(Self::power_user()),
            "unrestricted" => Some(Self::unrestricted()),
            _ => None,
        }
    }

    pub fn with_sandbox_paths(mut self, paths: Vec<String>) -> Self {
        self.sandbox_paths = paths;
        self
    }

    pub fn with_allowed_env_vars(mut self, names: Vec<String>) -> Self {
        self.allowed_env_vars = names;
        self
    }
}

/// Process-wide store of granted permissions (spec.md §3 "Permission grant").
pub struct PermissionStore {
    grants: DashMap<(String, String), PermissionGrant>,
}

impl Default for PermissionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionStore {
    pub fn new() -> Self {
        Self {
            grants: DashMap::new(),
        }
    }

    pub fn grant(&self, grant: PermissionGrant) {
        let key = (grant.module_id.clone(), grant.permission.clone());
        tracing::info!(module = %grant.module_id, permission = %grant.permission, scope = ?grant.scope, "permission granted");
        self.grants.insert(key, grant);
    }

    pub fn has_grant(&self, module_id: &str, permission: &str) -> bool {
        self.grants.contains_key(&(module_id.to_string(), permission.to_string()))
    }

    pub fn revoke(&self, module_id: &str, permission: &str) {
        self.grants.remove(&(module_id.to_string(), permission.to_string()));
    }

    /// Called on daemon restart: session-scoped grants do not survive a process exit.
    pub fn clear_session_grants(&self) {
        self.grants.retain(|_, g| g.scope != PermissionScope::Session);
    }

    pub fn list(&self) -> Vec<PermissionGrant> {
        self.grants.iter().map(|e| e.value().clone()).collect()
    }
}

/// Enforces the active profile plus an explicit `require_approval_for` list.
pub struct PermissionGuard {
    profile: PermissionProfile,
    require_approval_for: BTreeSet<String>,
}

impl PermissionGuard {
    pub fn new(profile: PermissionProfile, require_approval_for: Vec<String>) -> Self {
        Self {
            profile,
            require_approval_for: require_approval_for.into_iter().collect(),
        }
    }

    pub fn profile(&self) -> &PermissionProfile {
        &self.profile
    }

    /// `check(module_id, action_name, params) → Allowed | RequiresApproval | Denied | NotGranted`
    /// (spec.md §4.6). Looks up the action's declared risk and
    /// `permission_required` via the module registry and applies, in order:
    /// sandbox-path restrictions, the explicit grant store (spec.md §3's
    /// "user-granted via an explicit request action" pathway), the explicit
    /// approval list, then the profile's risk ceiling.
    pub fn check(
        &self,
        registry: &ModuleRegistry,
        store: &PermissionStore,
        module_id: &str,
        action_name: &str,
        params: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Decision {
        if !self.sandbox_allows(params) {
            return Decision::Denied;
        }

        let action_spec = registry.get(module_id).and_then(|m| m.manifest().action_spec(action_name).cloned());
        let risk = action_spec.as_ref().map(|a| a.risk_level).unwrap_or(RiskLevel::Medium);

        if let Some(permission) = action_spec.as_ref().and_then(|a| a.permission_required.as_deref()) {
            let auto_granted = risk <= self.profile.auto_allow_up_to;
            if !auto_granted && !store.has_grant(module_id, permission) {
                return Decision::NotGranted;
            }
        }

        let qualified = format!("{}.{}", module_id, action_name);
        if self.require_approval_for.contains(&qualified) {
            if risk > self.profile.max_permitted {
                return Decision::Denied;
            }
            return Decision::RequiresApproval;
        }

        if risk > self.profile.max_permitted {
            return Decision::Denied;
        }
        if risk <= self.profile.auto_allow_up_to {
            Decision::Allowed
        } else {
            Decision::RequiresApproval
        }
    }

    fn sandbox_allows(&self, params: &std::collections::BTreeMap<String, serde_json::Value>) -> bool {
        if self.profile.sandbox_paths.is_empty() {
            return true;
        }
        fn is_absolute_path(s: &str) -> bool {
            s.starts_with('/') || (s.len() > 2 && s.as_bytes()[1] == b':' && s.as_bytes()[2] == b'\\')
        }
        fn check_value(value: &serde_json::Value, sandbox: &[String]) -> bool {
            match value {
                serde_json::Value::String(s) => {
                    if is_absolute_path(s) {
                        sandbox.iter().any(|p| s.starts_with(p.as_str()))
                    } else {
                        true
                    }
                }
                serde_json::Value::Array(items) => items.iter().all(|v| check_value(v, sandbox)),
                serde_json::Value::Object(map) => map.values().all(|v| check_value(v, sandbox)),
                _ => true,
            }
        }
        params.values().all(|v| check_value(v, &self.profile.sandbox_paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_registry::{ActionSpec, Module, ModuleManifest, ParamSpec, ParamType};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct StubModule(ModuleManifest);

    #[async_trait]
    impl Module for StubModule {
        fn manifest(&self) -> &ModuleManifest {
            &self.0
        }
        async fn execute(&self, _: &str, _: &BTreeMap<String, serde_json::Value>) -> crate::error::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    fn registry_with(risk: RiskLevel) -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(StubModule(ModuleManifest {
            id: "fs".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            platforms: vec![],
            actions: vec![ActionSpec {
                name: "write".to_string(),
                description: String::new(),
                params: vec![ParamSpec {
                    name: "path".to_string(),
                    param_type: ParamType::String,
                    required: true,
                    default: None,
                    enum_values: None,
                }],
                returns_description: String::new(),
                permission_required: None,
                risk_level: risk,
                irreversible: true,
                intent_verified: false,
            }],
            declared_permissions: vec![],
            dependencies: vec![],
        })));
        registry
    }

    fn registry_with_permission(risk: RiskLevel, permission: &str) -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        registry.register(Arc::new(StubModule(ModuleManifest {
            id: "fs".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            platforms: vec![],
            actions: vec![ActionSpec {
                name: "write".to_string(),
                description: String::new(),
                params: vec![],
                returns_description: String::new(),
                permission_required: Some(permission.to_string()),
                risk_level: risk,
                irreversible: true,
                intent_verified: false,
            }],
            declared_permissions: vec![],
            dependencies: vec![],
        })));
        registry
    }

    #[test]
    fn readonly_denies_high_risk() {
        let registry = registry_with(RiskLevel::High);
        let store = PermissionStore::new();
        let guard = PermissionGuard::new(PermissionProfile::readonly(), vec![]);
        let params = BTreeMap::new();
        assert_eq!(guard.check(&registry, &store, "fs", "write", &params), Decision::Denied);
    }

    #[test]
    fn local_worker_requires_approval_for_high_risk() {
        let registry = registry_with(RiskLevel::High);
        let store = PermissionStore::new();
        let guard = PermissionGuard::new(PermissionProfile::local_worker(), vec![]);
        let params = BTreeMap::new();
        assert_eq!(
            guard.check(&registry, &store, "fs", "write", &params),
            Decision::RequiresApproval
        );
    }

    #[test]
    fn explicit_approval_list_overrides_auto_allow() {
        let registry = registry_with(RiskLevel::Low);
        let store = PermissionStore::new();
        let guard = PermissionGuard::new(
            PermissionProfile::unrestricted(),
            vec!["fs.write".to_string()],
        );
        let params = BTreeMap::new();
        assert_eq!(
            guard.check(&registry, &store, "fs", "write", &params),
            Decision::RequiresApproval
        );
    }

    #[test]
    fn sandbox_path_outside_prefix_denied() {
        let registry = registry_with(RiskLevel::Low);
        let store = PermissionStore::new();
        let guard = PermissionGuard::new(
            PermissionProfile::unrestricted().with_sandbox_paths(vec!["/home/agent".to_string()]),
            vec![],
        );
        let mut params = BTreeMap::new();
        params.insert("path".to_string(), serde_json::json!("/etc/passwd"));
        assert_eq!(guard.check(&registry, &store, "fs", "write", &params), Decision::Denied);
    }

    #[test]
    fn sandbox_path_inside_prefix_allowed() {
        let registry = registry_with(RiskLevel::Low);
        let store = PermissionStore::new();
        let guard = PermissionGuard::new(
            PermissionProfile::unrestricted().with_sandbox_paths(vec!["/home/agent".to_string()]),
            vec![],
        );
        let mut params = BTreeMap::new();
        params.insert("path".to_string(), serde_json::json!("/home/agent/notes.txt"));
        assert_eq!(guard.check(&registry, &store, "fs", "write", &params), Decision::Allowed);
    }

    #[test]
    fn permission_required_without_grant_is_not_granted() {
        let registry = registry_with_permission(RiskLevel::High, "fs.write");
        let store = PermissionStore::new();
        let guard = PermissionGuard::new(PermissionProfile::unrestricted(), vec![]);
        let params = BTreeMap::new();
        assert_eq!(
            guard.check(&registry, &store, "fs", "write", &params),
            Decision::NotGranted
        );
    }

    #[test]
    fn permission_required_with_grant_is_allowed() {
        let registry = registry_with_permission(RiskLevel::High, "fs.write");
        let store = PermissionStore::new();
        store.grant(PermissionGrant {
            permission: "fs.write".to_string(),
            module_id: "fs".to_string(),
            scope: PermissionScope::Permanent,
            granted_by: "user".to_string(),
            reason: None,
            created_at: chrono::Utc::now(),
        });
        let guard = PermissionGuard::new(PermissionProfile::unrestricted(), vec![]);
        let params = BTreeMap::new();
        assert_eq!(
            guard.check(&registry, &store, "fs", "write", &params),
            Decision::Allowed
        );
    }

    #[test]
    fn permission_required_auto_granted_under_low_risk() {
        let registry = registry_with_permission(RiskLevel::Low, "fs.write");
        let store = PermissionStore::new();
        let guard = PermissionGuard::new(PermissionProfile::local_worker(), vec![]);
        let params = BTreeMap::new();
        assert_eq!(
            guard.check(&registry, &store, "fs", "write", &params),
            Decision::Allowed
        );
    }

    #[test]
    fn session_grants_cleared_on_restart() {
        let store = PermissionStore::new();
        store.grant(PermissionGrant {
            permission: "net.http".to_string(),
            module_id: "http".to_string(),
            scope: PermissionScope::Session,
            granted_by: "user".to_string(),
            reason: None,
            created_at: chrono::Utc::now(),
        });
        assert!(store.has_grant("http", "net.http"));
        store.clear_session_grants();
        assert!(!store.has_grant("http", "net.http"));
    }
}
