//! Layered configuration (spec.md §6 "Configuration").
//!
//! Grounded in `original_source/.../config.py`'s sub-config blocks and
//! priority order (defaults → system file → user file → env vars), adapted
//! to this crate's ambient stack: `serde` + `toml` for file parsing (the
//! teacher's own config loading, where present, is TOML-based rather than
//! YAML) instead of the original's `pydantic_settings`.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
    pub sync_plan_timeout: u64,
    pub rate_limit_per_minute: u32,
    pub max_result_size: u64,
    pub plan_retention_hours: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 40000,
            workers: 1,
            sync_plan_timeout: 300,
            rate_limit_per_minute: 60,
            max_result_size: 524_288,
            plan_retention_hours: 168,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub permission_profile: String,
    pub require_approval_for: Vec<String>,
    pub max_plan_actions: u32,
    pub max_concurrent_plans: u32,
    pub sandbox_paths: Vec<String>,
    pub approval_timeout_seconds: u64,
    pub approval_timeout_behavior: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            permission_profile: "local_worker".to_string(),
            require_approval_for: vec![
                "filesystem.delete_file".to_string(),
                "filesystem.delete_directory".to_string(),
                "os_exec.run_command".to_string(),
                "os_exec.kill_process".to_string(),
                "database.execute_query".to_string(),
            ],
            max_plan_actions: 50,
            max_concurrent_plans: 5,
            sandbox_paths: Vec::new(),
            approval_timeout_seconds: 300,
            approval_timeout_behavior: "reject".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
    pub fallbacks: std::collections::BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentVerifierConfig {
    pub enabled: bool,
    pub strict: bool,
    pub provider: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub cache_size: usize,
    pub cache_ttl_seconds: u64,
    pub custom_threat_categories: Vec<String>,
    pub disabled_threat_categories: Vec<String>,
}

impl Default for IntentVerifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            provider: String::new(),
            model: String::new(),
            timeout_seconds: 30,
            cache_size: 256,
            cache_ttl_seconds: 300,
            custom_threat_categories: Vec::new(),
            disabled_threat_categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub enabled: bool,
    pub fail_fast: bool,
    pub reject_threshold: f64,
    pub warn_threshold: f64,
    pub heuristic_enabled: bool,
    pub heuristic_disabled_patterns: Vec<String>,
    /// Extra regex patterns added to the built-in heuristic rule set
    /// (spec.md §6), each treated as a warn-tier custom rule.
    pub heuristic_extra_patterns: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_fast: true,
            reject_threshold: 0.7,
            warn_threshold: 0.3,
            heuristic_enabled: true,
            heuristic_disabled_patterns: Vec::new(),
            heuristic_extra_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub default_concurrency: u32,
    pub module_limits: std::collections::BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub modules: ModuleConfig,
    pub intent_verifier: IntentVerifierConfig,
    pub scanner: ScannerConfig,
    pub resources: ResourcesConfig,
}

impl BridgeConfig {
    /// Loads defaults, then a system file, then a user file, then an
    /// `LLMOS_`-prefixed environment overlay (ascending priority, per
    /// spec.md §6's config-sources ordering).
    pub fn load(system_path: Option<&Path>, user_path: Option<&Path>) -> crate::error::Result<Self> {
        let mut config = BridgeConfig::default();
        if let Some(path) = system_path {
            config = merge_file(config, path)?;
        }
        if let Some(path) = user_path {
            config = merge_file(config, path)?;
        }
        apply_env_overlay(&mut config);
        Ok(config)
    }
}

fn merge_file(base: BridgeConfig, path: &Path) -> crate::error::Result<BridgeConfig> {
    if !path.exists() {
        return Ok(base);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| crate::error::OrchestratorError::Internal(format!("reading config {}: {}", path.display(), e)))?;
    let mut value: toml::Value = toml::from_str(&contents)
        .map_err(|e| crate::error::OrchestratorError::Internal(format!("parsing config {}: {}", path.display(), e)))?;
    let base_value = toml::Value::try_from(&base)
        .map_err(|e| crate::error::OrchestratorError::Internal(e.to_string()))?;
    merge_toml(&mut value, base_value);
    value
        .try_into()
        .map_err(|e: toml::de::Error| crate::error::OrchestratorError::Internal(e.to_string()))
}

/// Overlays `overridden` (the file contents) on top of `fallback` (prior
/// layer), keeping `overridden`'s values where present and filling gaps
/// from `fallback` — this lets a user file specify only the fields it cares
/// about.
fn merge_toml(overridden: &mut toml::Value, fallback: toml::Value) {
    if let (toml::Value::Table(over), toml::Value::Table(base)) = (&mut *overridden, fallback) {
        for (key, base_value) in base {
            over.entry(key).or_insert(base_value);
        }
    }
}

/// `LLMOS_SERVER__PORT=8080` → `server.port = 8080`, following spec.md §6's
/// `LLMOS_` prefix with `__` as the nesting separator.
fn apply_env_overlay(config: &mut BridgeConfig) {
    let mut value = match toml::Value::try_from(&*config) {
        Ok(v) => v,
        Err(_) => return,
    };
    for (key, raw) in std::env::vars() {
        let Some(rest) = key.strip_prefix("LLMOS_") else {
            continue;
        };
        let path: Vec<String> = rest.split("__").map(|s| s.to_ascii_lowercase()).collect();
        set_path(&mut value, &path, &raw);
    }
    if let Ok(merged) = value.try_into() {
        *config = merged;
    }
}

fn set_path(value: &mut toml::Value, path: &[String], raw: &str) {
    if path.is_empty() {
        return;
    }
    if path.len() == 1 {
        if let toml::Value::Table(table) = value {
            table.insert(path[0].clone(), infer_toml_value(raw));
        }
        return;
    }
    if let toml::Value::Table(table) = value {
        let entry = table
            .entry(path[0].clone())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        set_path(entry, &path[1..], raw);
    }
}

fn infer_toml_value(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}
