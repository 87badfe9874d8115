//! Template expansion for action params (spec.md §4.3).
//!
//! Expands `{{result.<action_id>.<dotted.path>}}`, `{{memory.<key>}}`, and
//! `{{env.<NAME>}}`. Resolution happens once, immediately before dispatch,
//! against a snapshot `ResolutionContext` taken at dispatch time.

use regex::Regex;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{OrchestratorError, Result};

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").unwrap())
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Completed-action results in this plan, keyed by action id.
    pub results: BTreeMap<String, Json>,
    /// Memory values loaded per `memory.read_keys`.
    pub memory: BTreeMap<String, Json>,
    /// Filtered set of env vars the profile allows.
    pub env: BTreeMap<String, String>,
}

impl ResolutionContext {
    fn lookup(&self, path: &str) -> Result<Json> {
        let mut parts = path.split('.');
        let root = parts
            .next()
            .ok_or_else(|| OrchestratorError::TemplateResolution(format!("empty template '{}'", path)))?;
        match root {
            "result" => {
                let action_id = parts.next().ok_or_else(|| {
                    OrchestratorError::TemplateResolution(format!(
                        "missing action id in template '{}'",
                        path
                    ))
                })?;
                let base = self.results.get(action_id).ok_or_else(|| {
                    OrchestratorError::TemplateResolution(format!(
                        "no result for action '{}'",
                        action_id
                    ))
                })?;
                traverse(base, parts, path)
            }
            "memory" => {
                let key = parts.next().ok_or_else(|| {
                    OrchestratorError::TemplateResolution(format!(
                        "missing memory key in template '{}'",
                        path
                    ))
                })?;
                let base = self.memory.get(key).ok_or_else(|| {
                    OrchestratorError::TemplateResolution(format!("no memory value for '{}'", key))
                })?;
                traverse(base, parts, path)
            }
            "env" => {
                let name = parts.next().ok_or_else(|| {
                    OrchestratorError::TemplateResolution(format!(
                        "missing env var name in template '{}'",
                        path
                    ))
                })?;
                let value = self.env.get(name).ok_or_else(|| {
                    OrchestratorError::TemplateResolution(format!("env var '{}' not allowed or unset", name))
                })?;
                Ok(Json::String(value.clone()))
            }
            other => Err(OrchestratorError::TemplateResolution(format!(
                "unknown template root '{}'",
                other
            ))),
        }
    }
}

fn traverse<'a>(base: &Json, path_parts: impl Iterator<Item = &'a str>, full_path: &str) -> Result<Json> {
    let mut current = base.clone();
    for part in path_parts {
        current = match &current {
            Json::Object(map) => map
                .get(part)
                .cloned()
                .ok_or_else(|| missing_ref(full_path))?,
            Json::Array(arr) => {
                let idx: usize = part.parse().map_err(|_| missing_ref(full_path))?;
                arr.get(idx).cloned().ok_or_else(|| missing_ref(full_path))?
            }
            _ => return Err(missing_ref(full_path)),
        };
    }
    Ok(current)
}

fn missing_ref(path: &str) -> OrchestratorError {
    OrchestratorError::TemplateResolution(format!("could not resolve template path '{}'", path))
}

/// Resolves all templates in a scalar JSON value. If the template is the
/// entire value of a scalar string and the referenced value is a non-string,
/// the resolved value takes the referenced type. Otherwise, the referenced
/// value is stringified and substituted into the surrounding text. Resolution
/// is one pass: templates appearing inside a resolved value are not
/// re-expanded (spec.md §4.3).
pub fn resolve_value(value: &Json, ctx: &ResolutionContext) -> Result<Json> {
    match value {
        Json::String(s) => resolve_string(s, ctx),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, ctx)?);
            }
            Ok(Json::Array(out))
        }
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, ctx)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, ctx: &ResolutionContext) -> Result<Json> {
    let re = template_re();
    if let Some(caps) = re.captures(s) {
        if caps.get(0).unwrap().as_str() == s {
            // Whole-value template: preserve the referenced type.
            let path = caps.get(1).unwrap().as_str();
            return ctx.lookup(path);
        }
    }
    let mut error: Option<OrchestratorError> = None;
    let replaced = re.replace_all(s, |caps: &regex::Captures| {
        if error.is_some() {
            return String::new();
        }
        let path = caps.get(1).unwrap().as_str();
        match ctx.lookup(path) {
            Ok(Json::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(e) => {
                error = Some(e);
                String::new()
            }
        }
    });
    if let Some(e) = error {
        return Err(e);
    }
    Ok(Json::String(replaced.into_owned()))
}

/// Resolve every param of an action. Resolution failure fails the action
/// with a `TemplateResolutionError`; the caller applies the action's
/// `on_error` policy.
pub fn resolve_params(
    params: &BTreeMap<String, Json>,
    ctx: &ResolutionContext,
) -> Result<BTreeMap<String, Json>> {
    let mut out = BTreeMap::new();
    for (k, v) in params {
        out.insert(k.clone(), resolve_value(v, ctx)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolutionContext {
        let mut ctx = ResolutionContext::default();
        ctx.results.insert(
            "A".to_string(),
            serde_json::json!({"content": "hello", "count": 3}),
        );
        ctx.memory.insert("token".to_string(), Json::String("secret".into()));
        ctx
    }

    #[test]
    fn whole_value_preserves_type() {
        let c = ctx();
        let resolved = resolve_value(&Json::String("{{result.A.count}}".into()), &c).unwrap();
        assert_eq!(resolved, Json::from(3));
    }

    #[test]
    fn substring_is_stringified() {
        let c = ctx();
        let resolved =
            resolve_value(&Json::String("value: {{result.A.content}}".into()), &c).unwrap();
        assert_eq!(resolved, Json::String("value: hello".into()));
    }

    #[test]
    fn missing_reference_fails() {
        let c = ctx();
        let err = resolve_value(&Json::String("{{result.B.x}}".into()), &c).unwrap_err();
        assert_eq!(err.classification(), "TemplateResolutionError");
    }

    #[test]
    fn memory_lookup_works() {
        let c = ctx();
        let resolved = resolve_value(&Json::String("{{memory.token}}".into()), &c).unwrap();
        assert_eq!(resolved, Json::String("secret".into()));
    }

    #[test]
    fn templates_are_not_re_expanded() {
        let mut c = ctx();
        c.results.insert(
            "A".to_string(),
            serde_json::json!({"content": "{{memory.token}}"}),
        );
        let resolved = resolve_value(&Json::String("{{result.A.content}}".into()), &c).unwrap();
        assert_eq!(resolved, Json::String("{{memory.token}}".into()));
    }
}
