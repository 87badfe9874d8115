//! JSON → plan parsing and structural/params validation (spec.md §4.1).

use regex::Regex;
use serde_json::Value as Json;
use std::sync::OnceLock;

use crate::error::{OrchestratorError, Result};
use crate::module_registry::{ModuleRegistry, ParamType};
use crate::types::{CompilerTrace, OnError, Plan, PlanMode, RetryConfig, PROTOCOL_VERSION};

pub enum ParseInput<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
    Value(Json),
}

impl<'a> From<&'a str> for ParseInput<'a> {
    fn from(s: &'a str) -> Self {
        ParseInput::Str(s)
    }
}

impl<'a> From<&'a [u8]> for ParseInput<'a> {
    fn from(b: &'a [u8]) -> Self {
        ParseInput::Bytes(b)
    }
}

impl From<Json> for ParseInput<'static> {
    fn from(v: Json) -> Self {
        ParseInput::Value(v)
    }
}

fn plan_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap())
}

fn action_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap())
}

fn module_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,31}$").unwrap())
}

fn to_json_value(input: ParseInput<'_>) -> Result<Json> {
    match input {
        ParseInput::Str(s) => {
            if s.trim().is_empty() {
                return Err(OrchestratorError::Parse("empty input".into()));
            }
            serde_json::from_str(s).map_err(|e| OrchestratorError::Parse(e.to_string()))
        }
        ParseInput::Bytes(b) => {
            if b.is_empty() {
                return Err(OrchestratorError::Parse("empty input".into()));
            }
            serde_json::from_slice(b).map_err(|e| OrchestratorError::Parse(e.to_string()))
        }
        ParseInput::Value(v) => Ok(v),
    }
}

fn validation_err(location: impl Into<String>, message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Validation {
        location: location.into(),
        message: message.into(),
    }
}

/// Full structural + invariant validation, shared by `parse` and `parse_partial`.
fn validate_structure(plan: &mut Plan) -> Result<()> {
    if plan.plan_id.is_empty() {
        plan.plan_id = uuid::Uuid::new_v4().to_string();
    }
    if !plan_id_re().is_match(&plan.plan_id) {
        return Err(validation_err("plan_id", "must match [A-Za-z0-9_-]{1,64}"));
    }
    if plan.protocol_version != PROTOCOL_VERSION {
        return Err(validation_err(
            "protocol_version",
            format!("expected '{}'", PROTOCOL_VERSION),
        ));
    }
    if let Some(desc) = &plan.description {
        if desc.chars().count() > 500 {
            return Err(validation_err("description", "must be at most 500 chars"));
        }
    }
    if plan.actions.is_empty() || plan.actions.len() > 50 {
        return Err(validation_err("actions", "must contain between 1 and 50 actions"));
    }

    // Invariant 6: compiler mode requires an approved compiler trace.
    if plan.plan_mode == PlanMode::Compiler {
        match &plan.compiler_trace {
            Some(CompilerTrace {
                generation_approved: true,
                ..
            }) => {}
            Some(_) => {
                return Err(validation_err(
                    "compiler_trace.generation_approved",
                    "must be true in compiler mode",
                ))
            }
            None => {
                return Err(validation_err(
                    "compiler_trace",
                    "required when plan_mode = compiler",
                ))
            }
        }
    }

    // Invariant 1: unique action ids, plus per-action shape checks.
    let mut seen_ids = std::collections::HashSet::new();
    for (i, action) in plan.actions.iter().enumerate() {
        let loc = format!("actions[{}]", i);
        if !action_id_re().is_match(&action.id) {
            return Err(validation_err(format!("{}.id", loc), "invalid action id"));
        }
        if !seen_ids.insert(action.id.clone()) {
            return Err(validation_err(format!("{}.id", loc), "duplicate action id"));
        }
        if !module_name_re().is_match(&action.module) {
            return Err(validation_err(format!("{}.module", loc), "invalid module name"));
        }
        if !module_name_re().is_match(&action.action) {
            return Err(validation_err(format!("{}.action", loc), "invalid action name"));
        }
        if action.timeout < 1 || action.timeout > 3600 {
            return Err(validation_err(format!("{}.timeout", loc), "must be 1..=3600"));
        }
        // Invariant 3: no self-dependency.
        if action.depends_on.contains(&action.id) {
            return Err(validation_err(
                format!("{}.depends_on", loc),
                "action cannot depend on itself",
            ));
        }
        if let Some(retry) = &action.retry {
            if retry.max_attempts < 1 || retry.max_attempts > 10 {
                return Err(validation_err(
                    format!("{}.retry.max_attempts", loc),
                    "must be 1..=10",
                ));
            }
            if retry.delay_seconds < 0.1 || retry.delay_seconds > 300.0 {
                return Err(validation_err(
                    format!("{}.retry.delay_seconds", loc),
                    "must be 0.1..=300",
                ));
            }
            if retry.backoff_factor < 1.0 || retry.backoff_factor > 10.0 {
                return Err(validation_err(
                    format!("{}.retry.backoff_factor", loc),
                    "must be 1.0..=10.0",
                ));
            }
        }
    }

    // Invariant 2: depends_on references exist.
    for (i, action) in plan.actions.iter().enumerate() {
        for dep in &action.depends_on {
            if !seen_ids.contains(dep) {
                return Err(validation_err(
                    format!("actions[{}].depends_on", i),
                    format!("unknown action id '{}'", dep),
                ));
            }
        }
    }

    // Invariant 5: rollback.action references exist.
    for (i, action) in plan.actions.iter().enumerate() {
        if let Some(rb) = &action.rollback {
            if !seen_ids.contains(&rb.action) {
                return Err(validation_err(
                    format!("actions[{}].rollback.action", i),
                    format!("unknown action id '{}'", rb.action),
                ));
            }
        }
    }

    // Invariant 4: synthesize a default retry config for on_error=retry.
    for action in plan.actions.iter_mut() {
        if action.on_error == OnError::Retry && action.retry.is_none() {
            action.retry = Some(RetryConfig::default_synthesized());
        }
    }

    Ok(())
}

/// Consults the module registry for each action's declared param schema.
/// Unknown modules (community extensions not yet loaded) skip params
/// validation silently, per spec.md §4.1. Template strings (`{{...}}`) pass
/// through unchecked.
fn validate_params(plan: &Plan, registry: &ModuleRegistry) -> Result<()> {
    for (i, action) in plan.actions.iter().enumerate() {
        let Some(module) = registry.get(&action.module) else {
            continue;
        };
        let Some(spec) = module.manifest().action_spec(&action.action) else {
            return Err(OrchestratorError::ActionNotFound {
                module: action.module.clone(),
                action: action.action.clone(),
            });
        };
        for param in &spec.params {
            let loc = format!("actions[{}].params.{}", i, param.name);
            match action.params.get(&param.name) {
                None => {
                    if param.required && param.default.is_none() {
                        return Err(validation_err(loc, "required parameter missing"));
                    }
                }
                Some(value) => {
                    if is_template_string(value) {
                        continue;
                    }
                    if let Some(enum_values) = &param.enum_values {
                        if !enum_values.contains(value) {
                            return Err(validation_err(loc, "value not in enum"));
                        }
                    }
                    if !type_matches(value, &param.param_type) {
                        return Err(validation_err(loc, "wrong parameter type"));
                    }
                }
            }
        }
    }
    Ok(())
}

fn is_template_string(value: &Json) -> bool {
    matches!(value, Json::String(s) if s.contains("{{") && s.contains("}}"))
}

fn type_matches(value: &Json, expected: &ParamType) -> bool {
    match expected {
        ParamType::Any => true,
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Float => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Object => value.is_object(),
        ParamType::Array => value.is_array(),
    }
}

/// Full structural + per-module params validation.
pub fn parse(input: ParseInput<'_>, registry: &ModuleRegistry) -> Result<Plan> {
    let value = to_json_value(input)?;
    if !value.is_object() {
        return Err(OrchestratorError::Parse("plan root must be a JSON object".into()));
    }
    let mut plan: Plan = serde_json::from_value(value)?;
    validate_structure(&mut plan)?;
    validate_params(&plan, registry)?;
    Ok(plan)
}

/// Same as `parse` but skips per-module params validation (used for preview
/// endpoints, per spec.md §4.1).
pub fn parse_partial(input: ParseInput<'_>) -> Result<Plan> {
    let value = to_json_value(input)?;
    if !value.is_object() {
        return Err(OrchestratorError::Parse("plan root must be a JSON object".into()));
    }
    let mut plan: Plan = serde_json::from_value(value)?;
    validate_structure(&mut plan)?;
    Ok(plan)
}

/// Canonical serialisation; round-tripping an accepted plan yields an
/// equivalent plan (spec.md §4.1, §8 round-trip property).
pub fn to_json(plan: &Plan) -> Result<String> {
    serde_json::to_string(plan).map_err(OrchestratorError::from)
}
