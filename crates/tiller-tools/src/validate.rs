// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Declarative argument validation.
//!
//! Every tool declares an [`ArgSpec`]: the allowed keys, required fields,
//! and per-field constraints.  That declaration is the single source of
//! truth for both validation and the JSON Schema advertised to the model,
//! so the two can never drift apart.
//!
//! Validation semantics:
//! - unknown keys produce validation issues and are stripped; the tool
//!   receives only the recognized subset,
//! - missing required fields and hard type mismatches fail with
//!   `invalid_args` (non-retryable),
//! - out-of-range integers clamp to the bound and produce an issue.

use serde_json::{json, Map, Value};

use crate::tool::{ErrorCode, ToolError};

#[derive(Debug, Clone)]
pub enum FieldKind {
    String,
    Integer {
        min: Option<i64>,
        max: Option<i64>,
        /// Bound advertised in the schema when it differs from the hard
        /// cap (e.g. file-read `limit`: schema 240, hard cap 2000).
        schema_max: Option<i64>,
    },
    Boolean,
    Enum(&'static [&'static str]),
    StringArray,
    /// Array of nested request objects, each validated against the inner
    /// spec (batch file read).
    RequestArray(Box<ArgSpec>),
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub kind: FieldKind,
    pub description: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct ArgSpec {
    pub fields: Vec<FieldSpec>,
}

/// The outcome of a successful validation: the recognized argument subset
/// plus any non-fatal issues to append to the tool result.
#[derive(Debug, Clone)]
pub struct Validated {
    pub args: Value,
    pub issues: Vec<String>,
}

impl ArgSpec {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn field(mut self, name: &'static str, required: bool, kind: FieldKind, description: &'static str) -> Self {
        self.fields.push(FieldSpec {
            name,
            required,
            kind,
            description,
        });
        self
    }

    pub fn string(self, name: &'static str, required: bool, description: &'static str) -> Self {
        self.field(name, required, FieldKind::String, description)
    }

    pub fn integer(
        self,
        name: &'static str,
        required: bool,
        min: i64,
        max: i64,
        description: &'static str,
    ) -> Self {
        self.field(
            name,
            required,
            FieldKind::Integer {
                min: Some(min),
                max: Some(max),
                schema_max: None,
            },
            description,
        )
    }

    pub fn boolean(self, name: &'static str, description: &'static str) -> Self {
        self.field(name, false, FieldKind::Boolean, description)
    }

    pub fn enumeration(
        self,
        name: &'static str,
        required: bool,
        values: &'static [&'static str],
        description: &'static str,
    ) -> Self {
        self.field(name, required, FieldKind::Enum(values), description)
    }

    /// Generate the JSON Schema advertised to the model.
    pub fn to_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required: Vec<Value> = Vec::new();
        for f in &self.fields {
            properties.insert(f.name.to_string(), field_schema(f));
            if f.required {
                required.push(json!(f.name));
            }
        }
        json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Validate `args` against this spec.
    pub fn validate(&self, args: &Value) -> Result<Validated, ToolError> {
        let obj = match args {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(ToolError::new(
                    ErrorCode::InvalidArgs,
                    format!("arguments must be a JSON object, got {}", kind_name(other)),
                ))
            }
        };

        let mut issues = Vec::new();
        let mut clean = Map::new();

        for (key, value) in &obj {
            let Some(field) = self.fields.iter().find(|f| f.name == key) else {
                issues.push(format!("unknown key '{key}' ignored"));
                continue;
            };
            let checked = check_field(field, value, &mut issues)?;
            clean.insert(key.clone(), checked);
        }

        for f in self.fields.iter().filter(|f| f.required) {
            if !clean.contains_key(f.name) {
                return Err(ToolError::new(
                    ErrorCode::InvalidArgs,
                    format!("missing required parameter '{}'", f.name),
                ));
            }
        }

        Ok(Validated {
            args: Value::Object(clean),
            issues,
        })
    }
}

fn field_schema(f: &FieldSpec) -> Value {
    match &f.kind {
        FieldKind::String => json!({ "type": "string", "description": f.description }),
        FieldKind::Integer {
            min,
            max,
            schema_max,
        } => {
            let mut s = json!({ "type": "integer", "description": f.description });
            if let Some(min) = min {
                s["minimum"] = json!(min);
            }
            if let Some(max) = schema_max.or(*max) {
                s["maximum"] = json!(max);
            }
            s
        }
        FieldKind::Boolean => json!({ "type": "boolean", "description": f.description }),
        FieldKind::Enum(values) => {
            json!({ "type": "string", "enum": values, "description": f.description })
        }
        FieldKind::StringArray => json!({
            "type": "array",
            "items": { "type": "string" },
            "description": f.description,
        }),
        FieldKind::RequestArray(inner) => json!({
            "type": "array",
            "items": inner.to_schema(),
            "description": f.description,
        }),
    }
}

fn check_field(
    field: &FieldSpec,
    value: &Value,
    issues: &mut Vec<String>,
) -> Result<Value, ToolError> {
    let type_err = |expected: &str| {
        ToolError::new(
            ErrorCode::InvalidArgs,
            format!(
                "parameter '{}' must be {expected}, got {}",
                field.name,
                kind_name(value)
            ),
        )
    };

    match &field.kind {
        FieldKind::String => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(type_err("a string")),
        },
        FieldKind::Integer { min, max, .. } => {
            let n = value.as_i64().ok_or_else(|| type_err("an integer"))?;
            let mut clamped = n;
            if let Some(min) = min {
                if clamped < *min {
                    issues.push(format!(
                        "parameter '{}' below minimum {min}; clamped",
                        field.name
                    ));
                    clamped = *min;
                }
            }
            if let Some(max) = max {
                if clamped > *max {
                    issues.push(format!(
                        "parameter '{}' above maximum {max}; clamped",
                        field.name
                    ));
                    clamped = *max;
                }
            }
            Ok(json!(clamped))
        }
        FieldKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err(type_err("a boolean")),
        },
        FieldKind::Enum(values) => {
            let s = value.as_str().ok_or_else(|| type_err("a string"))?;
            if values.contains(&s) {
                Ok(value.clone())
            } else {
                Err(ToolError::new(
                    ErrorCode::InvalidArgs,
                    format!(
                        "parameter '{}' must be one of [{}], got '{s}'",
                        field.name,
                        values.join(", ")
                    ),
                ))
            }
        }
        FieldKind::StringArray => {
            let arr = value.as_array().ok_or_else(|| type_err("an array"))?;
            if arr.iter().all(|v| v.is_string()) {
                Ok(value.clone())
            } else {
                Err(type_err("an array of strings"))
            }
        }
        FieldKind::RequestArray(inner) => {
            let arr = value.as_array().ok_or_else(|| type_err("an array"))?;
            let mut out = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                let validated = inner.validate(item).map_err(|e| {
                    ToolError::new(
                        e.code,
                        format!("request [{i}] of '{}': {}", field.name, e.message),
                    )
                })?;
                issues.extend(
                    validated
                        .issues
                        .into_iter()
                        .map(|iss| format!("request [{i}]: {iss}")),
                );
                out.push(validated.args);
            }
            Ok(Value::Array(out))
        }
    }
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
