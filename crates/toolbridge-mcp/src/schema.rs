//! Input shapes derived from a tool's JSON schema, checked at call time.

use serde_json::{json, Map, Number, Value};
use std::fmt;
use tracing::debug;

use toolbridge_core::{Result, ToolbridgeError};

/// Name of the placeholder field given to tools that take no input.
pub const PLACEHOLDER_FIELD: &str = "_dummy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    /// Missing or unknown types are strings; a type list picks its first
    /// non-null member.
    pub fn from_schema(schema: &Value) -> Self {
        let declared = match schema.get("type") {
            Some(Value::String(name)) => Some(name.as_str()),
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(Value::as_str)
                .find(|name| *name != "null"),
            _ => None,
        };
        match declared {
            Some("integer") => FieldKind::Integer,
            Some("number") => FieldKind::Number,
            Some("boolean") => FieldKind::Boolean,
            Some("array") => FieldKind::Array,
            Some("object") => FieldKind::Object,
            _ => FieldKind::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }

    /// Accept `value` as this kind, converting numeric and boolean strings.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (FieldKind::String, Value::String(_)) => Some(value.clone()),

            (FieldKind::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Some(value.clone())
                } else {
                    n.as_f64().and_then(integral).map(Value::from)
                }
            }
            (FieldKind::Integer, Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .map(Value::from)
                    .or_else(|| s.parse::<f64>().ok().and_then(integral).map(Value::from))
            }

            (FieldKind::Number, Value::Number(_)) => Some(value.clone()),
            (FieldKind::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),

            (FieldKind::Boolean, Value::Bool(_)) => Some(value.clone()),
            (FieldKind::Boolean, Value::String(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
                    "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
                    _ => None,
                }
            }
            (FieldKind::Boolean, Value::Number(n)) => match n.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },

            (FieldKind::Array, Value::Array(_)) => Some(value.clone()),
            (FieldKind::Object, Value::Object(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub description: String,
    pub default: Option<Value>,
    pub enum_values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputShape {
    fields: Vec<FieldSpec>,
    placeholder: bool,
}

impl InputShape {
    pub fn from_schema(schema: &Value) -> Self {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let fields: Vec<FieldSpec> = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| {
                properties
                    .iter()
                    .map(|(name, property)| FieldSpec {
                        name: name.clone(),
                        kind: FieldKind::from_schema(property),
                        required: required.contains(&name.as_str()),
                        description: property
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        default: property.get("default").cloned(),
                        enum_values: property
                            .get("enum")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if fields.is_empty() {
            return Self {
                fields: vec![FieldSpec {
                    name: PLACEHOLDER_FIELD.to_string(),
                    kind: FieldKind::String,
                    required: false,
                    description: "No input required".to_string(),
                    default: None,
                    enum_values: Vec::new(),
                }],
                placeholder: true,
            };
        }

        Self {
            fields,
            placeholder: false,
        }
    }

    /// Declared fields, without the placeholder.
    pub fn fields(&self) -> &[FieldSpec] {
        if self.placeholder {
            &[]
        } else {
            &self.fields
        }
    }

    pub fn has_placeholder(&self) -> bool {
        self.placeholder
    }

    /// JSON schema advertised to the agent.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut property = Map::new();
            property.insert("type".into(), json!(field.kind.as_str()));
            if !field.description.is_empty() {
                property.insert("description".into(), json!(field.description));
            }
            if let Some(default) = &field.default {
                property.insert("default".into(), default.clone());
            }
            if !field.enum_values.is_empty() {
                property.insert("enum".into(), Value::Array(field.enum_values.clone()));
            }
            properties.insert(field.name.clone(), Value::Object(property));
            if field.required {
                required.push(json!(field.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `args` against the shape and return what should be sent.
    ///
    /// Null means no arguments. Null values count as absent, undeclared
    /// keys and the placeholder are dropped.
    pub fn validate(&self, tool: &str, args: Value) -> Result<Value> {
        let invalid = |reason: String| ToolbridgeError::InvalidArguments {
            tool: tool.to_string(),
            reason,
        };

        let mut provided = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(invalid(format!(
                    "expected an object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let mut checked = Map::new();
        for field in self.fields() {
            match provided.remove(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(invalid(format!("missing required field '{}'", field.name)));
                    }
                }
                Some(value) => {
                    let coerced = field.kind.coerce(&value).ok_or_else(|| {
                        invalid(format!(
                            "field '{}' expects {}, got {}",
                            field.name,
                            field.kind,
                            json_type_name(&value)
                        ))
                    })?;
                    checked.insert(field.name.clone(), coerced);
                }
            }
        }

        provided.remove(PLACEHOLDER_FIELD);
        if !provided.is_empty() {
            let dropped: Vec<&str> = provided.keys().map(String::as_str).collect();
            debug!("Dropping undeclared arguments for '{}': {:?}", tool, dropped);
        }

        Ok(Value::Object(checked))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
