//! Runtime validators built from JSON Schema.
//!
//! Conversion is total: any schema shape that is not understood becomes
//! [`Validator::Any`], so one odd remote tool never breaks discovery.

use serde_json::{Map, Value};

/// A declared object field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub validator: Validator,
    pub required: bool,
}

/// Structural validator over JSON values.
#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    /// Only declared fields are kept; undeclared keys are dropped.
    Object(Vec<Field>),
    String,
    /// A string restricted to the listed values.
    Enum(Vec<String>),
    /// Numbers and integers alike.
    Number { default: Option<Value> },
    Boolean { default: Option<Value> },
    Array(Box<Validator>),
    Any,
}

impl Validator {
    /// Convert a JSON Schema node.
    pub fn from_schema(schema: &Value) -> Self {
        let Some(node) = schema.as_object() else {
            return Self::Any;
        };

        match node.get("type").and_then(Value::as_str) {
            Some("object") => Self::object(node),
            Some("string") => match node.get("enum").and_then(Value::as_array) {
                Some(values) => Self::Enum(
                    values
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                ),
                None => Self::String,
            },
            Some("number") | Some("integer") => Self::Number {
                default: node.get("default").cloned(),
            },
            Some("boolean") => Self::Boolean {
                default: node.get("default").cloned(),
            },
            Some("array") => Self::Array(Box::new(Self::from_schema(
                node.get("items").unwrap_or(&Value::Null),
            ))),
            _ => Self::Any,
        }
    }

    fn object(node: &Map<String, Value>) -> Self {
        let required: Vec<&str> = node
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let fields = node
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| Field {
                        name: name.clone(),
                        validator: Self::from_schema(prop),
                        required: required.contains(&name.as_str()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self::Object(fields)
    }

    fn default_value(&self) -> Option<&Value> {
        match self {
            Self::Number { default } | Self::Boolean { default } => default.as_ref(),
            _ => None,
        }
    }

    /// Validate `value`, returning the normalized value or every violation.
    ///
    /// Violations read `path: message`, for example `doc_id: Required`.
    pub fn validate(&self, value: &Value) -> Result<Value, Vec<String>> {
        let mut violations = Vec::new();
        let normalized = self.check("", value, &mut violations);
        if violations.is_empty() {
            Ok(normalized)
        } else {
            Err(violations)
        }
    }

    fn check(&self, path: &str, value: &Value, violations: &mut Vec<String>) -> Value {
        match self {
            Self::Any => value.clone(),
            Self::String => match value {
                Value::String(_) => value.clone(),
                other => reject(
                    path,
                    format!("Expected string, received {}", kind(other)),
                    violations,
                ),
            },
            Self::Enum(allowed) => match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => value.clone(),
                _ => {
                    let expected = allowed
                        .iter()
                        .map(|a| format!("'{a}'"))
                        .collect::<Vec<_>>()
                        .join(" | ");
                    reject(
                        path,
                        format!("Invalid enum value. Expected {expected}, received {value}"),
                        violations,
                    )
                }
            },
            Self::Number { .. } => match value {
                Value::Number(_) => value.clone(),
                other => reject(
                    path,
                    format!("Expected number, received {}", kind(other)),
                    violations,
                ),
            },
            Self::Boolean { .. } => match value {
                Value::Bool(_) => value.clone(),
                other => reject(
                    path,
                    format!("Expected boolean, received {}", kind(other)),
                    violations,
                ),
            },
            Self::Array(items) => match value {
                Value::Array(values) => Value::Array(
                    values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| items.check(&join(path, &i.to_string()), v, violations))
                        .collect(),
                ),
                other => reject(
                    path,
                    format!("Expected array, received {}", kind(other)),
                    violations,
                ),
            },
            Self::Object(fields) => {
                let Value::Object(input) = value else {
                    return reject(
                        path,
                        format!("Expected object, received {}", kind(value)),
                        violations,
                    );
                };

                let mut output = Map::new();
                for field in fields {
                    let field_path = join(path, &field.name);
                    match input.get(&field.name) {
                        Some(v) => {
                            let checked = field.validator.check(&field_path, v, violations);
                            output.insert(field.name.clone(), checked);
                        }
                        None => {
                            if let Some(default) = field.validator.default_value() {
                                output.insert(field.name.clone(), default.clone());
                            } else if field.required {
                                violations.push(format!("{field_path}: Required"));
                            }
                        }
                    }
                }
                Value::Object(output)
            }
        }
    }
}

fn reject(path: &str, message: String, violations: &mut Vec<String>) -> Value {
    violations.push(if path.is_empty() {
        message
    } else {
        format!("{path}: {message}")
    });
    Value::Null
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_field() {
        let v = Validator::from_schema(&json!({
            "type": "object",
            "properties": {"doc_id": {"type": "string"}},
            "required": ["doc_id"]
        }));

        assert_eq!(v.validate(&json!({"doc_id": "abc"})).unwrap(), json!({"doc_id": "abc"}));

        let violations = v.validate(&json!({})).unwrap_err();
        assert_eq!(violations, vec!["doc_id: Required".to_string()]);
    }

    #[test]
    fn test_optional_fields_and_defaults() {
        let v = Validator::from_schema(&json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "default": 10},
                "exact": {"type": "boolean", "default": false},
                "note": {"type": "string"}
            },
            "required": ["query"]
        }));

        let out = v.validate(&json!({"query": "q", "extra": 1})).unwrap();
        assert_eq!(out, json!({"query": "q", "limit": 10, "exact": false}));
    }

    #[test]
    fn test_enum_and_nested_paths() {
        let v = Validator::from_schema(&json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["fast", "deep"]},
                "pages": {"type": "array", "items": {"type": "number"}}
            }
        }));

        assert!(v.validate(&json!({"mode": "fast", "pages": [1, 2]})).is_ok());

        let violations = v
            .validate(&json!({"mode": "slow", "pages": [1, "two"]}))
            .unwrap_err();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].starts_with("mode: Invalid enum value"));
        assert_eq!(violations[1], "pages.1: Expected number, received string");
    }

    #[test]
    fn test_unknown_shapes_accept_anything() {
        for schema in [json!(null), json!({}), json!({"type": "null"}), json!({"anyOf": []})] {
            let v = Validator::from_schema(&schema);
            assert_eq!(v, Validator::Any);
            assert!(v.validate(&json!({"x": [1]})).is_ok());
        }
    }

    #[test]
    fn test_object_without_properties_strips_keys() {
        let v = Validator::from_schema(&json!({"type": "object"}));
        assert_eq!(v.validate(&json!({"a": 1})).unwrap(), json!({}));
        assert_eq!(
            v.validate(&json!("x")).unwrap_err(),
            vec!["Expected object, received string".to_string()]
        );
    }

    #[test]
    fn test_array_items_default_to_any() {
        let v = Validator::from_schema(&json!({"type": "array"}));
        assert_eq!(v, Validator::Array(Box::new(Validator::Any)));
    }
}
