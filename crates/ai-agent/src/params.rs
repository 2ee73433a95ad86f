use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::mcp::McpToolError;

const SUMMARY_DESCRIPTION_CHARS: usize = 80;

/// Closed set of parameter kinds a capability function may declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array(Box<ParamKind>),
}

impl ParamKind {
    pub fn array_of(inner: ParamKind) -> Self {
        Self::Array(Box::new(inner))
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array(inner) => value
                .as_array()
                .map(|items| items.iter().all(|item| inner.matches(item)))
                .unwrap_or(false),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Number => "number".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Object => "object".to_string(),
            Self::Array(inner) => format!("array of {}", inner.label()),
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            Self::Array(inner) => json!({ "type": "array", "items": inner.json_schema() }),
            Self::String => json!({ "type": "string" }),
            Self::Number => json!({ "type": "number" }),
            Self::Integer => json!({ "type": "integer" }),
            Self::Boolean => json!({ "type": "boolean" }),
            Self::Object => json!({ "type": "object" }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Checks presence of required parameters and the kind of every supplied
    /// one. Unknown keys are left for the handler to ignore.
    pub fn validate_args(specs: &[ParamSpec], args: &Value) -> Result<(), McpToolError> {
        let empty = Map::new();
        let object = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(McpToolError::InvalidInput(format!(
                    "arguments must be a JSON object, got {}",
                    other
                )))
            }
        };

        for spec in specs {
            match object.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(McpToolError::InvalidInput(format!(
                            "missing required parameter `{}`",
                            spec.name
                        )));
                    }
                }
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(McpToolError::InvalidInput(format!(
                            "parameter `{}` must be {}",
                            spec.name,
                            spec.kind.label()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_json_schema(specs: &[ParamSpec]) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for spec in specs {
            let mut schema = spec.kind.json_schema();
            if !spec.description.is_empty() {
                if let Some(map) = schema.as_object_mut() {
                    map.insert("description".into(), json!(spec.description));
                }
            }
            properties.insert(spec.name.clone(), schema);
            if spec.required {
                required.push(json!(spec.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Flattened one-line summary of a parameter list, e.g.
/// `to (required): Recipient address; cc (optional)`.
pub fn param_summary(specs: &[ParamSpec]) -> String {
    specs
        .iter()
        .map(|spec| {
            let marker = if spec.required { "required" } else { "optional" };
            let description = truncate_chars(spec.description.trim(), SUMMARY_DESCRIPTION_CHARS);
            if description.is_empty() {
                format!("{} ({})", spec.name, marker)
            } else {
                format!("{} ({}): {}", spec.name, marker, description)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut truncated: String = input.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_params() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("to", ParamKind::String)
                .required()
                .describe("Recipient address"),
            ParamSpec::new("cc", ParamKind::array_of(ParamKind::String)),
            ParamSpec::new("priority", ParamKind::Integer),
        ]
    }

    #[test]
    fn rejects_missing_required_parameter() {
        let err = ParamSpec::validate_args(&send_params(), &json!({ "cc": [] })).unwrap_err();
        assert!(err.to_string().contains("missing required parameter `to`"));
    }

    #[test]
    fn rejects_wrong_array_item_kind() {
        let err = ParamSpec::validate_args(&send_params(), &json!({ "to": "a@b", "cc": [1, 2] }))
            .unwrap_err();
        assert!(err.to_string().contains("array of string"), "{err}");
    }

    #[test]
    fn accepts_null_arguments_when_nothing_required() {
        let specs = vec![ParamSpec::new("limit", ParamKind::Integer)];
        assert!(ParamSpec::validate_args(&specs, &Value::Null).is_ok());
        assert!(ParamSpec::validate_args(&specs, &json!("text")).is_err());
    }

    #[test]
    fn summary_marks_required_and_truncates() {
        let mut specs = send_params();
        specs[0].description = "x".repeat(120);
        let summary = param_summary(&specs);
        assert!(summary.starts_with("to (required): "));
        assert!(summary.contains('…'));
        assert!(summary.contains("cc (optional)"));
    }

    #[test]
    fn schema_lists_required_names() {
        let schema = ParamSpec::to_json_schema(&send_params());
        assert_eq!(schema["required"], json!(["to"]));
        assert_eq!(schema["properties"]["cc"]["items"]["type"], "string");
        assert_eq!(schema["properties"]["to"]["description"], "Recipient address");
    }
}
