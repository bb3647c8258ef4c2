//! Conversion between provider-native payloads and toolbridge types.
//!
//! - Schemas: provider JSON Schema → [`ToolSchema`]; malformed fragments
//!   degrade to a permissive schema instead of failing discovery.
//! - Arguments: [`ArgValue`] maps ↔ JSON objects.
//! - Results: mixed content parts → one text block with bracketed
//!   placeholders for non-text parts.
//! - Names: `<connector>__<tool>` display names, sanitised and de-duplicated.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};

use super::types::{CallToolResult, ContentPart};

/// Separator between connector id and native tool name.
pub const NAMESPACE_SEPARATOR: &str = "__";

// ── Schemas ────────────────────────────────────────────────────────────

/// JSON type of one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
    /// Untyped or unrecognised; accepts anything.
    Any,
}

impl SchemaType {
    fn parse(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(s)) => Self::from_name(s),
            // `["string", "null"]`: take the first concrete type.
            Some(Value::Array(types)) => types
                .iter()
                .filter_map(Value::as_str)
                .map(Self::from_name)
                .find(|t| *t != Self::Null)
                .unwrap_or(Self::Any),
            _ => Self::Any,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            "null" => Self::Null,
            _ => Self::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Object-typed input schema of one tool.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
    /// The native schema could not be understood; any object is accepted.
    pub permissive: bool,
}

impl ToolSchema {
    /// Accepts any object.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    /// Convert a provider's `inputSchema`.
    #[must_use]
    pub fn from_native(schema: &Value) -> Self {
        let Some(obj) = schema.as_object() else {
            return Self::permissive();
        };
        match obj.get("type") {
            None => {}
            Some(Value::String(t)) if t == "object" => {}
            Some(_) => return Self::permissive(),
        }

        let properties = match obj.get("properties") {
            None => BTreeMap::new(),
            Some(Value::Object(props)) => props
                .iter()
                .map(|(name, prop)| (name.clone(), property_from_native(prop)))
                .collect(),
            Some(_) => return Self::permissive(),
        };

        let required = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            properties,
            required,
            permissive: false,
        }
    }

    /// Render as a JSON Schema object for function-calling descriptors.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, prop)| {
                let mut p = Map::new();
                if prop.kind != SchemaType::Any {
                    p.insert("type".into(), json!(prop.kind));
                }
                if let Some(desc) = &prop.description {
                    p.insert("description".into(), json!(desc));
                }
                (name.clone(), Value::Object(p))
            })
            .collect();

        let mut schema = json!({ "type": "object", "properties": properties });
        if !self.required.is_empty() {
            schema["required"] = json!(self.required);
        }
        if self.permissive {
            schema["additionalProperties"] = json!(true);
        }
        schema
    }
}

fn property_from_native(prop: &Value) -> PropertySchema {
    match prop.as_object() {
        Some(p) => PropertySchema {
            kind: SchemaType::parse(p.get("type")),
            description: p
                .get("description")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        },
        None => PropertySchema {
            kind: SchemaType::Any,
            description: None,
        },
    }
}

// ── Arguments ──────────────────────────────────────────────────────────

/// A structured argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<ArgValue>),
    Object(BTreeMap<String, ArgValue>),
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<ArgValue> for Value {
    fn from(value: ArgValue) -> Self {
        match value {
            ArgValue::Null => Self::Null,
            ArgValue::Bool(b) => Self::Bool(b),
            ArgValue::Int(i) => Self::Number(i.into()),
            // JSON has no NaN or infinities.
            ArgValue::Double(d) => Number::from_f64(d).map_or(Self::Null, Self::Number),
            ArgValue::String(s) => Self::String(s),
            ArgValue::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            ArgValue::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// Caller arguments → provider-native JSON object.
#[must_use]
pub fn to_native_arguments(args: &BTreeMap<String, ArgValue>) -> Map<String, Value> {
    args.iter()
        .map(|(k, v)| (k.clone(), Value::from(v.clone())))
        .collect()
}

/// Provider-native JSON object → caller arguments.
#[must_use]
pub fn from_native_arguments(args: Map<String, Value>) -> BTreeMap<String, ArgValue> {
    args.into_iter().map(|(k, v)| (k, ArgValue::from(v))).collect()
}

// ── Results ────────────────────────────────────────────────────────────

/// Flatten a tool result into one text block.
#[must_use]
pub fn flatten_result(result: &CallToolResult) -> String {
    if result.content.is_empty() {
        return result
            .structured_content
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
    }
    result
        .content
        .iter()
        .map(render_part)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_part(part: &ContentPart) -> String {
    match part {
        ContentPart::Text { text } => text.clone(),
        ContentPart::Image { mime_type, .. } => format!("[image: {mime_type}]"),
        ContentPart::Audio { mime_type, .. } => format!("[audio: {mime_type}]"),
        ContentPart::Resource { resource } => match &resource.text {
            Some(text) => format!("[resource: {}]\n{text}", resource.uri),
            None => format!("[resource: {}]", resource.uri),
        },
        ContentPart::ResourceLink { uri, .. } => format!("[resource link: {uri}]"),
        ContentPart::Unsupported => "[unsupported content]".to_string(),
    }
}

// ── Names ──────────────────────────────────────────────────────────────

/// Replace everything outside `[A-Za-z0-9_-]` with `_`, as function-calling
/// APIs require.
#[must_use]
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Display names for one connector's tools, in advertised order. Collisions
/// after sanitising get `_2`, `_3`, ... suffixes.
#[must_use]
pub fn display_names<'a, I>(connector_id: &str, natives: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    natives
        .into_iter()
        .map(|native| {
            let base = sanitize_tool_name(&format!("{connector_id}{NAMESPACE_SEPARATOR}{native}"));
            let mut candidate = base.clone();
            let mut n = 2;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            candidate
        })
        .collect()
}
