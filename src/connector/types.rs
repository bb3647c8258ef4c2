//! Connector-facing data: state, catalog entries, calls and results.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ConnectorError, ErrorKind};
use crate::mcp::convert::{ArgValue, ToolSchema};

/// Lifecycle state of one connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectorState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// One tool in a connector's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorTool {
    /// Name the provider knows the tool by.
    pub native_name: String,
    /// Globally unique name exposed to the agent loop.
    pub display_name: String,
    pub description: String,
    pub schema: ToolSchema,
    pub connector_id: String,
}

impl ConnectorTool {
    /// Function-calling descriptor (`{"type": "function", ...}`).
    pub fn function_definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.display_name,
                "description": self.description,
                "parameters": self.schema.to_json()
            }
        })
    }
}

/// One invocation request. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    /// Display name of the tool.
    pub tool_name: String,
    /// Set by the registry when the name is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgValue>,
}

impl ToolCall {
    /// New call with a random id.
    pub fn new(tool_name: impl Into<String>, arguments: BTreeMap<String, ArgValue>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            connector_id: None,
            arguments,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Build from a JSON object of arguments; anything else is treated as no
    /// arguments.
    pub fn from_json(tool_name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match ArgValue::from(arguments) {
            ArgValue::Object(map) => map,
            _ => BTreeMap::new(),
        };
        Self::new(tool_name, arguments)
    }
}

/// Why a call failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ConnectorError> for ToolFailure {
    fn from(e: &ConnectorError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { content: String },
    Failure(ToolFailure),
}

/// Terminal outcome of one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
    pub duration: Duration,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: String, duration: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            outcome: ToolOutcome::Success { content },
            duration,
        }
    }

    pub fn failure(call: &ToolCall, error: &ConnectorError, duration: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            outcome: ToolOutcome::Failure(error.into()),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    /// Error kind of a failed result.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure(f) => Some(f.kind),
        }
    }

    /// Human-readable text for either outcome.
    pub fn text(&self) -> &str {
        match &self.outcome {
            ToolOutcome::Success { content } => content,
            ToolOutcome::Failure(f) => &f.message,
        }
    }
}
