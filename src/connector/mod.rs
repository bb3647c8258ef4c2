//! Connectors: one managed binding per tool provider, and the registry that
//! merges them into a single namespace.
//!
//! ```text
//! caller → ConnectorRegistry::execute
//!        → ApprovalEngine::decide_batch
//!        → Connector::execute → ProtocolClient → Transport
//! ```

mod lifecycle;
pub mod registry;
mod types;

pub use lifecycle::{Connector, Timeouts, TransportFactory};
pub use registry::{ConnectorRegistry, ConnectorStatus, Dispatch};
pub use types::{ConnectorState, ConnectorTool, ToolCall, ToolFailure, ToolOutcome, ToolResult};
