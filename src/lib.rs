//! toolbridge
//!
//! A tool-connector runtime: it lets an assistant call tools hosted by
//! separate processes or remote services, with every call gated by a
//! human-approval policy.
//!
//! # Architecture
//!
//! - **Transports**: child process (newline-delimited JSON over stdio) and
//!   streaming HTTP (JSON or server-sent events), behind one trait
//! - **Protocol client**: JSON-RPC handshake, paginated discovery and
//!   id-correlated calls
//! - **Connectors**: per-provider state machine with bounded, cancellable
//!   connect/discover/execute
//! - **Registry**: merged tool namespace, routing and batch execution
//! - **Approval**: rules, session memory, interactive batches, audit log
//!
//! # Modules
//!
//! - [`connector`]: connectors, the registry and call/result types
//! - [`approval`]: the approval engine and its preferences store
//! - [`mcp`]: transports, protocol client, wire types and conversion
//! - [`race`]: timeout and cancellation racing
//! - [`error`]: error taxonomy

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]

pub mod approval;
pub mod config;
pub mod connector;
pub mod error;
pub mod mcp;
pub mod race;
pub mod telemetry;

use std::sync::PoisonError;

pub use approval::ApprovalEngine;
pub use connector::{Connector, ConnectorRegistry, Dispatch, ToolCall, ToolResult};
pub use error::{ConnectorError, ErrorKind};

/// Take a lock even if a previous holder panicked. The guarded data in this
/// crate is always left consistent between statements.
pub(crate) fn relock<T>(res: Result<T, PoisonError<T>>) -> T {
    res.unwrap_or_else(PoisonError::into_inner)
}
