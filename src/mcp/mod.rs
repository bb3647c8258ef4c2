//! Model Context Protocol (MCP) client side.
//!
//! - [`transport`]: byte channels (process, streaming HTTP, in-memory)
//! - [`client`]: JSON-RPC request/response correlation and handshake
//! - [`types`]: wire envelopes and payloads
//! - [`convert`]: schema, argument and result conversion
//! - [`config`]: `mcp.json` provider entries
//!
//! # Tool Namespacing
//!
//! Tools are exposed as `<connector id>__<tool name>` (e.g. `time__now`,
//! `search__web_search`), sanitised to `[A-Za-z0-9_-]` for function-calling
//! APIs.

pub mod client;
pub mod config;
pub mod convert;
pub mod transport;
pub mod types;
