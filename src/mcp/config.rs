//! Provider configuration file (`mcp.json`).
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "time": { "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"] },
//!     "search": {
//!       "url": "https://mcp.example.com/mcp",
//!       "headers": { "X-Client": "toolbridge" },
//!       "bearerTokenEnv": "SEARCH_API_KEY"
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use super::transport::{
    DEFAULT_MAX_FRAME_BYTES, ProcessConfig, ProcessTransport, StreamingHttpConfig,
    StreamingHttpTransport, Transport,
};
use crate::error::{ConnectorError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct McpConfig {
    /// Keyed by connector id; ordered so connectors register deterministically.
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
}

/// One provider entry.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServerEntry {
    /// Human-readable name; defaults to the connector id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Disabled entries are registered but never connected automatically.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: ServerKind,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ServerKind {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    RemoteHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Environment variable holding a bearer token.
        #[serde(
            rename = "bearerTokenEnv",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        bearer_token_env: Option<String>,
    },
}

/// Transport knobs shared by all connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub max_frame_bytes: usize,
    pub spawn_grace: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            spawn_grace: super::transport::DEFAULT_SPAWN_GRACE,
        }
    }
}

impl McpServerEntry {
    /// Build a fresh, unconnected transport for this entry.
    ///
    /// Environment placeholders and credentials are resolved here, at connect
    /// time, so a token exported after startup is picked up on reconnect.
    pub fn build_transport(
        &self,
        id: &str,
        settings: TransportSettings,
    ) -> Result<Arc<dyn Transport>> {
        match &self.kind {
            ServerKind::Stdio { command, args, env } => {
                let cfg = ProcessConfig::new(id, expand_env_placeholders(command))
                    .args(args.iter().map(|a| expand_env_placeholders(a)))
                    .env(expand_env_map(env))
                    .max_frame_bytes(settings.max_frame_bytes)
                    .spawn_grace(settings.spawn_grace);
                Ok(Arc::new(ProcessTransport::new(cfg)))
            }
            ServerKind::RemoteHttp {
                url,
                headers,
                env,
                bearer_token_env,
            } => {
                let url = Url::parse(&expand_env_placeholders(url))
                    .map_err(|e| ConnectorError::Config(format!("invalid url for '{id}': {e}")))?;

                let mut headers = expand_env_map(headers);
                if let Some(var) = bearer_token_env {
                    let token = lookup_credential(var, &expand_env_map(env)).ok_or_else(|| {
                        ConnectorError::AuthenticationRequired(format!(
                            "'{id}' needs a bearer token in ${var}"
                        ))
                    })?;
                    headers.insert("Authorization".into(), format!("Bearer {token}"));
                }

                let cfg = StreamingHttpConfig::new(id, url)
                    .headers(headers)
                    .max_frame_bytes(settings.max_frame_bytes);
                Ok(Arc::new(StreamingHttpTransport::new(cfg)?))
            }
        }
    }
}

/// Entry-local `env` first, then the process environment. Empty counts as
/// absent.
fn lookup_credential(var: &str, local: &HashMap<String, String>) -> Option<String> {
    local
        .get(var)
        .cloned()
        .or_else(|| std::env::var(var).ok())
        .filter(|v| !v.trim().is_empty() && !v.contains("${"))
}

pub fn load_mcp_config(path: impl AsRef<Path>) -> anyhow::Result<McpConfig> {
    let path = path.as_ref();
    let txt = fs::read_to_string(path)
        .with_context(|| format!("failed to read provider config {}", path.display()))?;
    serde_json::from_str(&txt)
        .with_context(|| format!("failed to parse provider config {}", path.display()))
}

/// Expand `${NAME}` placeholders from the process environment.
/// Unknown variables are left as written.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) if !name.is_empty() => out.push_str(&value),
                    _ => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_env_placeholders(v)))
        .collect()
}
