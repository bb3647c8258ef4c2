//! All connectors behind one merged tool namespace.
//!
//! The registry owns every [`Connector`], merges their catalogs, routes each
//! call to the connector that advertises it, and puts the
//! [`ApprovalEngine`] in front of every dispatch.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::lifecycle::{Connector, Timeouts, TransportFactory};
use super::types::{ConnectorState, ConnectorTool, ToolCall, ToolResult};
use crate::approval::{ApprovalDecision, ApprovalEngine};
use crate::error::{ConnectorError, Result};
use crate::mcp::config::{McpConfig, TransportSettings};
use crate::mcp::convert::NAMESPACE_SEPARATOR;
use crate::relock;

/// What happened to a call handed to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "dispatch", rename_all = "snake_case")]
pub enum Dispatch {
    /// The call reached execution (or failed routing); exactly one result.
    Executed(ToolResult),
    /// Approval said no; the provider was never contacted.
    Denied(ApprovalDecision),
}

impl Dispatch {
    pub fn call_id(&self) -> &str {
        match self {
            Self::Executed(r) => &r.call_id,
            Self::Denied(d) => &d.call_id,
        }
    }

    pub fn result(&self) -> Option<&ToolResult> {
        match self {
            Self::Executed(r) => Some(r),
            Self::Denied(_) => None,
        }
    }
}

/// One row of [`ConnectorRegistry::statuses`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub state: ConnectorState,
    pub tool_count: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    connector: Connector,
    enabled: bool,
}

#[derive(Debug)]
pub struct ConnectorRegistry {
    entries: RwLock<Vec<Entry>>,
    approval: Arc<ApprovalEngine>,
}

impl ConnectorRegistry {
    pub fn new(approval: Arc<ApprovalEngine>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            approval,
        }
    }

    /// Register one connector per `mcpServers` entry. Nothing is connected
    /// yet; see [`connect_all`](Self::connect_all).
    pub fn from_config(
        cfg: &McpConfig,
        settings: TransportSettings,
        timeouts: Timeouts,
        approval: Arc<ApprovalEngine>,
    ) -> Result<Self> {
        let registry = Self::new(approval);
        for (id, entry) in &cfg.mcp_servers {
            let factory: TransportFactory = {
                let entry = entry.clone();
                let id = id.clone();
                Arc::new(move || entry.build_transport(&id, settings))
            };
            let name = entry.name.clone().unwrap_or_else(|| id.clone());
            registry.add(Connector::new(id, name, factory, timeouts), entry.enabled)?;
        }
        Ok(registry)
    }

    pub fn approval(&self) -> &Arc<ApprovalEngine> {
        &self.approval
    }

    /// Ids become display-name prefixes, so they must be non-empty, use only
    /// `[A-Za-z0-9_-]`, and not contain the namespace separator.
    pub fn add(&self, connector: Connector, enabled: bool) -> Result<()> {
        let id = connector.id();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if id.is_empty() || !valid_chars || id.contains(NAMESPACE_SEPARATOR) {
            return Err(ConnectorError::Config(format!(
                "invalid connector id '{id}': use letters, digits, '-' and single '_'"
            )));
        }

        let mut entries = relock(self.entries.write());
        if entries.iter().any(|e| e.connector.id() == id) {
            return Err(ConnectorError::Config(format!("duplicate connector id '{id}'")));
        }
        info!(connector_id = %id, enabled, "Registered connector");
        entries.push(Entry { connector, enabled });
        Ok(())
    }

    /// Disconnect and unregister. Returns `false` for unknown ids.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut entries = relock(self.entries.write());
            entries
                .iter()
                .position(|e| e.connector.id() == id)
                .map(|pos| entries.remove(pos))
        };
        match removed {
            Some(entry) => {
                entry.connector.disconnect().await?;
                info!(connector_id = %id, "Removed connector");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, id: &str) -> Option<Connector> {
        relock(self.entries.read())
            .iter()
            .find(|e| e.connector.id() == id)
            .map(|e| e.connector.clone())
    }

    pub fn connectors(&self) -> Vec<Connector> {
        relock(self.entries.read())
            .iter()
            .map(|e| e.connector.clone())
            .collect()
    }

    fn enabled_connectors(&self) -> Vec<Connector> {
        relock(self.entries.read())
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.connector.clone())
            .collect()
    }

    /// Connect every enabled connector concurrently. One failure does not
    /// stop the others; each outcome is reported by id.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let connectors = self.enabled_connectors();
        let outcomes = join_all(connectors.iter().map(Connector::connect)).await;
        let report: Vec<_> = connectors
            .iter()
            .zip(outcomes)
            .map(|(c, res)| (c.id().to_string(), res))
            .collect();

        let failed = report.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            name: "registry.connect_all",
            connectors = report.len(),
            failed,
            tools = self.tools().len(),
            "Connectors started"
        );
        report
    }

    pub async fn disconnect_all(&self) {
        let connectors = self.connectors();
        for res in join_all(connectors.iter().map(Connector::disconnect)).await {
            if let Err(e) = res {
                warn!(error = %e, "disconnect failed");
            }
        }
    }

    pub async fn refresh(&self, id: &str) -> Result<()> {
        let connector = self
            .get(id)
            .ok_or_else(|| ConnectorError::Config(format!("unknown connector '{id}'")))?;
        connector.refresh().await
    }

    pub fn statuses(&self) -> Vec<ConnectorStatus> {
        relock(self.entries.read())
            .iter()
            .map(|e| ConnectorStatus {
                id: e.connector.id().to_string(),
                name: e.connector.name().to_string(),
                enabled: e.enabled,
                state: e.connector.state(),
                tool_count: e.connector.tools().len(),
            })
            .collect()
    }

    /// Merged catalog snapshot. May be briefly short while a connector
    /// reconnects.
    pub fn tools(&self) -> Vec<ConnectorTool> {
        self.connectors()
            .iter()
            .flat_map(|c| c.tools().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Function-calling descriptors for the merged catalog.
    pub fn function_definitions(&self) -> Vec<Value> {
        self.tools()
            .iter()
            .map(ConnectorTool::function_definition)
            .collect()
    }

    /// Find the connector and catalog entry for a display name.
    pub fn resolve(&self, tool_name: &str) -> Option<(Connector, ConnectorTool)> {
        self.connectors().into_iter().find_map(|c| {
            let tool = c.tools().iter().find(|t| t.display_name == tool_name).cloned();
            tool.map(|t| (c, t))
        })
    }

    fn route(&self, mut call: ToolCall) -> std::result::Result<(ToolCall, Connector), ToolResult> {
        match self.resolve(&call.tool_name) {
            Some((connector, tool))
                if call
                    .connector_id
                    .as_deref()
                    .is_none_or(|id| id == tool.connector_id) =>
            {
                call.connector_id = Some(tool.connector_id);
                Ok((call, connector))
            }
            _ => {
                let err = ConnectorError::ToolNotFound(call.tool_name.clone());
                warn!(call_id = %call.id, tool = %call.tool_name, "unresolvable tool call");
                Err(ToolResult::failure(&call, &err, Duration::ZERO))
            }
        }
    }

    /// Route, approve and execute one call.
    pub async fn execute(&self, call: ToolCall, cancel: &CancellationToken) -> Dispatch {
        let (call, connector) = match self.route(call) {
            Ok(routed) => routed,
            Err(result) => return Dispatch::Executed(result),
        };

        let decision = tokio::select! {
            biased;
            () = cancel.cancelled() => return cancelled(&call),
            decision = self.approval.decide(&call) => decision,
        };
        run(call, connector, decision, cancel).await
    }

    /// Calls from one model turn: approved as one batch, executed
    /// concurrently. Output order matches input order.
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> Vec<Dispatch> {
        let mut slots: Vec<Option<Dispatch>> = calls.iter().map(|_| None).collect();
        let mut routed = Vec::new();

        for (idx, call) in calls.into_iter().enumerate() {
            match self.route(call) {
                Ok((call, connector)) => routed.push((idx, call, connector)),
                Err(result) => slots[idx] = Some(Dispatch::Executed(result)),
            }
        }

        let to_decide: Vec<ToolCall> = routed.iter().map(|(_, call, _)| call.clone()).collect();
        let decisions = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            decisions = self.approval.decide_batch(&to_decide) => Some(decisions),
        };

        match decisions {
            Some(decisions) => {
                let runs = routed
                    .into_iter()
                    .zip(decisions)
                    .map(|((idx, call, connector), decision)| async move {
                        (idx, run(call, connector, decision, cancel).await)
                    });
                for (idx, dispatch) in join_all(runs).await {
                    slots[idx] = Some(dispatch);
                }
            }
            None => {
                for (idx, call, _) in routed {
                    slots[idx] = Some(cancelled(&call));
                }
            }
        }

        slots.into_iter().flatten().collect()
    }
}

async fn run(
    call: ToolCall,
    connector: Connector,
    decision: ApprovalDecision,
    cancel: &CancellationToken,
) -> Dispatch {
    if decision.is_approved() {
        Dispatch::Executed(connector.execute(&call, cancel).await)
    } else {
        info!(call_id = %call.id, tool = %call.tool_name, "Call denied, not dispatched");
        Dispatch::Denied(decision)
    }
}

fn cancelled(call: &ToolCall) -> Dispatch {
    Dispatch::Executed(ToolResult::failure(
        call,
        &ConnectorError::Cancelled,
        Duration::ZERO,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::MemoryPreferences;

    fn registry() -> ConnectorRegistry {
        let approval = ApprovalEngine::new(Arc::new(MemoryPreferences::new())).unwrap();
        ConnectorRegistry::new(Arc::new(approval))
    }

    fn idle(id: &str) -> Connector {
        let factory: TransportFactory =
            Arc::new(|| Err(ConnectorError::Connection("unused".into())));
        Connector::new(id, id, factory, Timeouts::default())
    }

    #[test]
    fn test_add_rejects_bad_and_duplicate_ids() {
        let reg = registry();
        reg.add(idle("time"), true).unwrap();
        assert!(reg.add(idle("time"), true).is_err());
        assert!(reg.add(idle("a__b"), true).is_err());
        assert!(reg.add(idle("a.b"), true).is_err());
        assert!(reg.add(idle(""), true).is_err());
        assert_eq!(reg.connectors().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_fast() {
        let reg = registry();
        reg.add(idle("time"), true).unwrap();
        let call = ToolCall::new("time__now", Default::default());

        let dispatch = reg.execute(call, &CancellationToken::new()).await;
        let result = dispatch.result().unwrap();
        assert_eq!(
            result.error_kind(),
            Some(crate::error::ErrorKind::ToolNotFound)
        );
        assert_eq!(result.duration, Duration::ZERO);
        assert!(reg.approval().audit_log().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_false() {
        let reg = registry();
        assert!(!reg.remove("nope").await.unwrap());
    }

    #[test]
    fn test_statuses_report_disabled() {
        let reg = registry();
        reg.add(idle("off"), false).unwrap();
        let statuses = reg.statuses();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].enabled);
        assert_eq!(statuses[0].state, ConnectorState::Disconnected);
    }
}
