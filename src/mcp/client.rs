//! JSON-RPC protocol client over a [`Transport`].
//!
//! The client owns the inbound frame stream. A single pump task classifies
//! every frame: responses are routed to their waiter by id (so replies may
//! arrive in any order), provider requests are answered (`ping` with `{}`,
//! anything else with method-not-found), and notifications surface as
//! [`ProviderEvent`]s.
//!
//! When the stream ends every outstanding request fails with
//! [`ConnectorError::NotConnected`] instead of hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{FrameStream, Transport};
use super::types::{
    CallToolParams, CallToolResult, CancelledParams, Implementation, Incoming, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcReply, JsonRpcRequest,
    ListToolsParams, ListToolsResult, METHOD_NOT_FOUND, McpTool, PROTOCOL_VERSION,
};
use crate::error::{ConnectorError, Operation, Result};
use crate::race::{RaceError, with_timeout};
use crate::relock;

/// Upper bound on `tools/list` pages, against providers that loop cursors.
const MAX_LIST_PAGES: usize = 64;

type Reply = std::result::Result<Value, JsonRpcError>;

/// Something the provider told us outside a request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// `notifications/tools/list_changed`.
    ToolsChanged,
    /// The inbound stream ended without us closing it.
    Closed(String),
}

#[derive(Debug, Default)]
struct PendingTable {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    /// Set once the stream is gone; no new waiters are accepted after this.
    closed: Option<String>,
}

/// Removes a waiter when its request future is dropped (timeout, caller
/// cancellation), so late replies are ignored instead of leaking entries.
#[derive(Debug)]
struct PendingGuard {
    table: Arc<Mutex<PendingTable>>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        relock(self.table.lock()).waiters.remove(&self.id);
    }
}

/// Correlates requests and responses for one provider.
#[derive(Debug)]
pub struct ProtocolClient {
    label: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingTable>>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    server: Mutex<Option<InitializeResult>>,
}

impl ProtocolClient {
    /// Take the transport's frame stream and start the pump. The transport
    /// must already be connected.
    pub fn start(
        label: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProviderEvent>)> {
        let label = label.into();
        let frames = transport.receive()?;
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump(
            label.clone(),
            Arc::clone(&transport),
            frames,
            Arc::clone(&pending),
            shutdown.clone(),
            events_tx,
        ));

        let client = Self {
            label,
            transport,
            next_id: AtomicU64::new(1),
            pending,
            shutdown,
            pump: Mutex::new(Some(pump)),
            server: Mutex::new(None),
        };
        Ok((client, events_rx))
    }

    /// Provider name, version and protocol revision from the handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        relock(self.server.lock()).clone()
    }

    pub fn is_closed(&self) -> bool {
        relock(self.pending.lock()).closed.is_some()
    }

    /// Run the `initialize` handshake followed by `notifications/initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: json!({}),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            },
        };

        let result: InitializeResult = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?
            .map_err(|e| ConnectorError::Connection(format!("initialize rejected: {}", e.message)))
            .and_then(|v| decode(v, "initialize"))?;

        self.notify("notifications/initialized", None).await?;

        info!(
            name: "mcp.client.initialized",
            connector = %self.label,
            server = result.server_info.as_ref().map_or("unknown", |s| s.name.as_str()),
            protocol = %result.protocol_version,
            "Handshake complete"
        );
        *relock(self.server.lock()) = Some(result.clone());
        Ok(result)
    }

    /// Fetch every page of `tools/list`. A provider without the method has no
    /// tools.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = ListToolsParams {
                cursor: cursor.take(),
            };
            let page: ListToolsResult = match self
                .request("tools/list", Some(serde_json::to_value(params)?))
                .await?
            {
                Ok(v) => decode(v, "tools/list")?,
                Err(e) if e.code == METHOD_NOT_FOUND => {
                    debug!(connector = %self.label, "provider has no tools/list");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(ConnectorError::Provider(e.message)),
            };

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!(connector = %self.label, pages = MAX_LIST_PAGES, "tools/list pagination cut off");
        Ok(tools)
    }

    /// Invoke one tool. On timeout the provider is told to stop via
    /// `notifications/cancelled` and the pending id is forgotten.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        limit: Duration,
    ) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match with_timeout(limit, self.request_with_id(id, "tools/call", Some(params))).await {
            Ok(reply) => match reply? {
                Ok(v) => decode(v, "tools/call"),
                Err(e) => Err(ConnectorError::Provider(e.message)),
            },
            Err(RaceError::TimedOut(after)) => {
                warn!(
                    connector = %self.label,
                    tool = %name,
                    request_id = id,
                    elapsed_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                    "tools/call timed out, cancelling"
                );
                self.cancel_request(id, "timeout").await;
                Err(ConnectorError::Timeout {
                    operation: Operation::Execute,
                    after,
                })
            }
            Err(RaceError::Cancelled) => Err(ConnectorError::Cancelled),
        }
    }

    /// Tell the provider to abandon request `id`. Best effort.
    pub async fn cancel_request(&self, id: u64, reason: &str) {
        relock(self.pending.lock()).waiters.remove(&id);
        let params = CancelledParams {
            request_id: id,
            reason: Some(reason.to_string()),
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        if let Err(e) = self.notify("notifications/cancelled", Some(params)).await {
            debug!(connector = %self.label, request_id = id, error = %e, "cancel notification not sent");
        }
    }

    /// Stop the pump and fail outstanding requests. Does not touch the
    /// transport; its owner disposes of it.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(pump) = relock(self.pump.lock()).take() {
            pump.abort();
        }
        close_table(&self.pending, "client closed".into());
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.request_with_id(id, method, params).await
    }

    async fn request_with_id(&self, id: u64, method: &str, params: Option<Value>) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = relock(self.pending.lock());
            if let Some(reason) = &table.closed {
                return Err(ConnectorError::NotConnected(format!("{}: {reason}", self.label)));
            }
            table.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            table: Arc::clone(&self.pending),
            id,
        };

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        debug!(connector = %self.label, request_id = id, method, "-> request");
        self.transport.send(frame).await?;

        rx.await.map_err(|_dropped| {
            let reason = relock(self.pending.lock())
                .closed
                .clone()
                .unwrap_or_else(|| "connection closed".into());
            ConnectorError::NotConnected(format!("{}: {reason}", self.label))
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.transport.send(frame).await?;
        Ok(())
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(pump) = relock(self.pump.lock()).take() {
            pump.abort();
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value, method: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ConnectorError::Protocol(format!("malformed {method} result: {e}")))
}

/// Mark the table closed and drop every waiter; their receivers then fail.
fn close_table(table: &Mutex<PendingTable>, reason: String) {
    let mut table = relock(table.lock());
    if table.closed.is_none() {
        table.closed = Some(reason);
    }
    table.waiters.clear();
}

async fn pump(
    label: String,
    transport: Arc<dyn Transport>,
    mut frames: FrameStream,
    table: Arc<Mutex<PendingTable>>,
    shutdown: CancellationToken,
    events: mpsc::UnboundedSender<ProviderEvent>,
) {
    let reason = loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => handle_frame(&label, &transport, &table, &events, &frame),
            Some(Err(e)) => break e.to_string(),
            None => break "provider closed the connection".to_string(),
        }
    };

    if shutdown.is_cancelled() {
        return;
    }
    warn!(name: "mcp.client.closed", connector = %label, reason = %reason, "Provider connection lost");
    close_table(&table, reason.clone());
    let _ = events.send(ProviderEvent::Closed(reason));
}

fn handle_frame(
    label: &str,
    transport: &Arc<dyn Transport>,
    table: &Mutex<PendingTable>,
    events: &mpsc::UnboundedSender<ProviderEvent>,
    frame: &str,
) {
    let value: Value = match serde_json::from_str(frame) {
        Ok(v) => v,
        Err(e) => {
            warn!(connector = %label, error = %e, "ignoring non-JSON frame");
            return;
        }
    };

    let messages = match value {
        Value::Array(batch) => batch,
        other => vec![other],
    };

    for message in messages {
        match Incoming::classify(message) {
            Some(Incoming::Response { id, outcome }) => {
                let waiter = relock(table.lock()).waiters.remove(&id);
                match waiter {
                    Some(tx) => {
                        debug!(connector = %label, request_id = id, "<- response");
                        let _ = tx.send(outcome);
                    }
                    None => debug!(connector = %label, request_id = id, "late or unknown response dropped"),
                }
            }
            Some(Incoming::Request { id, method, .. }) => {
                let reply = if method == "ping" {
                    JsonRpcReply::ok(id, json!({}))
                } else {
                    debug!(connector = %label, method = %method, "unsupported provider request");
                    JsonRpcReply::err(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
                };
                // Sent off the pump so a full outbound path never stalls inbound routing.
                let transport = Arc::clone(transport);
                let label = label.to_string();
                tokio::spawn(async move {
                    let Ok(frame) = serde_json::to_string(&reply) else {
                        return;
                    };
                    if let Err(e) = transport.send(frame).await {
                        debug!(connector = %label, error = %e, "reply to provider request failed");
                    }
                });
            }
            Some(Incoming::Notification { method, .. }) => {
                if method == "notifications/tools/list_changed" {
                    info!(connector = %label, "provider tool list changed");
                    let _ = events.send(ProviderEvent::ToolsChanged);
                } else {
                    debug!(connector = %label, method = %method, "provider notification");
                }
            }
            None => warn!(connector = %label, "ignoring unrecognised JSON-RPC message"),
        }
    }
}
