//! The per-provider connection state machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{ConnectorState, ConnectorTool, ToolCall, ToolResult};
use crate::error::{ConnectorError, Operation, Result};
use crate::mcp::client::{ProtocolClient, ProviderEvent};
use crate::mcp::convert::{ToolSchema, display_names, flatten_result, to_native_arguments};
use crate::mcp::transport::Transport;
use crate::mcp::types::{InitializeResult, McpTool};
use crate::race::with_timeout_or_cancel;
use crate::relock;

/// Builds a fresh, unconnected transport for each connect attempt.
pub type TransportFactory = Arc<dyn Fn() -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Bounds for the three timed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub discover: Duration,
    pub execute: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            discover: Duration::from_secs(30),
            execute: Duration::from_secs(120),
        }
    }
}

/// A live connection: the transport, the client on top of it, and the task
/// reacting to provider events.
struct Session {
    generation: u64,
    transport: Arc<dyn Transport>,
    client: Arc<ProtocolClient>,
    watcher: JoinHandle<()>,
}

impl Session {
    async fn dispose(self, id: &str) {
        self.watcher.abort();
        dispose(id, &self.client, &self.transport).await;
    }
}

async fn dispose(id: &str, client: &ProtocolClient, transport: &Arc<dyn Transport>) {
    client.close();
    if let Err(e) = transport.disconnect().await {
        warn!(connector_id = %id, error = %e, "transport disconnect failed");
    }
}

struct Inner {
    id: String,
    name: String,
    factory: TransportFactory,
    timeouts: Timeouts,
    state: watch::Sender<ConnectorState>,
    catalog: RwLock<Arc<Vec<ConnectorTool>>>,
    session: Mutex<Option<Session>>,
    /// Cancelled by `disconnect()` to abort an in-flight connect.
    lifecycle: Mutex<CancellationToken>,
    generation: AtomicU64,
}

/// Managed binding to one tool provider. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .field("tool_count", &self.tools().len())
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        factory: TransportFactory,
        timeouts: Timeouts,
    ) -> Self {
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                name: name.into(),
                factory,
                timeouts,
                state,
                catalog: RwLock::new(Arc::new(Vec::new())),
                session: Mutex::new(None),
                lifecycle: Mutex::new(CancellationToken::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectorState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the catalog. Empty unless connected.
    pub fn tools(&self) -> Arc<Vec<ConnectorTool>> {
        Arc::clone(&*relock(self.inner.catalog.read()))
    }

    /// Handshake result of the current session.
    pub fn server_info(&self) -> Option<InitializeResult> {
        relock(self.inner.session.lock())
            .as_ref()
            .and_then(|s| s.client.server_info())
    }

    /// Connect, handshake and discover tools.
    ///
    /// A no-op when already connected or while another connect is in flight.
    pub async fn connect(&self) -> Result<()> {
        // The claim and the token swap happen under the lifecycle lock, so a
        // `disconnect()` observing `Connecting` always cancels this attempt.
        let token = {
            let mut lifecycle = relock(self.inner.lifecycle.lock());
            let mut claimed = false;
            self.inner.state.send_if_modified(|state| match state {
                ConnectorState::Connected | ConnectorState::Connecting => false,
                _ => {
                    *state = ConnectorState::Connecting;
                    claimed = true;
                    true
                }
            });
            if !claimed {
                debug!(connector_id = %self.inner.id, "connect skipped, already connected or connecting");
                return Ok(());
            }
            let token = CancellationToken::new();
            *lifecycle = token.clone();
            token
        };

        self.inner.set_catalog(Vec::new());
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(name: "connector.connecting", connector_id = %self.inner.id, "Connecting");
        let started = Instant::now();

        let transport = match (self.inner.factory)() {
            Ok(t) => t,
            Err(e) => return Err(self.inner.fail_connect(&token, e)),
        };

        let (client, events, tools) = match self.inner.establish(&transport, &token).await {
            Ok(established) => established,
            Err((e, client)) => {
                if let Some(client) = client {
                    dispose(&self.inner.id, &client, &transport).await;
                } else if let Err(err) = transport.disconnect().await {
                    debug!(connector_id = %self.inner.id, error = %err, "transport cleanup failed");
                }
                return Err(self.inner.fail_connect(&token, e));
            }
        };

        // Install under the session lock; a concurrent `disconnect()` cancels
        // the token before it takes this lock.
        let installed = {
            let mut slot = relock(self.inner.session.lock());
            if token.is_cancelled() {
                false
            } else {
                let watcher = tokio::spawn(watch_events(
                    Arc::downgrade(&self.inner),
                    generation,
                    events,
                ));
                *slot = Some(Session {
                    generation,
                    transport: Arc::clone(&transport),
                    client: Arc::clone(&client),
                    watcher,
                });
                let count = tools.len();
                self.inner.set_catalog(tools);
                self.inner.state.send_replace(ConnectorState::Connected);
                info!(
                    name: "connector.connected",
                    connector_id = %self.inner.id,
                    tools = count,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Connected"
                );
                true
            }
        };

        if installed {
            Ok(())
        } else {
            dispose(&self.inner.id, &client, &transport).await;
            Err(ConnectorError::Cancelled)
        }
    }

    /// Close the session and clear the catalog. Repeatable.
    pub async fn disconnect(&self) -> Result<()> {
        relock(self.inner.lifecycle.lock()).cancel();
        let session = relock(self.inner.session.lock()).take();
        if let Some(session) = session {
            session.dispose(&self.inner.id).await;
            info!(name: "connector.disconnected", connector_id = %self.inner.id, "Disconnected");
        }
        self.inner.set_catalog(Vec::new());
        self.inner.state.send_replace(ConnectorState::Disconnected);
        Ok(())
    }

    /// Re-run discovery on the live session and replace the catalog.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    /// Execute one call. Failures come back as a failed [`ToolResult`],
    /// never as an error.
    pub async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let inner = &self.inner;
        let client = {
            let session = relock(inner.session.lock());
            match session.as_ref() {
                Some(s) if inner.state.borrow().is_connected() => Arc::clone(&s.client),
                _ => {
                    let err = ConnectorError::NotConnected(inner.id.clone());
                    return ToolResult::failure(call, &err, Duration::ZERO);
                }
            }
        };

        let catalog = self.tools();
        let Some(tool) = catalog.iter().find(|t| t.display_name == call.tool_name) else {
            let err = ConnectorError::ToolNotFound(call.tool_name.clone());
            return ToolResult::failure(call, &err, Duration::ZERO);
        };

        if cancel.is_cancelled() {
            return ToolResult::failure(call, &ConnectorError::Cancelled, Duration::ZERO);
        }

        let started = Instant::now();
        let arguments = to_native_arguments(&call.arguments);
        let reply = client
            .call_tool(&tool.native_name, arguments, inner.timeouts.execute)
            .await
            .map(|r| (flatten_result(&r), r.is_error));
        let duration = started.elapsed();
        let elapsed_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        // The round trip is allowed to finish so the provider is never left
        // mid-operation, but a cancelled caller never sees the payload.
        if cancel.is_cancelled() {
            info!(connector_id = %inner.id, call_id = %call.id, tool = %call.tool_name, elapsed_ms, "call cancelled during round trip");
            return ToolResult::failure(call, &ConnectorError::Cancelled, duration);
        }

        match reply {
            Ok((content, false)) => {
                info!(
                    name: "connector.execute",
                    connector_id = %inner.id,
                    call_id = %call.id,
                    tool = %call.tool_name,
                    elapsed_ms,
                    "Tool call succeeded"
                );
                ToolResult::success(call, content, duration)
            }
            Ok((content, true)) => {
                warn!(connector_id = %inner.id, call_id = %call.id, tool = %call.tool_name, elapsed_ms, "provider reported tool error");
                ToolResult::failure(call, &ConnectorError::Provider(content), duration)
            }
            Err(e) => {
                warn!(connector_id = %inner.id, call_id = %call.id, tool = %call.tool_name, elapsed_ms, error = %e, "Tool call failed");
                ToolResult::failure(call, &e, duration)
            }
        }
    }
}

/// A failed connect step, with the client to close if one was started.
type Failed = (ConnectorError, Option<Arc<ProtocolClient>>);

type Established = (
    Arc<ProtocolClient>,
    mpsc::UnboundedReceiver<ProviderEvent>,
    Vec<ConnectorTool>,
);

impl Inner {
    fn set_catalog(&self, tools: Vec<ConnectorTool>) {
        *relock(self.catalog.write()) = Arc::new(tools);
    }

    /// Record a failed connect, unless it was aborted by `disconnect()`.
    fn fail_connect(&self, token: &CancellationToken, err: ConnectorError) -> ConnectorError {
        if token.is_cancelled() {
            return ConnectorError::Cancelled;
        }
        warn!(name: "connector.connect_failed", connector_id = %self.id, error = %err, "Connect failed");
        self.state
            .send_replace(ConnectorState::Error(err.to_string()));
        err
    }

    /// Transport connect and handshake under the connect timeout, then
    /// discovery under its own.
    async fn establish(
        &self,
        transport: &Arc<dyn Transport>,
        token: &CancellationToken,
    ) -> std::result::Result<Established, Failed> {
        let handshake = async {
            transport
                .connect()
                .await
                .map_err(|e| (ConnectorError::from(e), None))?;
            let (client, events) = ProtocolClient::start(self.id.clone(), Arc::clone(transport))
                .map_err(|e| (e, None))?;
            let client = Arc::new(client);
            match client.initialize().await {
                Ok(_) => Ok::<_, Failed>((client, events)),
                Err(e) => Err((e, Some(client))),
            }
        };
        let (client, events) = with_timeout_or_cancel(self.timeouts.connect, token, handshake)
            .await
            .map_err(|e| (e.into_connector_error(Operation::Connect), None))??;

        let natives = with_timeout_or_cancel(self.timeouts.discover, token, client.list_tools())
            .await
            .map_err(|e| (e.into_connector_error(Operation::Discover), Some(Arc::clone(&client))))?
            .map_err(|e| (e, Some(Arc::clone(&client))))?;

        Ok((client, events, build_catalog(&self.id, natives)))
    }

    async fn refresh(&self) -> Result<()> {
        let (client, generation) = {
            let session = relock(self.session.lock());
            match session.as_ref() {
                Some(s) if self.state.borrow().is_connected() => {
                    (Arc::clone(&s.client), s.generation)
                }
                _ => return Err(ConnectorError::NotConnected(self.id.clone())),
            }
        };
        let token = relock(self.lifecycle.lock()).clone();

        let natives = with_timeout_or_cancel(self.timeouts.discover, &token, client.list_tools())
            .await
            .map_err(|e| e.into_connector_error(Operation::Discover))??;
        let tools = build_catalog(&self.id, natives);

        let session = relock(self.session.lock());
        if session.as_ref().is_some_and(|s| s.generation == generation) {
            info!(name: "connector.refreshed", connector_id = %self.id, tools = tools.len(), "Catalog refreshed");
            self.set_catalog(tools);
        }
        Ok(())
    }

    /// The session of `generation` lost its transport.
    async fn lost(&self, generation: u64, reason: String) {
        let session = {
            let mut slot = relock(self.session.lock());
            if slot.as_ref().is_none_or(|s| s.generation != generation) {
                return;
            }
            let session = slot.take();
            self.set_catalog(Vec::new());
            self.state.send_replace(ConnectorState::Error(reason.clone()));
            session
        };
        warn!(name: "connector.lost", connector_id = %self.id, reason = %reason, "Provider connection lost");
        if let Some(session) = session {
            // Runs on the watcher task itself, so the watcher is left alone.
            dispose(&self.id, &session.client, &session.transport).await;
        }
    }
}

async fn watch_events(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ProviderEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            ProviderEvent::ToolsChanged => {
                if let Err(e) = inner.refresh().await {
                    warn!(connector_id = %inner.id, error = %e, "catalog refresh failed");
                }
            }
            ProviderEvent::Closed(reason) => {
                inner.lost(generation, reason).await;
                return;
            }
        }
    }
}

/// Tag each advertised tool with this connector and a unique display name.
fn build_catalog(connector_id: &str, natives: Vec<McpTool>) -> Vec<ConnectorTool> {
    let names = display_names(connector_id, natives.iter().map(|t| t.name.as_str()));
    natives
        .into_iter()
        .zip(names)
        .map(|(tool, display_name)| ConnectorTool {
            description: tool
                .description
                .or(tool.title)
                .unwrap_or_default(),
            schema: ToolSchema::from_native(&tool.input_schema),
            native_name: tool.name,
            display_name,
            connector_id: connector_id.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_catalog_tags_connector() {
        let natives: Vec<McpTool> = serde_json::from_value(json!([
            {"name": "now", "description": "Current time",
             "inputSchema": {"type": "object", "properties": {"tz": {"type": "string"}}}},
            {"name": "now!", "title": "Also now"}
        ]))
        .unwrap();

        let catalog = build_catalog("time", natives);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].display_name, "time__now");
        assert_eq!(catalog[0].native_name, "now");
        assert_eq!(catalog[0].connector_id, "time");
        assert!(catalog[0].schema.properties.contains_key("tz"));
        assert_eq!(catalog[1].display_name, "time__now_");
        assert_eq!(catalog[1].description, "Also now");
    }

    #[tokio::test]
    async fn test_factory_failure_sets_error_state() {
        let factory: TransportFactory =
            Arc::new(|| Err(ConnectorError::AuthenticationRequired("no token".into())));
        let connector = Connector::new("remote", "Remote", factory, Timeouts::default());

        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AuthenticationRequired);
        assert!(matches!(connector.state(), ConnectorState::Error(_)));
        assert!(connector.tools().is_empty());
    }
}
