//! Scripted in-process tool provider for integration tests.
//!
//! [`FakeProvider::factory`] hands a connector a fresh [`MemoryTransport`]
//! per connect attempt and serves the provider side of the protocol on a
//! background task.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use toolbridge::approval::{ApprovalEngine, MemoryPreferences};
use toolbridge::connector::{Connector, Timeouts, TransportFactory};
use toolbridge::error::TransportError;
use toolbridge::mcp::transport::{MemoryPeer, MemoryTransport, Transport};

/// What the provider answers to one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Never answer.
    Silent,
}

pub type CallHandler = Arc<dyn Fn(&str, &Value) -> (Duration, Reply) + Send + Sync>;

enum Control {
    Send(Value),
    Fail(TransportError),
    Close,
}

pub struct FakeProvider {
    tools: Mutex<Vec<Value>>,
    page_size: Mutex<Option<usize>>,
    handler: Mutex<CallHandler>,
    init_delay: Mutex<Duration>,
    received: Mutex<Vec<Value>>,
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    sessions: AtomicUsize,
    fail_connect: Mutex<Option<TransportError>>,
}

impl FakeProvider {
    /// A provider advertising `tools` (names only) that echoes every call.
    pub fn new(tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(tools.iter().map(|name| tool(name)).collect()),
            page_size: Mutex::new(None),
            handler: Mutex::new(echo_handler()),
            init_delay: Mutex::new(Duration::ZERO),
            received: Mutex::new(Vec::new()),
            control: Mutex::new(None),
            sessions: AtomicUsize::new(0),
            fail_connect: Mutex::new(None),
        })
    }

    pub fn factory(self: &Arc<Self>) -> TransportFactory {
        let provider = Arc::clone(self);
        Arc::new(move || {
            let (transport, peer) = MemoryTransport::pair();
            if let Some(err) = provider.fail_connect.lock().unwrap().take() {
                peer.fail_next_connect(err);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *provider.control.lock().unwrap() = Some(tx);
            provider.sessions.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(Arc::clone(&provider), peer, rx));
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        })
    }

    pub fn connector(self: &Arc<Self>, id: &str, timeouts: Timeouts) -> Connector {
        Connector::new(id, id, self.factory(), timeouts)
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock().unwrap() = tools.iter().map(|name| tool(name)).collect();
    }

    pub fn set_raw_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock().unwrap() = Some(size);
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &Value) -> (Duration, Reply) + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn set_init_delay(&self, delay: Duration) {
        *self.init_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_connect(&self, err: TransportError) {
        *self.fail_connect.lock().unwrap() = Some(err);
    }

    /// Number of transports handed out.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Every message received from the client, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(String::from))
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.received_methods().iter().filter(|m| *m == method).count()
    }

    /// Push a raw message to the client on the current session.
    pub fn push(&self, message: Value) {
        self.control(Control::Send(message));
    }

    pub fn notify_tools_changed(&self) {
        self.push(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}));
    }

    /// End the current session with a transport error.
    pub fn fail(&self, err: TransportError) {
        self.control(Control::Fail(err));
    }

    /// Drop the provider side of the current session.
    pub fn close(&self) {
        self.control(Control::Close);
    }

    fn control(&self, msg: Control) {
        if let Some(tx) = self.control.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Wait until a message matching `pred` has arrived.
    pub async fn wait_for<F>(&self, pred: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        for _ in 0..500 {
            if let Some(found) = self.received().into_iter().find(|m| pred(m)) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("provider never received the expected message");
    }

    pub async fn wait_for_method(&self, method: &str) -> Value {
        self.wait_for(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .await
    }

    fn answer(&self, msg: &Value) -> Option<(Duration, Reply)> {
        let method = msg.get("method")?.as_str()?;
        msg.get("id")?;
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        Some(match method {
            "initialize" => (
                *self.init_delay.lock().unwrap(),
                Reply::Result(json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": "fake-provider", "version": "1.0.0"}
                })),
            ),
            "tools/list" => (Duration::ZERO, Reply::Result(self.page(&params))),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let args = params.get("arguments").cloned().unwrap_or(json!({}));
                let handler = Arc::clone(&self.handler.lock().unwrap());
                handler(&name, &args)
            }
            "ping" => (Duration::ZERO, Reply::Result(json!({}))),
            _ => (Duration::ZERO, Reply::Error(-32601, "Method not found".into())),
        })
    }

    fn page(&self, params: &Value) -> Value {
        let tools = self.tools.lock().unwrap().clone();
        let Some(size) = *self.page_size.lock().unwrap() else {
            return json!({"tools": tools});
        };
        let start: usize = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let end = (start + size).min(tools.len());
        let slice = tools[start..end].to_vec();
        let mut page = json!({"tools": slice});
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

async fn serve(
    provider: Arc<FakeProvider>,
    mut peer: MemoryPeer,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    loop {
        tokio::select! {
            frame = peer.recv() => {
                let Some(frame) = frame else { return };
                let msg: Value = serde_json::from_str(&frame).expect("client sent invalid JSON");
                provider.received.lock().unwrap().push(msg.clone());

                let Some((delay, reply)) = provider.answer(&msg) else { continue };
                let id = msg["id"].clone();
                let frame = match reply {
                    Reply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Reply::Error(code, message) => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": code, "message": message}
                    }),
                    Reply::Silent => continue,
                };
                if delay.is_zero() {
                    let _ = out_tx.send(frame);
                } else {
                    let out = out_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = out.send(frame);
                    });
                }
            }
            Some(frame) = out_rx.recv() => {
                peer.send(frame.to_string());
            }
            ctl = control.recv() => match ctl {
                Some(Control::Send(frame)) => {
                    peer.send(frame.to_string());
                }
                Some(Control::Fail(err)) => {
                    peer.fail(err);
                }
                Some(Control::Close) | None => return,
            }
        }
    }
}

pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("The {name} tool"),
        "inputSchema": {
            "type": "object",
            "properties": {"text": {"type": "string", "description": "Input"}},
            "required": []
        }
    })
}

/// Replies `"<tool>:<arguments>"` as text.
pub fn echo_handler() -> CallHandler {
    Arc::new(|name, args| (Duration::ZERO, text_reply(&format!("{name}:{args}"))))
}

pub fn text_reply(text: &str) -> Reply {
    Reply::Result(json!({"content": [{"type": "text", "text": text}], "isError": false}))
}

pub fn timeouts(connect: u64, discover: u64, execute: u64) -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(connect),
        discover: Duration::from_secs(discover),
        execute: Duration::from_secs(execute),
    }
}

pub fn approval() -> Arc<ApprovalEngine> {
    Arc::new(ApprovalEngine::new(Arc::new(MemoryPreferences::new())).unwrap())
}
