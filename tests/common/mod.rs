//! Shared test utilities and fixtures
//!
//! A scripted in-process language server. Each `connect` hands the client a
//! fresh duplex stream, so restarts get a new "process".

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::io::{DuplexStream, duplex};
use tokio::sync::{Notify, mpsc};

use tether_lsp::codec::{Framing, MessageReader, MessageWriter};
use tether_lsp::{
    ClientOptions, ClientState, LanguageClient, Result, ServerOptions, TextDocument, Transport,
    TransportFactory,
};

const WAIT: Duration = Duration::from_secs(5);

/// What the fake server answers to a request.
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Answer with a result after a pause.
    Delayed(Duration, Value),
    /// Never answer.
    Silent,
}

type Handler = Box<dyn Fn(&Value, u32) -> Reply + Send + Sync>;

enum Outbound {
    Message(Value),
    Hangup,
}

struct Inner {
    capabilities: Value,
    handlers: Mutex<HashMap<String, Handler>>,
    counts: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<Value>>,
    changed: Notify,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    connections: AtomicUsize,
    next_id: AtomicI64,
}

impl Inner {
    fn record(&self, message: Value) {
        self.log.lock().unwrap().push(message);
        self.changed.notify_waiters();
    }

    fn reply(&self, request: &Value) -> Reply {
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let count = {
            let mut counts = self.counts.lock().unwrap();
            let count = counts.entry(method.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(handler) = self.handlers.lock().unwrap().get(&method) {
            return handler(&request["params"], count);
        }
        match method.as_str() {
            "initialize" => Reply::Result(json!({
                "capabilities": self.capabilities,
                "serverInfo": { "name": "fake-server", "version": "0.1.0" }
            })),
            _ => Reply::Result(Value::Null),
        }
    }
}

#[derive(Clone)]
pub struct FakeServer {
    inner: Arc<Inner>,
}

impl FakeServer {
    pub fn new(capabilities: Value) -> Self {
        Self {
            inner: Arc::new(Inner {
                capabilities,
                handlers: Mutex::default(),
                counts: Mutex::default(),
                log: Mutex::default(),
                changed: Notify::new(),
                outbound: Mutex::default(),
                connections: AtomicUsize::new(0),
                next_id: AtomicI64::new(1000),
            }),
        }
    }

    /// Answer `method` with `handler(params, call_number)`.
    pub fn respond<F>(self, method: &str, handler: F) -> Self
    where
        F: Fn(&Value, u32) -> Reply + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), Box::new(handler));
        self
    }

    pub fn options(&self, name: &str) -> ClientOptions {
        ClientOptions::new(name, ServerOptions::Factory(Arc::new(self.clone())))
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Every client message, oldest first.
    pub fn received(&self) -> Vec<Value> {
        self.inner.log.lock().unwrap().clone()
    }

    /// Methods of the client requests and notifications, oldest first.
    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["method"].as_str().map(str::to_string))
            .collect()
    }

    pub fn messages(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m["method"] == method)
            .collect()
    }

    /// Wait until the client sent `method` at least `count` times.
    pub async fn wait_for(&self, method: &str, count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let notified = self.inner.changed.notified();
            let found = self.messages(method);
            if found.len() >= count {
                return found;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!("timed out waiting for {count} x {method}; saw {:?}", self.methods());
            }
        }
    }

    /// Send a notification to the client.
    pub fn notify(&self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }));
    }

    /// Send a request to the client and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> Value {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }));
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let notified = self.inner.changed.notified();
            let response = self
                .received()
                .into_iter()
                .find(|m| m["id"] == id && m.get("method").is_none());
            if let Some(response) = response {
                return response;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!("timed out waiting for the response to {method}");
            }
        }
    }

    /// Drop the current connection as if the server crashed.
    pub fn crash(&self) {
        if let Some(outbound) = self.inner.outbound.lock().unwrap().take() {
            let _ = outbound.send(Outbound::Hangup);
        }
    }

    fn send(&self, message: Value) {
        let outbound = self.inner.outbound.lock().unwrap();
        outbound
            .as_ref()
            .expect("no client connected")
            .send(Outbound::Message(message))
            .expect("server connection closed");
    }
}

impl TransportFactory for FakeServer {
    fn connect(&self) -> BoxFuture<'static, Result<Transport>> {
        let inner = self.inner.clone();
        async move {
            let (client_read, server_write) = duplex(256 * 1024);
            let (server_read, client_write) = duplex(256 * 1024);
            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            *inner.outbound.lock().unwrap() = Some(outbound.clone());
            inner.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(inner, server_read, server_write, outbound, outbound_rx));
            Ok(Transport::new(client_read, client_write, Framing::ContentLength))
        }
        .boxed()
    }
}

async fn serve(
    inner: Arc<Inner>,
    reader: DuplexStream,
    writer: DuplexStream,
    outbound: mpsc::UnboundedSender<Outbound>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let reader_task = tokio::spawn({
        let inner = inner.clone();
        async move {
            let mut reader = MessageReader::new(reader, Framing::ContentLength);
            while let Ok(Some(message)) = reader.read_message().await {
                inner.record(message.clone());
                let Some(method) = message["method"].as_str() else {
                    continue;
                };
                if method == "exit" {
                    let _ = outbound.send(Outbound::Hangup);
                    return;
                }
                if message.get("id").is_none() {
                    continue;
                }
                let response = match inner.reply(&message) {
                    Reply::Result(result) => {
                        json!({ "jsonrpc": "2.0", "id": message["id"], "result": result })
                    }
                    Reply::Error(code, text) => json!({
                        "jsonrpc": "2.0",
                        "id": message["id"],
                        "error": { "code": code, "message": text }
                    }),
                    Reply::Delayed(pause, result) => {
                        let outbound = outbound.clone();
                        let id = message["id"].clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(pause).await;
                            let _ = outbound.send(Outbound::Message(
                                json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                            ));
                        });
                        continue;
                    }
                    Reply::Silent => continue,
                };
                let _ = outbound.send(Outbound::Message(response));
            }
        }
    });

    let mut writer = MessageWriter::new(writer, Framing::ContentLength);
    while let Some(command) = outbound_rx.recv().await {
        match command {
            Outbound::Message(message) => {
                if writer.write_message(&message).await.is_err() {
                    break;
                }
            }
            Outbound::Hangup => break,
        }
    }
    reader_task.abort();
}

/// A running client connected to `server`.
pub async fn start(
    server: &FakeServer,
    configure: impl FnOnce(ClientOptions) -> ClientOptions,
) -> LanguageClient {
    let client = LanguageClient::new(configure(server.options("fake")));
    client.start().await.expect("client starts");
    client
}

pub async fn wait_for_state(client: &LanguageClient, state: ClientState) {
    let mut states = client.state_changes();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}; still {}", client.state()))
        .expect("client dropped");
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn xml(name: &str, version: i32, text: &str) -> TextDocument {
    TextDocument::new(format!("file:///ws/{name}"), "xml", version, text)
}

pub fn error_report(result_id: &str, message: &str) -> Value {
    json!({
        "kind": "full",
        "resultId": result_id,
        "items": [{
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 4 } },
            "severity": 1,
            "message": message
        }]
    })
}
