//! Start, stop, restart and server-initiated traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tether_lsp::protocol::METHOD_NOT_FOUND;
use tether_lsp::{ClientEvent, ClientState, LanguageClient, LspError, MessageType};

use crate::common::{FakeServer, Reply, eventually, start, wait_for_state, xml};

#[tokio::test]
async fn start_then_stop_follows_the_handshake() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }));
    let client = start(&server, |options| options).await;

    assert_eq!(client.state(), ClientState::Running);
    assert_eq!(client.server_info().unwrap().name, "fake-server");
    assert_eq!(client.server_capabilities().unwrap()["textDocumentSync"], 1);

    client.stop().await.unwrap();
    assert_eq!(client.state(), ClientState::Stopped);
    assert_eq!(server.methods(), ["initialize", "initialized", "shutdown", "exit"]);

    let initialize = &server.messages("initialize")[0]["params"];
    assert_eq!(initialize["clientInfo"]["name"], "tether");
    assert_eq!(initialize["capabilities"]["workspace"]["configuration"], true);
    assert_eq!(initialize["capabilities"]["workspace"]["diagnostics"]["refreshSupport"], true);
}

#[tokio::test]
async fn concurrent_stops_shut_down_once() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |options| options).await;

    let (a, b) = tokio::join!(client.stop(), client.stop());
    a.unwrap();
    b.unwrap();
    assert_eq!(server.messages("shutdown").len(), 1);
    assert_eq!(client.state(), ClientState::Stopped);
}

#[tokio::test]
async fn restart_reopens_known_documents() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }));
    let client = start(&server, |options| options).await;
    client.did_open(xml("a.xml", 1, "<a/>")).await;
    server.wait_for("textDocument/didOpen", 1).await;

    client.restart().await.unwrap();
    assert_eq!(client.state(), ClientState::Running);
    assert_eq!(server.connections(), 2);
    let opens = server.wait_for("textDocument/didOpen", 2).await;
    assert_eq!(opens[1]["params"]["textDocument"]["uri"], "file:///ws/a.xml");
}

#[tokio::test]
async fn crash_restarts_the_server() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |options| options).await;

    server.crash();
    eventually("second connection", || server.connections() == 2).await;
    server.wait_for("initialized", 2).await;
    wait_for_state(&client, ClientState::Running).await;
}

#[tokio::test]
async fn repeated_crashes_stop_the_client() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |mut options| {
        options.max_restart_count = 2;
        options
    })
    .await;
    let mut events = client.subscribe();

    for connection in 2..=3 {
        server.crash();
        server.wait_for("initialized", connection).await;
        wait_for_state(&client, ClientState::Running).await;
    }

    server.crash();
    wait_for_state(&client, ClientState::Stopped).await;
    assert_eq!(server.connections(), 3);

    let mut shown = None;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::ShowMessage { kind, message } = event {
            shown = Some((kind, message));
        }
    }
    let (kind, message) = shown.expect("crash message shown");
    assert_eq!(kind, MessageType::Error);
    assert!(message.contains("crashed 3 times"), "{message}");
    assert!(message.contains("will not be restarted"), "{message}");
}

#[tokio::test]
async fn stop_fails_outstanding_requests() {
    let server = FakeServer::new(json!({})).respond("custom/slow", |_, _| Reply::Silent);
    let client = start(&server, |options| options).await;

    let request = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .send_request("custom/slow", None, CancellationToken::new())
                .await
        }
    });
    server.wait_for("custom/slow", 1).await;
    client.stop().await.unwrap();

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, LspError::NotRunning), "{err}");
}

#[tokio::test]
async fn initialization_is_retried_when_configured() {
    let server = FakeServer::new(json!({})).respond("initialize", |_, n| {
        if n == 1 {
            Reply::Error(-32603, "not ready".into())
        } else {
            Reply::Result(json!({ "capabilities": {} }))
        }
    });
    let client = LanguageClient::new(server.options("fake").with_initialization_failed_handler(
        Arc::new(|_: &LspError, attempt: u32| attempt < 2),
    ));

    client.start().await.unwrap();
    assert_eq!(client.state(), ClientState::Running);
    assert_eq!(server.connections(), 2);
    assert!(client.server_info().is_none());
}

#[tokio::test]
async fn initialization_failure_is_reported() {
    let server = FakeServer::new(json!({}))
        .respond("initialize", |_, _| Reply::Error(-32603, "broken".into()));
    let client = LanguageClient::new(server.options("fake"));

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, LspError::InitializationFailed(ref m) if m.contains("broken")), "{err}");
    assert_eq!(client.state(), ClientState::StartFailed);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn cancelling_a_request_notifies_the_server() {
    let server = FakeServer::new(json!({})).respond("custom/slow", |_, _| Reply::Silent);
    let client = start(&server, |options| options).await;

    let token = CancellationToken::new();
    let request = tokio::spawn({
        let client = client.clone();
        let token = token.clone();
        async move { client.send_request("custom/slow", Some(json!({})), token).await }
    });
    let sent = server.wait_for("custom/slow", 1).await;
    token.cancel();

    let err = request.await.unwrap().unwrap_err();
    assert!(err.is_cancellation());
    let cancels = server.wait_for("$/cancelRequest", 1).await;
    assert_eq!(cancels[0]["params"]["id"], sent[0]["id"]);
    assert_eq!(client.state(), ClientState::Running);
}

#[tokio::test]
async fn request_results_and_errors_round_trip() {
    let server = FakeServer::new(json!({}))
        .respond("custom/echo", |params, _| Reply::Result(params.clone()))
        .respond("custom/fail", |_, _| Reply::Error(-32600, "bad".into()));
    let client = start(&server, |options| options).await;

    let echoed = client
        .send_request("custom/echo", Some(json!({ "n": 1 })), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(echoed, json!({ "n": 1 }));

    let err = client
        .send_request("custom/fail", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::Response { code: -32600, .. }), "{err}");
}

#[tokio::test]
async fn requests_wait_for_a_starting_client() {
    let server = FakeServer::new(json!({}))
        .respond("initialize", |_, _| {
            Reply::Delayed(Duration::from_millis(100), json!({ "capabilities": {} }))
        })
        .respond("custom/echo", |params, _| Reply::Result(params.clone()));
    let client = LanguageClient::new(server.options("fake"));

    let starting = tokio::spawn({
        let client = client.clone();
        async move { client.start().await }
    });
    wait_for_state(&client, ClientState::Starting).await;
    let echoed = client
        .send_request("custom/echo", Some(json!(7)), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(echoed, json!(7));
    starting.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_requests_are_routed() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |options| options).await;
    let handled = Arc::new(AtomicUsize::new(0));
    client.on_request("custom/ask", {
        let handled = handled.clone();
        move |params: Option<Value>| {
            handled.fetch_add(1, Ordering::SeqCst);
            async move { Ok(json!({ "asked": params })) }
        }
    });

    let answer = server.request("custom/ask", json!(1)).await;
    assert_eq!(answer["result"], json!({ "asked": 1 }));
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    let unknown = server.request("custom/unknown", json!({})).await;
    assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);

    let progress = server.request("window/workDoneProgress/create", json!({ "token": "t" })).await;
    assert!(progress["result"].is_null());
}

#[tokio::test]
async fn server_messages_become_events() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |options| options).await;
    let mut events = client.subscribe();

    let seen = Arc::new(AtomicUsize::new(0));
    client.on_notification("custom/ping", {
        let seen = seen.clone();
        move |_: Option<Value>| {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    server.notify("window/logMessage", json!({ "type": 2, "message": "careful" }));
    server.notify("window/showMessage", json!({ "type": 1, "message": "broken" }));
    server.notify("$/progress", json!({ "token": "build", "value": { "kind": "begin" } }));
    server.notify("custom/ping", json!(null));

    let mut log = None;
    let mut show = None;
    let mut progress = None;
    while log.is_none() || show.is_none() || progress.is_none() {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
            ClientEvent::LogMessage { kind, message } => log = Some((kind, message)),
            ClientEvent::ShowMessage { kind, message } => show = Some((kind, message)),
            ClientEvent::Progress { token, value } => progress = Some((token, value)),
            _ => {}
        }
    }
    assert_eq!(log.unwrap(), (MessageType::Warning, "careful".to_string()));
    assert_eq!(show.unwrap(), (MessageType::Error, "broken".to_string()));
    assert_eq!(progress.unwrap(), (json!("build"), json!({ "kind": "begin" })));
    eventually("custom notification", || seen.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn progress_handlers_take_their_token() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |options| options).await;
    let values = Arc::new(std::sync::Mutex::new(Vec::new()));
    client.on_progress(&json!(7), {
        let values = values.clone();
        move |value: Value| values.lock().unwrap().push(value)
    });

    server.notify("$/progress", json!({ "token": 7, "value": { "percentage": 50 } }));
    eventually("progress value", || values.lock().unwrap().len() == 1).await;
    assert_eq!(values.lock().unwrap()[0], json!({ "percentage": 50 }));
}

#[tokio::test]
async fn registration_of_unknown_methods_is_rejected() {
    let server = FakeServer::new(json!({}));
    let _client = start(&server, |options| options).await;

    let ok = server
        .request(
            "client/registerCapability",
            json!({ "registrations": [{ "id": "save", "method": "textDocument/didSave" }] }),
        )
        .await;
    assert!(ok["result"].is_null(), "{ok}");

    let rejected = server
        .request(
            "client/registerCapability",
            json!({ "registrations": [{ "id": "x", "method": "textDocument/madeUp" }] }),
        )
        .await;
    assert!(rejected["error"]["message"].as_str().unwrap().contains("textDocument/madeUp"));
}

#[tokio::test]
async fn workspace_requests_are_answered_from_the_host() {
    let server = FakeServer::new(json!({}));
    let workspace = Arc::new(tether_lsp::MemoryWorkspace::new(Some("/ws".into())));
    workspace.set_settings(json!({ "xml": { "trace": "verbose" } }));
    let _client = start(&server, |options| {
        let mut options = options.with_workspace(workspace.clone());
        options.configuration_section = vec!["xml".into()];
        options
    })
    .await;

    let changed = server.wait_for("workspace/didChangeConfiguration", 1).await;
    assert_eq!(changed[0]["params"]["settings"], json!({ "xml": { "trace": "verbose" } }));

    let configuration = server
        .request(
            "workspace/configuration",
            json!({ "items": [{ "section": "xml.trace" }, { "section": "nope" }] }),
        )
        .await;
    assert_eq!(configuration["result"], json!(["verbose", null]));

    let folders = server.request("workspace/workspaceFolders", json!(null)).await;
    assert_eq!(folders["result"][0]["uri"], "file:///ws");
    assert_eq!(folders["result"][0]["name"], "ws");
    assert_eq!(
        server.messages("initialize")[0]["params"]["rootUri"],
        "file:///ws"
    );
}
