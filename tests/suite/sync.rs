//! Document synchronization through a running client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::json;

use tether_lsp::{
    Middleware, MemoryWorkspace, Position, Range, TextDocument, TextDocumentChangeEvent,
    TextDocumentContentChangeEvent, TextDocumentSaveReason, WillSaveEvent,
};

use crate::common::{FakeServer, Reply, start, xml};

fn change(document: TextDocument, text: &str) -> TextDocumentChangeEvent {
    TextDocumentChangeEvent {
        content_changes: vec![TextDocumentContentChangeEvent::incremental(
            Range::new(Position::new(0, 1), Position::new(0, 2)),
            text,
        )],
        document,
    }
}

#[tokio::test]
async fn document_lifecycle_reaches_the_server_in_order() {
    let server = FakeServer::new(json!({
        "textDocumentSync": {
            "openClose": true,
            "change": 2,
            "willSave": true,
            "save": { "includeText": true }
        }
    }));
    let client = start(&server, |options| options).await;

    client.did_open(xml("a.xml", 1, "<a/>")).await;
    client.did_change(change(xml("a.xml", 2, "<b/>"), "b")).await;
    client
        .will_save(WillSaveEvent {
            document: xml("a.xml", 2, "<b/>"),
            reason: TextDocumentSaveReason::Manual,
        })
        .await;
    client.did_save(xml("a.xml", 2, "<b/>")).await;
    client.did_close(xml("a.xml", 2, "<b/>")).await;
    server.wait_for("textDocument/didClose", 1).await;

    let sync: Vec<String> = server
        .methods()
        .into_iter()
        .filter(|m| m.starts_with("textDocument/"))
        .collect();
    assert_eq!(
        sync,
        [
            "textDocument/didOpen",
            "textDocument/didChange",
            "textDocument/willSave",
            "textDocument/didSave",
            "textDocument/didClose",
        ]
    );

    let open = &server.messages("textDocument/didOpen")[0]["params"]["textDocument"];
    assert_eq!(open["languageId"], "xml");
    assert_eq!(open["text"], "<a/>");
    let changed = &server.messages("textDocument/didChange")[0]["params"];
    assert_eq!(changed["textDocument"]["version"], 2);
    assert_eq!(changed["contentChanges"][0]["text"], "b");
    assert_eq!(server.messages("textDocument/willSave")[0]["params"]["reason"], 1);
    assert_eq!(server.messages("textDocument/didSave")[0]["params"]["text"], "<b/>");
}

#[tokio::test]
async fn full_sync_sends_the_whole_text() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }));
    let client = start(&server, |options| options).await;

    client.did_open(xml("a.xml", 1, "<a/>")).await;
    client.did_change(change(xml("a.xml", 2, "<abc/>"), "bc")).await;

    let changes = server.wait_for("textDocument/didChange", 1).await;
    let content = &changes[0]["params"]["contentChanges"];
    assert_eq!(content, &json!([{ "text": "<abc/>" }]));
}

#[tokio::test]
async fn client_selector_limits_synced_documents() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }));
    let client = start(&server, |options| {
        options.with_document_selector(serde_json::from_value(json!(["xml"])).unwrap())
    })
    .await;

    client
        .did_open(TextDocument::new("file:///ws/a.json", "json", 1, "{}"))
        .await;
    client.did_open(xml("b.xml", 1, "<b/>")).await;

    let opens = server.wait_for("textDocument/didOpen", 1).await;
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0]["params"]["textDocument"]["uri"], "file:///ws/b.xml");
}

#[tokio::test]
async fn dynamic_registration_opens_matching_documents() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |options| options).await;

    // Nothing is registered yet, so nothing is sent.
    client.did_open(xml("a.xml", 1, "<a/>")).await;
    client
        .did_open(TextDocument::new("file:///ws/a.json", "json", 1, "{}"))
        .await;
    assert!(server.messages("textDocument/didOpen").is_empty());

    let response = server
        .request(
            "client/registerCapability",
            json!({ "registrations": [
                { "id": "open", "method": "textDocument/didOpen",
                  "registerOptions": { "documentSelector": [{ "language": "xml" }] } },
                { "id": "close", "method": "textDocument/didClose",
                  "registerOptions": { "documentSelector": [{ "language": "xml" }] } }
            ]}),
        )
        .await;
    assert!(response["result"].is_null(), "{response}");

    let opens = server.wait_for("textDocument/didOpen", 1).await;
    assert_eq!(opens[0]["params"]["textDocument"]["uri"], "file:///ws/a.xml");

    // Dropping the close registration closes what it covered.
    server
        .request(
            "client/unregisterCapability",
            json!({ "unregisterations": [{ "id": "close", "method": "textDocument/didClose" }] }),
        )
        .await;
    let closes = server.wait_for("textDocument/didClose", 1).await;
    assert_eq!(closes[0]["params"]["textDocument"]["uri"], "file:///ws/a.xml");
    assert_eq!(server.messages("textDocument/didOpen").len(), 1);
}

#[tokio::test]
async fn server_selectors_stay_within_the_client_filter() {
    let server = FakeServer::new(json!({}));
    let client = start(&server, |mut options| {
        options.ignored_documents = vec!["/ws/generated/**".into()];
        options.with_document_selector(serde_json::from_value(json!(["xml"])).unwrap())
    })
    .await;

    client
        .did_open(TextDocument::new("file:///ws/a.json", "json", 1, "{}"))
        .await;
    client.did_open(xml("generated/out.xml", 1, "<g/>")).await;
    client.did_open(xml("a.xml", 1, "<a/>")).await;

    server
        .request(
            "client/registerCapability",
            json!({ "registrations": [{
                "id": "open",
                "method": "textDocument/didOpen",
                "registerOptions": { "documentSelector": [{ "scheme": "file" }] }
            }]}),
        )
        .await;
    let opens = server.wait_for("textDocument/didOpen", 1).await;
    assert_eq!(opens[0]["params"]["textDocument"]["uri"], "file:///ws/a.xml");

    client
        .did_open(TextDocument::new("file:///ws/b.json", "json", 1, "{}"))
        .await;
    client.send_notification("custom/barrier", None).await.unwrap();
    server.wait_for("custom/barrier", 1).await;
    assert_eq!(server.messages("textDocument/didOpen").len(), 1);
}

#[tokio::test]
async fn delayed_opens_wait_until_visible() {
    let server = FakeServer::new(json!({ "textDocumentSync": 2 }));
    let workspace = Arc::new(MemoryWorkspace::new(Some("/ws".into())));
    let client = start(&server, |mut options| {
        options.delay_open_notifications = true;
        options.with_workspace(workspace.clone())
    })
    .await;

    let hidden = xml("hidden.xml", 1, "<h/>");
    workspace.open(hidden.clone());
    workspace.hide(hidden.uri());
    client.did_open(hidden).await;
    client.did_change(change(xml("hidden.xml", 2, "<hx/>"), "x")).await;

    let visible = xml("shown.xml", 1, "<s/>");
    workspace.open(visible.clone());
    client.did_open(visible).await;

    let opens = server.wait_for("textDocument/didOpen", 1).await;
    assert_eq!(opens[0]["params"]["textDocument"]["uri"], "file:///ws/shown.xml");
    assert!(server.messages("textDocument/didChange").is_empty());

    workspace.show("file:///ws/hidden.xml");
    client
        .did_change_visible(&["file:///ws/hidden.xml".to_string()])
        .await;
    let opens = server.wait_for("textDocument/didOpen", 2).await;
    let reopened = &opens[1]["params"]["textDocument"];
    assert_eq!(reopened["uri"], "file:///ws/hidden.xml");
    assert_eq!(reopened["version"], 2);
    assert_eq!(reopened["text"], "<hx/>");
}

#[tokio::test]
async fn flushing_sends_every_delayed_open() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }));
    let workspace = Arc::new(MemoryWorkspace::new(Some("/ws".into())));
    let client = start(&server, |mut options| {
        options.delay_open_notifications = true;
        options.with_workspace(workspace.clone())
    })
    .await;

    for name in ["b.xml", "a.xml"] {
        let document = xml(name, 1, "<x/>");
        workspace.open(document.clone());
        workspace.hide(document.uri());
        client.did_open(document).await;
    }
    assert!(server.messages("textDocument/didOpen").is_empty());

    client.flush_pending_opens().await;
    let opens = server.wait_for("textDocument/didOpen", 2).await;
    let uris: Vec<&str> = opens
        .iter()
        .map(|m| m["params"]["textDocument"]["uri"].as_str().unwrap())
        .collect();
    assert_eq!(uris, ["file:///ws/b.xml", "file:///ws/a.xml"]);
}

#[tokio::test]
async fn middleware_can_veto_an_open() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }));
    let middleware = Middleware::default().did_open(|document, next| {
        if document.uri().ends_with("secret.xml") {
            async { Ok(()) }.boxed()
        } else {
            next(document)
        }
    });
    let client = start(&server, |options| options.with_middleware(middleware)).await;

    client.did_open(xml("secret.xml", 1, "<s/>")).await;
    client.did_change(change(xml("secret.xml", 2, "<t/>"), "t")).await;
    client.did_open(xml("public.xml", 1, "<p/>")).await;

    let opens = server.wait_for("textDocument/didOpen", 1).await;
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0]["params"]["textDocument"]["uri"], "file:///ws/public.xml");
    assert!(server.messages("textDocument/didChange").is_empty());
}

#[tokio::test]
async fn changes_wait_for_a_slow_open_hook() {
    let server = FakeServer::new(json!({ "textDocumentSync": 2 }));
    let middleware = Middleware::default().did_open(|document, next| {
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            next(document).await
        }
        .boxed()
    });
    let client = start(&server, |options| options.with_middleware(middleware)).await;

    let opening = tokio::spawn({
        let client = client.clone();
        async move { client.did_open(xml("a.xml", 1, "<a/>")).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    client.did_change(change(xml("a.xml", 2, "<b/>"), "b")).await;
    opening.await.unwrap();

    server.wait_for("textDocument/didChange", 1).await;
    let sync: Vec<String> = server
        .methods()
        .into_iter()
        .filter(|m| m.starts_with("textDocument/"))
        .collect();
    assert_eq!(sync, ["textDocument/didOpen", "textDocument/didChange"]);
    let open = &server.messages("textDocument/didOpen")[0]["params"]["textDocument"];
    assert_eq!(open["version"], 1);
    let changed = &server.messages("textDocument/didChange")[0]["params"]["textDocument"];
    assert_eq!(changed["version"], 2);
}

#[tokio::test]
async fn a_vetoed_open_drops_queued_changes() {
    let server = FakeServer::new(json!({ "textDocumentSync": 2 }));
    let middleware = Middleware::default().did_open(|_document, _next| {
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
        .boxed()
    });
    let client = start(&server, |options| options.with_middleware(middleware)).await;

    let opening = tokio::spawn({
        let client = client.clone();
        async move { client.did_open(xml("a.xml", 1, "<a/>")).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    client.did_change(change(xml("a.xml", 2, "<b/>"), "b")).await;
    opening.await.unwrap();

    // Writes are ordered, so anything sent earlier arrives before this.
    client.send_notification("custom/barrier", None).await.unwrap();
    server.wait_for("custom/barrier", 1).await;
    assert!(server.messages("textDocument/didOpen").is_empty());
    assert!(server.messages("textDocument/didChange").is_empty());
}

#[tokio::test]
async fn will_save_wait_until_returns_server_edits() {
    let server = FakeServer::new(json!({
        "textDocumentSync": { "openClose": true, "change": 1, "willSaveWaitUntil": true }
    }))
    .respond("textDocument/willSaveWaitUntil", |_, _| {
        Reply::Result(json!([{
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 0 } },
            "newText": "<?xml version=\"1.0\"?>\n"
        }]))
    });
    let client = start(&server, |options| options).await;
    client.did_open(xml("a.xml", 1, "<a/>")).await;

    let edits = client
        .will_save_wait_until(WillSaveEvent {
            document: xml("a.xml", 1, "<a/>"),
            reason: TextDocumentSaveReason::Manual,
        })
        .await;
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].new_text, "<?xml version=\"1.0\"?>\n");
}
