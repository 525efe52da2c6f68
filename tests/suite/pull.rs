//! Push and pull diagnostics through a running client.

use std::time::Duration;

use serde_json::json;

use tether_lsp::features::diagnostic::PullState;
use tether_lsp::{
    ClientEvent, DiagnosticSeverity, PullTrigger, TextDocumentChangeEvent,
    TextDocumentContentChangeEvent,
};

use crate::common::{FakeServer, Reply, error_report, eventually, start, xml};

fn pull_server() -> FakeServer {
    FakeServer::new(json!({
        "textDocumentSync": 2,
        "diagnosticProvider": { "interFileDependencies": false, "workspaceDiagnostics": false }
    }))
}

#[tokio::test]
async fn pushed_diagnostics_land_in_the_collection() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }));
    let client = start(&server, |options| options).await;
    let mut events = client.subscribe();

    server.notify(
        "textDocument/publishDiagnostics",
        json!({ "uri": "file:///ws/a.xml", "diagnostics": error_report("-", "pushed")["items"] }),
    );
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    let ClientEvent::Diagnostics { uri, items } = event else {
        panic!("expected diagnostics, got {event:?}");
    };
    assert_eq!(uri, "file:///ws/a.xml");
    assert_eq!(items[0].message(), "pushed");
    assert_eq!(client.diagnostics().get("file:///ws/a.xml")[0].severity(), DiagnosticSeverity::Error);

    server.notify(
        "textDocument/publishDiagnostics",
        json!({ "uri": "file:///ws/a.xml", "diagnostics": [] }),
    );
    eventually("cleared diagnostics", || !client.diagnostics().has("file:///ws/a.xml")).await;
}

#[tokio::test]
async fn opening_a_document_pulls_its_diagnostics() {
    let server = pull_server().respond("textDocument/diagnostic", |params, n| {
        assert_eq!(params["textDocument"]["uri"], "file:///ws/a.xml");
        Reply::Result(error_report(&format!("r{n}"), "missing root"))
    });
    let client = start(&server, |options| options).await;

    client.did_open(xml("a.xml", 1, "<a>")).await;
    eventually("pulled diagnostics", || client.diagnostics().has("file:///ws/a.xml")).await;
    assert_eq!(client.diagnostics().get("file:///ws/a.xml")[0].message(), "missing root");

    let pulls = client.pull_diagnostics();
    eventually("idle scheduler", || pulls.is_idle()).await;
    assert_eq!(
        pulls.tracker().result_id(PullState::Document, "file:///ws/a.xml"),
        Some("r1".to_string())
    );
}

#[tokio::test]
async fn changes_pull_again_with_the_previous_result_id() {
    let server = pull_server().respond("textDocument/diagnostic", |_, n| {
        if n == 1 {
            Reply::Result(error_report("r1", "first"))
        } else {
            Reply::Result(json!({ "kind": "unchanged", "resultId": "r1" }))
        }
    });
    let client = start(&server, |options| options).await;

    client.did_open(xml("a.xml", 1, "<a>")).await;
    server.wait_for("textDocument/diagnostic", 1).await;
    eventually("first report", || client.diagnostics().has("file:///ws/a.xml")).await;

    client
        .did_change(TextDocumentChangeEvent {
            document: xml("a.xml", 2, "<a></a>"),
            content_changes: vec![TextDocumentContentChangeEvent::full("<a></a>")],
        })
        .await;
    let pulls = server.wait_for("textDocument/diagnostic", 2).await;
    assert_eq!(pulls[1]["params"]["previousResultId"], "r1");

    eventually("idle scheduler", || client.pull_diagnostics().is_idle()).await;
    // An unchanged report keeps what the first pull produced.
    assert_eq!(client.diagnostics().get("file:///ws/a.xml")[0].message(), "first");
}

#[tokio::test]
async fn one_edit_causes_exactly_one_more_pull() {
    let server = pull_server().respond("textDocument/diagnostic", |_, n| {
        Reply::Result(error_report(&format!("r{n}"), &format!("pull {n}")))
    });
    let client = start(&server, |options| options).await;
    let pulls = client.pull_diagnostics();

    client.did_open(xml("a.xml", 1, "<a>")).await;
    server.wait_for("textDocument/diagnostic", 1).await;
    eventually("first pull applied", || {
        pulls.tracker().result_id(PullState::Document, "file:///ws/a.xml") == Some("r1".into())
    })
    .await;

    client
        .did_change(TextDocumentChangeEvent {
            document: xml("a.xml", 2, "<a/>"),
            content_changes: vec![TextDocumentContentChangeEvent::full("<a/>")],
        })
        .await;
    eventually("second pull applied", || {
        pulls.tracker().result_id(PullState::Document, "file:///ws/a.xml") == Some("r2".into())
    })
    .await;
    eventually("idle scheduler", || pulls.is_idle()).await;
    assert_eq!(server.messages("textDocument/diagnostic").len(), 2);
    assert_eq!(client.diagnostics().get("file:///ws/a.xml")[0].message(), "pull 2");
}

#[tokio::test]
async fn filter_and_ignore_globs_skip_pulls() {
    let server = pull_server().respond("textDocument/diagnostic", |_, n| {
        Reply::Result(error_report(&format!("r{n}"), "x"))
    });
    let client = start(&server, |mut options| {
        options.diagnostic_pull.ignored = vec!["/ws/generated/**".into()];
        options.with_diagnostic_filter(|_, trigger| trigger == PullTrigger::OnType)
    })
    .await;

    client.did_open(xml("generated/out.xml", 1, "<a/>")).await;
    client.did_open(xml("a.xml", 1, "<a/>")).await;
    let pulls = server.wait_for("textDocument/diagnostic", 1).await;
    assert_eq!(pulls[0]["params"]["textDocument"]["uri"], "file:///ws/a.xml");
    eventually("idle scheduler", || client.pull_diagnostics().is_idle()).await;

    // Typing is filtered out, so no second pull.
    client
        .did_change(TextDocumentChangeEvent {
            document: xml("a.xml", 2, "<b/>"),
            content_changes: vec![TextDocumentContentChangeEvent::full("<b/>")],
        })
        .await;
    server.wait_for("textDocument/didChange", 1).await;
    eventually("idle scheduler", || client.pull_diagnostics().is_idle()).await;
    assert_eq!(server.messages("textDocument/diagnostic").len(), 1);
}

#[tokio::test]
async fn refresh_requests_pull_open_documents_again() {
    let server = pull_server().respond("textDocument/diagnostic", |_, n| {
        Reply::Result(error_report(&format!("r{n}"), &format!("pull {n}")))
    });
    let client = start(&server, |options| options).await;

    client.did_open(xml("a.xml", 1, "<a/>")).await;
    server.wait_for("textDocument/diagnostic", 1).await;
    eventually("idle scheduler", || client.pull_diagnostics().is_idle()).await;

    let response = server.request("workspace/diagnostic/refresh", json!(null)).await;
    assert!(response["result"].is_null());
    server.wait_for("textDocument/diagnostic", 2).await;
    eventually("second report", || {
        client
            .diagnostics()
            .get("file:///ws/a.xml")
            .first()
            .is_some_and(|d| d.message() == "pull 2")
    })
    .await;
}

#[tokio::test]
async fn closing_a_document_drops_its_diagnostics() {
    let server = pull_server().respond("textDocument/diagnostic", |_, _| {
        Reply::Result(error_report("r1", "broken"))
    });
    let client = start(&server, |options| options).await;

    client.did_open(xml("a.xml", 1, "<a>")).await;
    eventually("pulled diagnostics", || client.diagnostics().has("file:///ws/a.xml")).await;

    client.did_close(xml("a.xml", 1, "<a>")).await;
    assert!(!client.diagnostics().has("file:///ws/a.xml"));
    assert!(
        !client
            .pull_diagnostics()
            .tracker()
            .tracks(PullState::Document, "file:///ws/a.xml")
    );
}

#[tokio::test]
async fn a_pull_in_flight_at_close_is_discarded() {
    let server = pull_server().respond("textDocument/diagnostic", |_, n| {
        if n == 1 {
            Reply::Delayed(Duration::from_millis(200), error_report("r1", "stale"))
        } else {
            Reply::Result(error_report(&format!("r{n}"), "fresh"))
        }
    });
    let client = start(&server, |options| options).await;
    let pulls = client.pull_diagnostics();

    client.did_open(xml("a.xml", 1, "<a>")).await;
    server.wait_for("textDocument/diagnostic", 1).await;
    client.did_close(xml("a.xml", 1, "<a>")).await;
    client.did_open(xml("a.xml", 1, "<a>")).await;

    let requests = server.wait_for("textDocument/diagnostic", 2).await;
    assert!(requests[1]["params"].get("previousResultId").is_none(), "{}", requests[1]);
    assert_eq!(server.messages("$/cancelRequest").len(), 1);

    // Let the held reply arrive; it must not override the fresh pull.
    tokio::time::sleep(Duration::from_millis(300)).await;
    eventually("idle scheduler", || pulls.is_idle()).await;
    assert_eq!(
        pulls.tracker().result_id(PullState::Document, "file:///ws/a.xml"),
        Some("r2".to_string())
    );
    assert_eq!(client.diagnostics().get("file:///ws/a.xml")[0].message(), "fresh");
}

#[tokio::test]
async fn dynamic_registration_enables_pulls() {
    let server = FakeServer::new(json!({ "textDocumentSync": 1 }))
        .respond("textDocument/diagnostic", |_, _| Reply::Result(error_report("r1", "late")));
    let client = start(&server, |options| options).await;

    client.did_open(xml("a.xml", 1, "<a>")).await;
    server.wait_for("textDocument/didOpen", 1).await;
    assert!(server.messages("textDocument/diagnostic").is_empty());

    server
        .request(
            "client/registerCapability",
            json!({ "registrations": [{
                "id": "pull",
                "method": "textDocument/diagnostic",
                "registerOptions": {
                    "documentSelector": [{ "language": "xml" }],
                    "interFileDependencies": false,
                    "workspaceDiagnostics": false
                }
            }]}),
        )
        .await;
    server.wait_for("textDocument/diagnostic", 1).await;
    eventually("pulled diagnostics", || client.diagnostics().has("file:///ws/a.xml")).await;
}

#[tokio::test]
async fn workspace_pull_reports_unopened_files() {
    let server = FakeServer::new(json!({
        "diagnosticProvider": { "interFileDependencies": true, "workspaceDiagnostics": true }
    }))
    .respond("workspace/diagnostic", |params, n| {
        if n > 1 {
            return Reply::Silent;
        }
        assert!(params["partialResultToken"].is_string());
        Reply::Result(json!({ "items": [{
            "uri": "file:///ws/other.xml",
            "version": null,
            "kind": "full",
            "resultId": "w1",
            "items": error_report("w1", "elsewhere")["items"]
        }]}))
    });
    let client = start(&server, |mut options| {
        options.diagnostic_pull.workspace = true;
        options
    })
    .await;

    server.wait_for("workspace/diagnostic", 1).await;
    eventually("workspace report", || client.diagnostics().has("file:///ws/other.xml")).await;
    assert_eq!(client.diagnostics().get("file:///ws/other.xml")[0].message(), "elsewhere");
    client.stop().await.unwrap();
}
