mod test_support;

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use test_support::{build_pipeline, spawn_app, wait_until, RecordingHandlers, RecordingTransport};

fn faq_question() -> Value {
    json!({
        "rcpt_to": "jims-ac-faq@assistance.chat",
        "to": "jims-ac-faq@assistance.chat",
        "from": "student@example.com",
        "mail_from": "student@example.com",
        "subject": "Entry requirements",
        "plain_body": "What are the entry requirements?",
        "html_body": null,
        "cc": null,
        "in_reply_to": null,
        "replies_from_plain_body": null,
        "attachments": []
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn posted_faq_email_reaches_handler_and_clears_marker() {
    let temp = TempDir::new().expect("tempdir");
    let handlers = Arc::new(RecordingHandlers::default());
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = build_pipeline(&temp, handlers.clone(), transport.clone());
    let app = spawn_app(pipeline.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/email", app.base_url))
        .json(&faq_question())
        .send()
        .await
        .expect("post email");
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.expect("json ack");
    assert_eq!(body, json!({"message": "Queued. Thank you."}));

    let handled = wait_until(|| {
        let handlers = handlers.clone();
        async move { !handlers.calls().is_empty() }
    })
    .await;
    assert!(handled, "faq handler never ran");
    assert_eq!(
        handlers.calls(),
        vec![("respond_to_faq".to_string(), "student@example.com".to_string())]
    );

    let ledger = pipeline.ledger().clone();
    let cleared = wait_until(|| {
        let ledger = ledger.clone();
        async move { ledger.list_pending().await.map(|p| p.is_empty()).unwrap_or(false) }
    })
    .await;
    assert!(cleared, "marker was not cleared");
    assert!(transport.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_email_keeps_marker_and_notifies_operators() {
    let temp = TempDir::new().expect("tempdir");
    let handlers = Arc::new(RecordingHandlers::default());
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = build_pipeline(&temp, handlers.clone(), transport.clone());
    let app = spawn_app(pipeline.clone()).await;

    let mut payload = faq_question();
    payload["rcpt_to"] = json!("reply-formatter@assistance.chat");
    payload["to"] = json!("reply-formatter@assistance.chat");
    let response = reqwest::Client::new()
        .post(format!("{}/email", app.base_url))
        .json(&payload)
        .send()
        .await
        .expect("post email");
    assert_eq!(response.status().as_u16(), 200);

    let notified = wait_until(|| {
        let transport = transport.clone();
        async move { !transport.sent().is_empty() }
    })
    .await;
    assert!(notified, "no error notification was sent");

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.starts_with("[ERROR NOTIFICATION] "));
    assert_eq!(pipeline.ledger().list_pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn non_object_bodies_are_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let pipeline = build_pipeline(
        &temp,
        Arc::new(RecordingHandlers::default()),
        Arc::new(RecordingTransport::default()),
    );
    let app = spawn_app(pipeline.clone()).await;
    let client = reqwest::Client::new();

    for body in ["not json", "[1, 2, 3]", "\"text\""] {
        let response = client
            .post(format!("{}/email", app.base_url))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("post email");
        assert_eq!(response.status().as_u16(), 400);
        let ack: Value = response.json().await.expect("json body");
        assert_eq!(ack, json!({"status": "bad_json"}));
    }
    assert!(pipeline.ledger().list_pending().await.unwrap().is_empty());

    let health = client
        .get(format!("{}/health", app.base_url))
        .send()
        .await
        .expect("health");
    assert_eq!(health.status().as_u16(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");
}
