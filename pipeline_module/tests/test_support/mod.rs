#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pipeline_module::service::{build_router, PipelineQueue};
use pipeline_module::{
    CanonicalEmail, ContentStore, DispatchPolicy, EmailHandlers, HandlerError,
    NotificationConfig, Pipeline, PipelineLedger, RawEmail,
};
use send_emails_module::{
    MailTransport, OutboundEmail, SendEmailError, SendEmailResponse,
};
use tempfile::TempDir;

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutboundEmail>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_email(
        &self,
        _scope: &str,
        email: &OutboundEmail,
    ) -> Result<SendEmailResponse, SendEmailError> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(SendEmailResponse::default())
    }
}

/// Records which handler saw which user. Reply formatting always fails.
#[derive(Default)]
pub struct RecordingHandlers {
    pub calls: Mutex<Vec<(String, String)>>,
}

impl RecordingHandlers {
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, handler: &str, email: &CanonicalEmail) {
        self.calls
            .lock()
            .unwrap()
            .push((handler.to_string(), email.user_email.clone()));
    }
}

#[async_trait]
impl EmailHandlers for RecordingHandlers {
    async fn verify_forwarding(&self, email: &CanonicalEmail) -> Result<(), HandlerError> {
        self.record("verify_forwarding", email);
        Ok(())
    }

    async fn respond_to_faq(&self, email: &CanonicalEmail) -> Result<(), HandlerError> {
        self.record("respond_to_faq", email);
        Ok(())
    }

    async fn format_reply(&self, email: &CanonicalEmail) -> Result<(), HandlerError> {
        self.record("format_reply", email);
        Err(HandlerError::MissingRequester)
    }
}

pub fn build_pipeline(
    temp: &TempDir,
    handlers: Arc<dyn EmailHandlers>,
    transport: Arc<dyn MailTransport>,
) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        ContentStore::new(temp.path().join("records").join("emails")),
        PipelineLedger::new(temp.path().join("pipelines").join("emails").join("new")),
        DispatchPolicy::default(),
        handlers,
        transport,
        NotificationConfig::for_domain("assistance.chat", vec!["ops@example.com".to_string()]),
    ))
}

pub struct TestApp {
    pub base_url: String,
    pub queue: PipelineQueue,
}

/// Serves the inbound router on an ephemeral local port.
pub async fn spawn_app(pipeline: Arc<Pipeline>) -> TestApp {
    let queue = PipelineQueue::start(pipeline.clone(), 16, 4);
    let app = build_router(
        Arc::new(pipeline.store().clone()),
        Arc::new(pipeline.ledger().clone()),
        queue.submitter(),
        1024 * 1024,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestApp {
        base_url: format!("http://{}", addr),
        queue,
    }
}

pub fn raw_email(value: serde_json::Value) -> RawEmail {
    serde_json::from_value(value).expect("json object")
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
