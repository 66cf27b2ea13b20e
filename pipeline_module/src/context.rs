//! Long-lived collaborators shared by the driver and the handlers.

use std::sync::Arc;

use reqwest::Client;
use send_emails_module::{MailTransport, PostalClient};
use tracing::info;

use crate::completion::CompletionClient;
use crate::service::{BoxError, ServiceConfig};

/// Opened once at startup and passed around by `Arc`.
pub struct ServiceContext {
    http: Client,
    transport: Arc<dyn MailTransport>,
    completion: CompletionClient,
}

impl ServiceContext {
    pub fn open(config: &ServiceConfig) -> Result<Self, BoxError> {
        let http = Client::builder().timeout(config.http_timeout).build()?;
        let transport: Arc<dyn MailTransport> = Arc::new(PostalClient::new(
            http.clone(),
            config.postal_api_url.clone(),
            config.postal_api_key.clone(),
        ));
        let completion = CompletionClient::new(
            http.clone(),
            config.openai_api_url.clone(),
            config.completion_model.clone(),
            config.openai_api_key.clone(),
        );
        info!(
            "service context opened: postal={}, model={}",
            config.postal_api_url,
            completion.model()
        );
        Ok(Self::from_parts(http, transport, completion))
    }

    pub fn from_parts(
        http: Client,
        transport: Arc<dyn MailTransport>,
        completion: CompletionClient,
    ) -> Self {
        Self {
            http,
            transport,
            completion,
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn transport(&self) -> Arc<dyn MailTransport> {
        self.transport.clone()
    }

    pub fn completion(&self) -> &CompletionClient {
        &self.completion
    }

    /// Connections are pooled inside the client; closing only marks the end
    /// of the context's lifetime in the logs.
    pub fn close(&self) {
        info!("service context closed");
    }
}
