//! Outbound mail through the Postal HTTP API.
//!
//! Callers build an [`OutboundEmail`] and hand it to a [`MailTransport`].
//! [`PostalClient`] is the production transport; tests substitute their own.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

const SEND_MESSAGE_PATH: &str = "/api/v1/send/message";

#[derive(Debug, thiserror::Error)]
pub enum SendEmailError {
    #[error("missing Postal API key")]
    MissingApiKey,
    #[error("email has no recipients")]
    NoRecipients,
    #[error("email has neither a plain nor an html body")]
    MissingBody,
    #[error("postal rejected message (status {status}): {message}")]
    Rejected { status: String, message: String },
    #[error("postal http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundAttachment {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub plain_body: Option<String>,
    pub html_body: Option<String>,
    pub reply_to: Option<String>,
    pub in_reply_to: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
}

impl OutboundEmail {
    pub fn plain(
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            subject: subject.into(),
            plain_body: Some(body.into()),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), SendEmailError> {
        if self.to.iter().all(|value| value.trim().is_empty()) {
            return Err(SendEmailError::NoRecipients);
        }
        let has_plain = self.plain_body.as_deref().is_some_and(|v| !v.is_empty());
        let has_html = self.html_body.as_deref().is_some_and(|v| !v.is_empty());
        if !has_plain && !has_html {
            return Err(SendEmailError::MissingBody);
        }
        Ok(())
    }
}

/// Receipt returned by the transport once the provider accepted a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendEmailResponse {
    pub message_id: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// `scope` only labels log lines (usually the user address or a digest).
    async fn send_email(
        &self,
        scope: &str,
        email: &OutboundEmail,
    ) -> Result<SendEmailResponse, SendEmailError>;
}

#[derive(Debug, Serialize)]
struct PostalMessage<'a> {
    from: &'a str,
    to: &'a [String],
    #[serde(skip_serializing_if = "is_empty_list")]
    cc: &'a [String],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plain_body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html_body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<&'static str, &'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<PostalAttachment>,
}

fn is_empty_list(values: &&[String]) -> bool {
    values.is_empty()
}

#[derive(Debug, Serialize)]
struct PostalAttachment {
    name: String,
    content_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct PostalResponse {
    status: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl<'a> PostalMessage<'a> {
    fn from_email(email: &'a OutboundEmail) -> Self {
        let mut headers = BTreeMap::new();
        if let Some(in_reply_to) = email.in_reply_to.as_deref().filter(|v| !v.trim().is_empty()) {
            headers.insert("In-Reply-To", in_reply_to);
            headers.insert("References", in_reply_to);
        }
        let attachments = email
            .attachments
            .iter()
            .map(|attachment| PostalAttachment {
                name: attachment.name.clone(),
                content_type: mime_guess::from_path(&attachment.name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
                data: BASE64_STANDARD.encode(&attachment.data),
            })
            .collect();
        Self {
            from: &email.from,
            to: &email.to,
            cc: &email.cc,
            subject: &email.subject,
            plain_body: email.plain_body.as_deref().filter(|v| !v.is_empty()),
            html_body: email.html_body.as_deref().filter(|v| !v.is_empty()),
            reply_to: email.reply_to.as_deref().filter(|v| !v.trim().is_empty()),
            headers,
            attachments,
        }
    }
}

/// Postal `send/message` client. Shares the caller's `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct PostalClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl PostalClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            api_key: api_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, SEND_MESSAGE_PATH)
    }
}

#[async_trait]
impl MailTransport for PostalClient {
    async fn send_email(
        &self,
        scope: &str,
        email: &OutboundEmail,
    ) -> Result<SendEmailResponse, SendEmailError> {
        email.validate()?;
        let api_key = self.api_key.as_deref().ok_or(SendEmailError::MissingApiKey)?;
        let message = PostalMessage::from_email(email);

        info!(
            "[{}] sending email from={} to={:?} subject={:?}",
            scope, email.from, email.to, email.subject
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("X-Server-API-Key", api_key)
            .json(&message)
            .send()
            .await?;
        let http_status = response.status();
        let body: PostalResponse = response.json().await?;

        if !http_status.is_success() || body.status != "success" {
            let message = body
                .data
                .get("message")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(SendEmailError::Rejected {
                status: body.status,
                message,
            });
        }

        let message_id = body
            .data
            .get("message_id")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        info!("[{}] postal accepted message_id={}", scope, message_id);
        Ok(SendEmailResponse { message_id })
    }
}
