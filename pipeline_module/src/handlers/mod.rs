//! Agent handlers invoked by the dispatcher.

mod faq;
mod forwarding;
mod reply_formatter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use send_emails_module::SendEmailError;

use crate::completion::CompletionError;
use crate::context::ServiceContext;
use crate::normalize::CanonicalEmail;

pub use faq::{FaqData, FaqEntry, FaqSupervision};
pub use forwarding::{find_verification_token, DEFAULT_VERIFICATION_BASE_URL};

/// Subject prefix of FAQ answers awaiting review.
pub const SUPERVISION_SUBJECT_FLAG: &str = "[SUPERVISION TASK]";

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no forwarding verification link in email body")]
    MissingVerificationLink,
    #[error("could not determine who requested forwarding")]
    MissingRequester,
    #[error("forwarding verification returned status {0}")]
    VerificationRejected(u16),
    #[error("faq data {path} could not be read: {source}")]
    FaqData {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("faq data {path} is invalid: {source}")]
    InvalidFaqData {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("model did not return a question list: {0}")]
    InvalidQuestionList(String),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Send(#[from] SendEmailError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait EmailHandlers: Send + Sync {
    async fn verify_forwarding(&self, email: &CanonicalEmail) -> Result<(), HandlerError>;
    async fn respond_to_faq(&self, email: &CanonicalEmail) -> Result<(), HandlerError>;
    async fn format_reply(&self, email: &CanonicalEmail) -> Result<(), HandlerError>;
}

/// Production handlers backed by the shared [`ServiceContext`].
pub struct AgentHandlers {
    context: Arc<ServiceContext>,
    faq_dir: PathBuf,
    supervision: FaqSupervision,
    verification_base_url: String,
}

impl AgentHandlers {
    pub fn new(context: Arc<ServiceContext>, faq_dir: impl Into<PathBuf>) -> Self {
        Self {
            context,
            faq_dir: faq_dir.into(),
            supervision: FaqSupervision::default(),
            verification_base_url: DEFAULT_VERIFICATION_BASE_URL.to_string(),
        }
    }

    pub fn with_supervision(mut self, supervision: FaqSupervision) -> Self {
        self.supervision = supervision;
        self
    }

    /// Points forwarding confirmations somewhere other than Gmail.
    pub fn with_verification_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.verification_base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmailHandlers for AgentHandlers {
    async fn verify_forwarding(&self, email: &CanonicalEmail) -> Result<(), HandlerError> {
        forwarding::verify_forwarding(&self.context, &self.verification_base_url, email).await
    }

    async fn respond_to_faq(&self, email: &CanonicalEmail) -> Result<(), HandlerError> {
        faq::respond_to_faq(&self.context, &self.faq_dir, &self.supervision, email).await
    }

    async fn format_reply(&self, email: &CanonicalEmail) -> Result<(), HandlerError> {
        reply_formatter::format_reply(&self.context, email).await
    }
}

/// `Re:` subject for a reply, without stacking prefixes.
pub(crate) fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return "Re: your email".to_string();
    }
    if trimmed
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"))
    {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

pub(crate) fn reply_reference(email: &CanonicalEmail) -> Option<String> {
    let message_id = email.message_id.trim();
    if message_id.is_empty() {
        None
    } else {
        Some(message_id.to_string())
    }
}
