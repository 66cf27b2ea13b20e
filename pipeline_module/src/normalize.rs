//! Conversion of a provider-shaped payload into a [`CanonicalEmail`].

use serde::Serialize;
use serde_json::Value;

use crate::addresses::clean_email_address;
use crate::html::html_to_text;
use crate::RawEmail;

const ESCAPED_RULE: &str = "\\-\\-\\-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be a string, found {found}")]
    InvalidField { field: &'static str, found: String },
    #[error("recipient `{0}` is not a single local@domain address")]
    InvalidRecipient(String),
}

/// Normalized, fixed-schema view of an inbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalEmail {
    pub from: String,
    pub to: String,
    pub cc: String,
    pub rcpt_to: String,
    pub mail_from: String,
    pub subject: String,
    pub in_reply_to: String,
    pub message_id: String,
    pub date: String,
    pub html_body: String,
    pub plain_no_replies: String,
    pub plain_replies_only: String,
    pub plain_all_content: String,
    pub agent_name: String,
    pub agent_domain: String,
    pub user_email: String,
    pub attachment_count: usize,
}

impl CanonicalEmail {
    /// The agent mailbox that received this email.
    pub fn agent_address(&self) -> String {
        format!("{}@{}", self.agent_name, self.agent_domain)
    }
}

pub fn normalize(raw: &RawEmail) -> Result<CanonicalEmail, NormalizeError> {
    let rcpt_to = required_text(raw, "rcpt_to")?;
    let to = required_text(raw, "to")?;
    let from = required_text(raw, "from")?;
    let mail_from = required_text(raw, "mail_from")?;

    let plain_no_replies = optional_text(raw, "plain_body");
    let plain_replies_only = optional_text(raw, "replies_from_plain_body");
    let html_body = optional_text(raw, "html_body");

    let plain_all_content = if html_body.trim().is_empty() {
        join_plain_content(&plain_no_replies, &plain_replies_only)
    } else {
        html_to_text(&html_body)
    }
    .replace(ESCAPED_RULE, "---");

    let (agent_name, agent_domain) = split_recipient(&rcpt_to)?;
    let user_email = resolve_user_email(&to, &rcpt_to, &from);

    let attachment_count = match raw.get("attachments") {
        Some(Value::Array(items)) => items.len(),
        _ => 0,
    };

    Ok(CanonicalEmail {
        cc: optional_text(raw, "cc"),
        subject: optional_text(raw, "subject"),
        in_reply_to: optional_text(raw, "in_reply_to"),
        message_id: optional_text(raw, "message_id"),
        date: optional_text(raw, "date"),
        from,
        to,
        rcpt_to,
        mail_from,
        html_body,
        plain_no_replies,
        plain_replies_only,
        plain_all_content,
        agent_name,
        agent_domain,
        user_email,
        attachment_count,
    })
}

/// Who the agent should treat as its correspondent.
///
/// When the visible `to` header names a different mailbox than the envelope
/// recipient, somebody forwarded the message into the agent's mailbox and
/// the original addressee is the user. Otherwise the sender is.
pub fn resolve_user_email(to: &str, rcpt_to: &str, from: &str) -> String {
    let cleaned_to = clean_email_address(to);
    let cleaned_rcpt_to = clean_email_address(rcpt_to);
    if cleaned_to != cleaned_rcpt_to {
        cleaned_to
    } else {
        clean_email_address(from)
    }
}

fn join_plain_content(plain: &str, replies: &str) -> String {
    if replies.is_empty() {
        plain.to_string()
    } else if plain.is_empty() {
        replies.to_string()
    } else {
        format!("{}\n\n{}", plain, replies)
    }
}

fn split_recipient(rcpt_to: &str) -> Result<(String, String), NormalizeError> {
    let trimmed = rcpt_to.trim();
    let mut parts = trimmed.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(domain), None) if !name.is_empty() && !domain.is_empty() => {
            Ok((name.to_lowercase(), domain.to_lowercase()))
        }
        _ => Err(NormalizeError::InvalidRecipient(rcpt_to.to_string())),
    }
}

fn required_text(raw: &RawEmail, field: &'static str) -> Result<String, NormalizeError> {
    match raw.get(field) {
        None | Some(Value::Null) => Err(NormalizeError::MissingField(field)),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => Err(NormalizeError::InvalidField {
            field,
            found: json_kind(other).to_string(),
        }),
    }
}

fn optional_text(raw: &RawEmail, field: &str) -> String {
    match raw.get(field) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(value)) => value.clone(),
        Some(other) => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
