//! Reply formatter: turns rough notes into a polished reply.
//!
//! Mail to `reply-formatter@<root>` comes back to the sender as a formatted
//! draft. FAQ supervision tasks carry a reply-to of the form
//! `reply-formatter===<local>==<domain>@<root>`; a reviewer's answer to one
//! goes straight to the encoded address instead.

use send_emails_module::OutboundEmail;
use tracing::info;

use crate::context::ServiceContext;
use crate::normalize::CanonicalEmail;

use super::{reply_reference, reply_subject, HandlerError, SUPERVISION_SUBJECT_FLAG};

const FORMAT_PROMPT: &str = "You turn rough notes into a clear, friendly email \
reply. Keep every fact from the notes and add none. Respond with the email body \
only, without a subject line.";

const TARGET_SEPARATOR: &str = "===";

/// Formatter address that delivers a reviewer's answer to `target`.
pub(super) fn encode_target(prefix: &str, target: &str, domain: &str) -> String {
    format!(
        "{}{}{}@{}",
        prefix,
        TARGET_SEPARATOR,
        target.replace('@', "=="),
        domain
    )
}

/// Address encoded in an agent name such as `reply-formatter===jo==example.com`.
pub(super) fn encoded_target(agent_name: &str) -> Option<String> {
    let (_, encoded) = agent_name.split_once(TARGET_SEPARATOR)?;
    let (local, domain) = encoded.split_once("==")?;
    if local.is_empty() || domain.is_empty() || domain.contains("==") {
        return None;
    }
    Some(format!("{}@{}", local, domain))
}

/// Subject for the formatted reply, without any supervision flag.
fn formatted_subject(subject: &str) -> String {
    match subject.split_once(SUPERVISION_SUBJECT_FLAG) {
        Some((_, rest)) => reply_subject(rest),
        None => reply_subject(subject),
    }
}

pub(super) async fn format_reply(
    context: &ServiceContext,
    email: &CanonicalEmail,
) -> Result<(), HandlerError> {
    let scope = email.user_email.as_str();
    if email.plain_all_content.trim().is_empty() {
        info!("[{}] empty email, nothing to format", scope);
        return Ok(());
    }

    let target = encoded_target(&email.agent_name);
    let draft = context
        .completion()
        .complete(FORMAT_PROMPT, &email.plain_all_content)
        .await?;

    let base_name = email
        .agent_name
        .split(TARGET_SEPARATOR)
        .next()
        .unwrap_or_default();
    let sender = format!("{}@{}", base_name, email.agent_domain);
    let reply = match target {
        Some(target) => {
            info!("[{}] sending reviewed answer to {}", scope, target);
            OutboundEmail::plain(
                sender,
                vec![target],
                formatted_subject(&email.subject),
                draft.trim(),
            )
        }
        None => {
            info!("[{}] sending formatted draft back to sender", scope);
            let mut reply = OutboundEmail::plain(
                sender,
                vec![email.user_email.clone()],
                formatted_subject(&email.subject),
                draft.trim(),
            );
            reply.in_reply_to = reply_reference(email);
            reply
        }
    };
    context.transport().send_email(scope, &reply).await?;
    Ok(())
}
