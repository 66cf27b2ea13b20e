//! Gmail forwarding confirmation.
//!
//! When a user adds an agent address as a Gmail forwarding target, Google
//! mails the agent a confirmation link. Following it approves the forward.

use send_emails_module::OutboundEmail;
use tracing::info;

use crate::addresses::clean_email_address;
use crate::context::ServiceContext;
use crate::normalize::CanonicalEmail;

use super::HandlerError;

pub const DEFAULT_VERIFICATION_BASE_URL: &str = "https://mail.google.com";

const VERIFICATION_LINK_PREFIXES: [&str; 2] = [
    "https://mail.google.com/mail/vf-",
    "https://mail-settings.google.com/mail/vf-",
];

/// Token from the last confirmation link line in `body`.
pub fn find_verification_token(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            VERIFICATION_LINK_PREFIXES
                .iter()
                .find_map(|prefix| line.strip_prefix(prefix))
        })
        .map(|token| token.split_whitespace().next().unwrap_or_default().to_string())
        .filter(|token| !token.is_empty())
        .last()
}

pub(super) async fn verify_forwarding(
    context: &ServiceContext,
    base_url: &str,
    email: &CanonicalEmail,
) -> Result<(), HandlerError> {
    let scope = email.user_email.as_str();
    let token = find_verification_token(&email.plain_no_replies)
        .ok_or(HandlerError::MissingVerificationLink)?;

    let url = format!("{}/mail/vf-{}", base_url, token);
    info!("[{}] confirming forwarding via {}", scope, url);
    let response = context.http().post(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(HandlerError::VerificationRejected(status.as_u16()));
    }

    // Google's notice opens with the address that asked to forward.
    let requester = email
        .plain_no_replies
        .split_whitespace()
        .next()
        .map(clean_email_address)
        .filter(|value| value.contains('@'))
        .ok_or(HandlerError::MissingRequester)?;
    info!("[{}] forwarding requested by {}", scope, requester);

    let forwarding_address = clean_email_address(&email.to);
    let notice = OutboundEmail::plain(
        forwarding_address.clone(),
        vec![requester],
        "Email forwarding approved",
        format!(
            "Hi!\n\nWe've approved your ability to forward emails through to {}.",
            forwarding_address
        ),
    );
    context.transport().send_email(scope, &notice).await?;
    Ok(())
}
