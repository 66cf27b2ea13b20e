//! Chooses the one handler an email belongs to.

use std::fmt;

use tracing::info;

use crate::handlers::{EmailHandlers, HandlerError};
use crate::normalize::CanonicalEmail;

pub const DEFAULT_ROOT_DOMAIN: &str = "assistance.chat";
pub const DEFAULT_FORWARDING_SENDER: &str = "forwarding-noreply@google.com";
pub const DEFAULT_FAQ_AGENT: &str = "jims-ac-faq";
pub const DEFAULT_REPLY_FORMATTER_PREFIX: &str = "reply-formatter";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub root_domain: String,
    pub forwarding_sender: String,
    pub faq_agent: String,
    pub reply_formatter_prefix: String,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            root_domain: DEFAULT_ROOT_DOMAIN.to_string(),
            forwarding_sender: DEFAULT_FORWARDING_SENDER.to_string(),
            faq_agent: DEFAULT_FAQ_AGENT.to_string(),
            reply_formatter_prefix: DEFAULT_REPLY_FORMATTER_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ForwardingVerification,
    FaqResponse,
    ReplyFormatter,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Addressed to a domain this deployment does not serve.
    ForeignDomain,
    /// Sent by one of our own agents; answering would loop.
    OwnDomainSender,
    NoHandler,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::ForwardingVerification => f.write_str("forwarding_verification"),
            Route::FaqResponse => f.write_str("faq_response"),
            Route::ReplyFormatter => f.write_str("reply_formatter"),
            Route::Ignored(reason) => write!(f, "ignored({})", reason),
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IgnoreReason::ForeignDomain => "foreign_domain",
            IgnoreReason::OwnDomainSender => "own_domain_sender",
            IgnoreReason::NoHandler => "no_handler",
        };
        f.write_str(label)
    }
}

/// Pure routing decision. The first matching rule wins.
pub fn route(email: &CanonicalEmail, policy: &DispatchPolicy) -> Route {
    if email.mail_from == policy.forwarding_sender {
        return Route::ForwardingVerification;
    }
    if email.agent_domain != policy.root_domain {
        return Route::Ignored(IgnoreReason::ForeignDomain);
    }
    if email.from.contains(&policy.root_domain) {
        return Route::Ignored(IgnoreReason::OwnDomainSender);
    }
    if email.agent_name == policy.faq_agent {
        return Route::FaqResponse;
    }
    if email.agent_name.starts_with(&policy.reply_formatter_prefix) {
        return Route::ReplyFormatter;
    }
    Route::Ignored(IgnoreReason::NoHandler)
}

/// Routes the email and runs the selected handler, if any.
pub async fn dispatch(
    email: &CanonicalEmail,
    policy: &DispatchPolicy,
    handlers: &dyn EmailHandlers,
) -> Result<Route, HandlerError> {
    let selected = route(email, policy);
    match selected {
        Route::ForwardingVerification => handlers.verify_forwarding(email).await?,
        Route::FaqResponse => handlers.respond_to_faq(email).await?,
        Route::ReplyFormatter => handlers.format_reply(email).await?,
        Route::Ignored(reason) => {
            info!(
                "[{}] no handler for {} ({})",
                email.user_email,
                email.agent_address(),
                reason
            );
        }
    }
    Ok(selected)
}
