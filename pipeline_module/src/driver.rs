//! Runs one stored email through the pipeline and sweeps unfinished ones.
//!
//! A pending marker is cleared only after the email has been handled
//! without error. Anything that fails leaves the marker behind, so
//! [`Pipeline::rerun`] can pick the email up again later.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use send_emails_module::{MailTransport, OutboundAttachment, OutboundEmail};
use tracing::{debug, error, info, warn};

use crate::content_store::{canonical_json, ContentStore, ContentStoreError};
use crate::context::ServiceContext;
use crate::dispatch::{dispatch, DispatchPolicy, Route};
use crate::handlers::{AgentHandlers, EmailHandlers, FaqSupervision, HandlerError};
use crate::normalize::{normalize, NormalizeError};
use crate::pipeline_ledger::{LedgerError, PipelineLedger};
use crate::service::ServiceConfig;
use crate::RawEmail;

const LEGACY_WEBHOOK_KEYS: [&str; 3] = ["body-plain", "stripped-text", "event-data"];

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("content store: {0}")]
    Store(#[from] ContentStoreError),
    #[error("pipeline ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("normalize: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    EmptyPayload,
    /// Webhook shape of the previous mail provider.
    LegacyShape,
    MissingRecipient,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DropReason::EmptyPayload => "empty payload",
            DropReason::LegacyShape => "legacy webhook shape",
            DropReason::MissingRecipient => "missing rcpt_to",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed(Route),
    ForeignDomain,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RerunReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RerunReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub from: String,
    pub operators: Vec<String>,
}

impl NotificationConfig {
    pub fn for_domain(root_domain: &str, operators: Vec<String>) -> Self {
        Self {
            from: format!("error-notification@{}", root_domain),
            operators,
        }
    }
}

/// Best-effort JSON rendering of a payload, used in operator notifications.
pub fn render_payload_json(raw: &RawEmail) -> String {
    canonical_json(raw)
}

fn guard(raw: &RawEmail) -> Option<DropReason> {
    if raw.is_empty() {
        return Some(DropReason::EmptyPayload);
    }
    if LEGACY_WEBHOOK_KEYS.iter().any(|key| raw.contains_key(*key)) {
        return Some(DropReason::LegacyShape);
    }
    match raw.get("rcpt_to") {
        None | Some(serde_json::Value::Null) => Some(DropReason::MissingRecipient),
        Some(_) => None,
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}

pub struct Pipeline {
    store: ContentStore,
    ledger: PipelineLedger,
    policy: DispatchPolicy,
    handlers: Arc<dyn EmailHandlers>,
    transport: Arc<dyn MailTransport>,
    notifications: NotificationConfig,
}

impl Pipeline {
    pub fn new(
        store: ContentStore,
        ledger: PipelineLedger,
        policy: DispatchPolicy,
        handlers: Arc<dyn EmailHandlers>,
        transport: Arc<dyn MailTransport>,
        notifications: NotificationConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            policy,
            handlers,
            transport,
            notifications,
        }
    }

    /// Production wiring: on-disk store and ledger, agent handlers.
    pub fn from_config(config: &ServiceConfig, context: Arc<ServiceContext>) -> Self {
        let transport = context.transport();
        let supervision = FaqSupervision {
            reviewers: config.faq_reviewers.clone(),
            reply_formatter_prefix: config.policy.reply_formatter_prefix.clone(),
        };
        let handlers: Arc<dyn EmailHandlers> = Arc::new(
            AgentHandlers::new(context, config.faq_dir()).with_supervision(supervision),
        );
        Self::new(
            ContentStore::new(config.records_dir()),
            PipelineLedger::new(config.new_emails_dir()),
            config.policy.clone(),
            handlers,
            transport,
            NotificationConfig::for_domain(
                &config.policy.root_domain,
                config.operator_emails.clone(),
            ),
        )
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn ledger(&self) -> &PipelineLedger {
        &self.ledger
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Runs a stored email and clears its marker once it is done.
    ///
    /// Failures keep the marker and, when `notify_on_error` is set, mail the
    /// operators before the error is returned.
    pub async fn handle_new_email(
        &self,
        digest: &str,
        raw: &RawEmail,
        notify_on_error: bool,
    ) -> Result<Outcome, PipelineError> {
        if let Some(reason) = guard(raw) {
            info!("[{}] dropping email: {}", digest, reason);
            match self.ledger.unmark(digest).await {
                Ok(()) => {}
                Err(LedgerError::NotPending(_)) => {
                    debug!("[{}] dropped email had no pending marker", digest);
                }
                Err(err) => return Err(err.into()),
            }
            return Ok(Outcome::Dropped(reason));
        }

        match self.process(digest, raw).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!("[{}] pipeline failed: {}", digest, err);
                if notify_on_error {
                    self.notify_error(digest, raw, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn process(&self, digest: &str, raw: &RawEmail) -> Result<Outcome, PipelineError> {
        let email = normalize(raw)?;

        if email.agent_domain != self.policy.root_domain {
            info!(
                "[{}] {} is outside {}, doing nothing",
                digest, email.rcpt_to, self.policy.root_domain
            );
            self.ledger.unmark(digest).await?;
            return Ok(Outcome::ForeignDomain);
        }

        info!(
            "[{}] email {} for {} (subject {:?}, {} attachment(s))",
            email.user_email,
            digest,
            email.agent_address(),
            email.subject,
            email.attachment_count
        );
        debug!("[{}] {:?}", email.user_email, email);

        let route = dispatch(&email, &self.policy, &*self.handlers).await?;
        self.ledger.unmark(digest).await?;
        info!("[{}] email {} completed via {}", email.user_email, digest, route);
        Ok(Outcome::Completed(route))
    }

    async fn notify_error(&self, digest: &str, raw: &RawEmail, err: &PipelineError) {
        if self.notifications.operators.is_empty() {
            warn!("[{}] no operators configured, error notification skipped", digest);
            return;
        }
        let payload_json = render_payload_json(raw);
        let body = format!(
            "When handling email {} at {} the following error occurred\n\n{}\n\nThe details of the email received were:\n\n{}",
            digest,
            Utc::now().to_rfc3339(),
            error_chain(err),
            payload_json
        );
        let mut notification = OutboundEmail::plain(
            self.notifications.from.clone(),
            self.notifications.operators.clone(),
            format!("[ERROR NOTIFICATION] {}", digest),
            body,
        );
        notification.attachments.push(OutboundAttachment {
            name: format!("{}.json", digest),
            data: payload_json.into_bytes(),
        });
        if let Err(send_err) = self.transport.send_email(digest, &notification).await {
            error!("[{}] error notification failed: {}", digest, send_err);
        }
    }

    /// Replays pending emails without notifying anyone.
    ///
    /// With a digest only that email is replayed. Otherwise every pending
    /// marker is replayed in random order. Emails without a marker and
    /// markers without a payload are skipped. A corrupt payload aborts the
    /// sweep.
    pub async fn rerun(&self, digest: Option<&str>) -> Result<RerunReport, PipelineError> {
        let digests = match digest {
            Some(digest) => vec![digest.to_string()],
            None => {
                let mut pending = self.ledger.list_pending().await?;
                pending.shuffle(&mut rand::thread_rng());
                pending
            }
        };
        if digests.is_empty() {
            info!("no pending emails to rerun");
        }

        let mut report = RerunReport::default();
        for digest in digests {
            if !self.ledger.is_pending(&digest).await? {
                warn!("[{}] email is not pending, skipping", digest);
                report.skipped += 1;
                continue;
            }
            let raw = match self.store.get(&digest).await {
                Ok(raw) => raw,
                Err(ContentStoreError::NotFound(_)) => {
                    warn!("[{}] pending email has no stored payload, skipping", digest);
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match self.handle_new_email(&digest, &raw, false).await {
                Ok(outcome) => {
                    info!("[{}] rerun finished: {:?}", digest, outcome);
                    report.completed += 1;
                }
                Err(err) => {
                    warn!("[{}] rerun failed: {}", digest, err);
                    report.failed += 1;
                }
            }
        }

        info!(
            "rerun done: {} completed, {} failed, {} skipped",
            report.completed, report.failed, report.skipped
        );
        Ok(report)
    }
}
