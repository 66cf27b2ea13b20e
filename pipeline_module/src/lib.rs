pub mod addresses;
pub mod completion;
pub mod content_store;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod handlers;
pub mod normalize;
pub mod pipeline_ledger;
pub mod service;

mod html;

use std::collections::BTreeMap;

/// An inbound payload exactly as the mail provider delivered it.
pub type RawEmail = BTreeMap<String, serde_json::Value>;

pub use content_store::{ContentStore, ContentStoreError};
pub use context::ServiceContext;
pub use dispatch::{dispatch, route, DispatchPolicy, IgnoreReason, Route};
pub use driver::{
    DropReason, NotificationConfig, Outcome, Pipeline, PipelineError, RerunReport,
};
pub use handlers::{AgentHandlers, EmailHandlers, HandlerError};
pub use normalize::{normalize, CanonicalEmail, NormalizeError};
pub use pipeline_ledger::{LedgerError, PipelineLedger};
