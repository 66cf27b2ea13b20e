use std::sync::Arc;

use crate::content_store::ContentStore;
use crate::pipeline_ledger::PipelineLedger;

use super::worker::PipelineSubmitter;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) store: Arc<ContentStore>,
    pub(super) ledger: Arc<PipelineLedger>,
    pub(super) queue: PipelineSubmitter,
}
