mod config;
mod server;
mod state;
mod worker;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{
    resolve_secret, ServiceConfig, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_INBOUND_BODY_MAX_BYTES,
    DEFAULT_PIPELINE_MAX_IN_FLIGHT, DEFAULT_PIPELINE_QUEUE_CAPACITY,
};
pub use server::{build_router, run_server};
pub use worker::{PipelineQueue, PipelineSubmitter, QueueClosed};
