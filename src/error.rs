use thiserror::Error;

/// Failures the pipeline distinguishes beyond plain IO/serde errors.
///
/// Node-scoped variants (`ContextUnavailable`, `PreconditionMissing`) are
/// caught where they occur: the node is skipped and logged, the run
/// continues. Service- and job-scoped variants abort the current run;
/// nothing is retried automatically.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("node {node_id}: insufficient context ({reason})")]
    ContextUnavailable { node_id: i64, reason: String },

    #[error("node {node_id}: missing required {document_type} document")]
    PreconditionMissing {
        node_id: i64,
        document_type: &'static str,
    },

    #[error("batch service rate limit: {0}")]
    RateLimited(String),

    #[error("batch service billing limit reached: {0}")]
    BillingLimitReached(String),

    #[error("batch job {job_id} ended as {status}: {detail}")]
    JobEnded {
        job_id: String,
        status: String,
        detail: String,
    },
}
