use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One record of the hierarchical process taxonomy.
///
/// `pcf_id` is the stable cross-variant identifier; the positional `code`
/// carries no matching semantics and is only used for display and for
/// deterministic candidate uids.
#[derive(Debug, Clone)]
pub struct ProcessNode {
    pub id: i64,
    pub model_key: String,
    pub pcf_id: Option<String>,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<i64>,
    pub level: i64,
    pub is_leaf: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MalformedOutput,
    TokenLimit,
    RateLimit,
    BillingLimit,
    ConstraintViolation,
    Unknown,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedOutput => "malformed_output",
            Self::TokenLimit => "token_limit",
            Self::RateLimit => "rate_limit",
            Self::BillingLimit => "billing_limit",
            Self::ConstraintViolation => "constraint_violation",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub node_id: i64,
    pub reason: FailureReason,
    pub error: String,
}

/// Audit metadata attached to every generated document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub generated_by: String,
    pub model: String,
    pub temperature: f64,
    pub model_key: String,
    pub timestamp: String,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Audit + content metadata attached to every generated use-case
/// candidate. Extends [`DocumentMeta`] with the structured fields the
/// model returns alongside title/description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsecaseMeta {
    #[serde(flatten)]
    pub generation: DocumentMeta,
    pub complexity_details: String,
    pub technology_requirements: String,
    pub success_metrics: String,
    pub implementation_timeline: String,
    pub category: String,
    pub estimated_roi: String,
    pub risk_level: String,
}

/// A fully parsed use-case candidate ready for persistence.
#[derive(Debug, Clone)]
pub struct UsecaseCandidate {
    pub candidate_uid: String,
    pub title: String,
    pub description: String,
    pub impact_assessment: String,
    pub complexity_score: i64,
    pub meta: UsecaseMeta,
}

/// Persisted state of the active batch job for one request kind.
///
/// Written on every submission, read by `monitor` to locate the job and
/// by the failure diff to recover the targeted node set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateManifest {
    pub manifest_version: u32,
    pub job_id: String,
    pub kind: String,
    pub model_key: String,
    pub generation_model: String,
    pub temperature: f64,
    pub submitted_at: String,
    pub input_path: String,
    pub input_sha256: String,
    pub request_count: usize,
    pub target_node_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedNodesManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub kind: String,
    pub model_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Serialize)]
pub struct RunSummaryManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub kind: String,
    pub model_key: String,
    pub job_id: String,
    pub generation_model: String,
    pub targeted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub usecases_created: usize,
    pub failure_reasons: BTreeMap<String, usize>,
    pub undecodable_lines: usize,
    pub duration_ms: u128,
    pub status: String,
    pub warnings: Vec<String>,
}
