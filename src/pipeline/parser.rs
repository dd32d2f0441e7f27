use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::batch::{BatchErrorPayload, BatchOutputLine, BatchResponse};
use crate::cli::RequestKind;
use crate::model::{FailureReason, FailureRecord};
use crate::pipeline::packager;

/// Title length cap applied before persistence.
const MAX_TITLE_CHARS: usize = 200;

/// Expected number of candidates per node; counts outside this range are
/// logged, not failed.
const EXPECTED_USECASES: std::ops::RangeInclusive<usize> = 6..=10;

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub node_id: i64,
    pub content: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedUsecaseSet {
    pub node_id: i64,
    pub entries: Vec<UsecaseDraft>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UsecaseDraft {
    pub title: String,
    pub description: String,
    pub impact_assessment: String,
    pub complexity_score: i64,
    pub complexity_details: String,
    pub technology_requirements: String,
    pub success_metrics: String,
    pub implementation_timeline: String,
    pub category: String,
    pub estimated_roi: String,
    pub risk_level: String,
}

#[derive(Debug, Default)]
pub struct ParsedResults {
    pub documents: Vec<ParsedDocument>,
    pub usecase_sets: Vec<ParsedUsecaseSet>,
    pub failures: Vec<FailureRecord>,
    pub undecodable_lines: usize,
    pub warnings: Vec<String>,
}

/// Map the model's complexity vocabulary onto the 1-10 scale. Returns
/// None for anything outside the known vocabulary so callers fail the
/// entry closed instead of defaulting.
pub fn map_complexity(label: &str) -> Option<i64> {
    match label.trim().to_ascii_lowercase().as_str() {
        "low" => Some(2),
        "medium" => Some(5),
        "high" => Some(8),
        _ => None,
    }
}

/// Decode a completed batch's raw output lines.
///
/// Attribution is by correlation id only; line order carries no meaning.
/// Every per-line and per-entry problem becomes a FailureRecord (or a
/// counted undecodable line when not even the correlation id survives);
/// nothing here aborts the batch.
pub fn parse_output(raw: &str, kind: RequestKind) -> Result<ParsedResults> {
    let code_fence = Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$")
        .context("failed to compile code fence regex")?;

    let mut results = ParsedResults::default();

    for (index, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let decoded = match serde_json::from_str::<BatchOutputLine>(trimmed) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(line = index + 1, error = %err, "undecodable result line");
                results.undecodable_lines += 1;
                continue;
            }
        };

        let Some((line_kind, node_id)) = packager::parse_custom_id(&decoded.custom_id) else {
            warn!(custom_id = %decoded.custom_id, "result line with foreign correlation id");
            results.undecodable_lines += 1;
            continue;
        };

        if line_kind != kind {
            results.warnings.push(format!(
                "result line {} belongs to a {} run, not {}",
                decoded.custom_id,
                line_kind.as_str(),
                kind.as_str()
            ));
            continue;
        }

        if let Some(error) = &decoded.error {
            results.failures.push(classify_error_payload(node_id, error));
            continue;
        }

        let Some(response) = &decoded.response else {
            results.failures.push(FailureRecord {
                node_id,
                reason: FailureReason::Unknown,
                error: "result line carries neither response nor error".to_string(),
            });
            continue;
        };

        if response.status_code != 200 {
            results.failures.push(classify_http_failure(node_id, response));
            continue;
        }

        let choice = response
            .body
            .as_ref()
            .and_then(|body| body.choices.first());
        let Some(choice) = choice else {
            results.failures.push(FailureRecord {
                node_id,
                reason: FailureReason::MalformedOutput,
                error: "response body has no choices".to_string(),
            });
            continue;
        };

        if choice.finish_reason.as_deref() == Some("length") {
            results.failures.push(FailureRecord {
                node_id,
                reason: FailureReason::TokenLimit,
                error: "output truncated at the completion token limit".to_string(),
            });
            continue;
        }

        let content = choice
            .message
            .content
            .as_deref()
            .map(str::trim)
            .filter(|content| !content.is_empty());
        let Some(content) = content else {
            results.failures.push(FailureRecord {
                node_id,
                reason: FailureReason::MalformedOutput,
                error: "response message has no content".to_string(),
            });
            continue;
        };

        match kind {
            RequestKind::ProcessDetails => results.documents.push(ParsedDocument {
                node_id,
                content: content.to_string(),
                request_id: response.request_id.clone(),
            }),
            RequestKind::UsecaseCandidates => {
                if let Some(set) = parse_usecase_content(
                    node_id,
                    content,
                    response.request_id.clone(),
                    &code_fence,
                    &mut results.failures,
                ) {
                    results.usecase_sets.push(set);
                }
            }
        }
    }

    Ok(results)
}

fn parse_usecase_content(
    node_id: i64,
    content: &str,
    request_id: Option<String>,
    code_fence: &Regex,
    failures: &mut Vec<FailureRecord>,
) -> Option<ParsedUsecaseSet> {
    let payload = code_fence
        .captures(content)
        .and_then(|captures| captures.get(1))
        .map_or(content, |inner| inner.as_str());

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            failures.push(FailureRecord {
                node_id,
                reason: FailureReason::MalformedOutput,
                error: format!("invalid use-case json: {err}"),
            });
            return None;
        }
    };

    // Accept the documented {"use_cases": [...]} wrapper and the bare
    // array some responses still produce.
    let items = if let Some(array) = value.as_array() {
        array
    } else if let Some(array) = value.get("use_cases").and_then(Value::as_array) {
        array
    } else {
        failures.push(FailureRecord {
            node_id,
            reason: FailureReason::MalformedOutput,
            error: "expected a use_cases array".to_string(),
        });
        return None;
    };

    let mut entries = Vec::new();
    for (ordinal, item) in items.iter().enumerate() {
        match decode_usecase_entry(item) {
            Ok(draft) => entries.push(draft),
            Err(detail) => failures.push(FailureRecord {
                node_id,
                reason: FailureReason::MalformedOutput,
                error: format!("use-case entry {}: {detail}", ordinal + 1),
            }),
        }
    }

    if entries.is_empty() {
        failures.push(FailureRecord {
            node_id,
            reason: FailureReason::MalformedOutput,
            error: "no decodable use-case entries".to_string(),
        });
        return None;
    }

    if !EXPECTED_USECASES.contains(&entries.len()) {
        warn!(
            node_id,
            count = entries.len(),
            "use-case count outside the expected 6-10 range"
        );
    }

    Some(ParsedUsecaseSet {
        node_id,
        entries,
        request_id,
    })
}

fn decode_usecase_entry(item: &Value) -> std::result::Result<UsecaseDraft, String> {
    let object = item.as_object().ok_or("entry is not an object")?;

    let complexity_label = match object.get("complexity_score") {
        Some(Value::String(label)) => label.as_str(),
        Some(_) => return Err("complexity_score is not a string".to_string()),
        None => return Err("complexity_score is missing".to_string()),
    };
    let complexity_score = map_complexity(complexity_label)
        .ok_or_else(|| format!("unrecognized complexity label: {complexity_label}"))?;

    let mut title = text_field(object, "title")?;
    if title.trim().is_empty() {
        title = "Untitled Use Case".to_string();
    }
    title = crate::util::truncate_chars(&title, MAX_TITLE_CHARS).to_string();

    Ok(UsecaseDraft {
        title,
        description: text_field(object, "description")?,
        impact_assessment: text_field(object, "impact_assessment")?,
        complexity_score,
        complexity_details: text_field(object, "complexity_details")?,
        technology_requirements: text_field(object, "technology_requirements")?,
        success_metrics: text_field(object, "success_metrics")?,
        implementation_timeline: text_field(object, "implementation_timeline")?,
        category: non_empty_or(text_field(object, "category")?, "optimization"),
        estimated_roi: non_empty_or(text_field(object, "estimated_roi")?, "Medium"),
        risk_level: non_empty_or(text_field(object, "risk_level")?, "Medium"),
    })
}

fn text_field(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> std::result::Result<String, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(format!("field {key} has the wrong type")),
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn classify_error_payload(node_id: i64, error: &BatchErrorPayload) -> FailureRecord {
    let code = error.code.as_deref().unwrap_or("");
    let message = error.message.as_deref().unwrap_or("");

    let reason = if code.contains("rate_limit") {
        FailureReason::RateLimit
    } else if code.contains("insufficient_quota")
        || code.contains("billing")
        || message.contains("quota")
        || message.contains("billing")
    {
        FailureReason::BillingLimit
    } else {
        FailureReason::Unknown
    };

    FailureRecord {
        node_id,
        reason,
        error: format!("{code}: {message}"),
    }
}

fn classify_http_failure(node_id: i64, response: &BatchResponse) -> FailureRecord {
    let reason = match response.status_code {
        429 => FailureReason::RateLimit,
        402 => FailureReason::BillingLimit,
        _ => FailureReason::Unknown,
    };

    FailureRecord {
        node_id,
        reason,
        error: format!("request failed with status {}", response.status_code),
    }
}
