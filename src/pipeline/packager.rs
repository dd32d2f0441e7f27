use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::warn;

use crate::batch::{BatchRequestLine, ChatCompletionBody, ChatMessage, ResponseFormat};
use crate::cli::RequestKind;
use crate::error::PipelineError;
use crate::model::ProcessNode;
use crate::pipeline::context::{self, ContextOptions};
use crate::store;

const COMPLETIONS_URL: &str = "/v1/chat/completions";

const PROCESS_DETAILS_SYSTEM_PROMPT: &str = "You are a business process expert helping to \
document and analyze business processes. Generate detailed, actionable process documentation.";

const USECASE_SYSTEM_PROMPT: &str = "You are a business process improvement expert specializing \
in identifying automation opportunities, digital transformation initiatives, and operational \
optimization use cases. Generate practical, implementable use case candidates with clear \
business value.";

const PROCESS_DETAILS_SECTIONS: &str = "Please provide a detailed markdown document covering:

## Overview
Provide a comprehensive overview of this process, its purpose, and its role in the organization.

## Key Activities
List and describe the main activities involved in this process.

## Inputs and Prerequisites
- Required inputs to begin this process
- Prerequisites that must be met
- Dependencies on other processes

## Process Steps
Provide a detailed step-by-step breakdown of how this process is executed.

## Outputs and Deliverables
- Expected outputs from this process
- Deliverables produced
- Success criteria

## Roles and Responsibilities
Identify key roles involved and their responsibilities in this process.

## Best Practices
List industry best practices and recommendations for this process.

## Common Challenges
Identify common challenges and potential solutions.

## Performance Metrics
Suggest KPIs and metrics to measure process effectiveness.

## Technology and Tools
Identify relevant technologies, tools, or systems that support this process.

Generate detailed, actionable content that would be valuable for process documentation and \
improvement initiatives.";

const USECASE_INSTRUCTIONS: &str = r#"Generate 6-10 diverse use case candidates that could improve this process. For each use case candidate, provide:

## Use Case Title
A clear, actionable title (max 80 characters)

## Description
Comprehensive description of the use case (300-500 words) covering:
- What the solution does and how it works
- Key features and capabilities
- How it integrates with existing processes and systems
- Step-by-step workflow or user experience
- Expected outcomes and benefits for stakeholders

## Impact Assessment
- Process efficiency improvements
- Cost reduction potential
- Quality improvements
- Risk mitigation
- Customer experience enhancements

## Implementation Complexity
Rate as Low/Medium/High and explain key complexity factors

## Technology Requirements
List key technologies, tools, or systems needed

## Success Metrics
Specific KPIs to measure success

## Implementation Timeline
Estimated timeline and key milestones

Format as JSON object with a "use_cases" array using this structure:
```json
{
  "use_cases": [
    {
      "title": "Use Case Title",
      "description": "Detailed description...",
      "impact_assessment": "Impact details...",
      "complexity_score": "Medium",
      "complexity_details": "Complexity factors...",
      "technology_requirements": "Technology details...",
      "success_metrics": "KPIs and metrics...",
      "implementation_timeline": "Timeline details...",
      "category": "automation|optimization|digitization|analytics|integration",
      "estimated_roi": "High|Medium|Low",
      "risk_level": "Low|Medium|High"
    }
  ]
}
```

Focus on practical, implementable use cases that align with modern business process improvement trends such as:
- Process automation and AI integration
- Digital transformation initiatives
- Data analytics and insights
- Customer experience optimization
- Operational efficiency gains
- Risk reduction and compliance
- Cost optimization strategies

IMPORTANT WRITING GUIDELINES:
- When using technical abbreviations or acronyms, define them on first use (e.g., "Project Portfolio Management (PPM)" instead of just "PPM")
- Write descriptions that are accessible to business stakeholders, not just technical experts
- Use clear, professional language that explains concepts rather than assuming technical knowledge
- For commonly used business terms, provide brief context where helpful"#;

/// Model parameters for one generation run. Use-case runs get the larger
/// completion budget because the model restates process context in every
/// candidate description.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f64,
    pub max_completion_tokens: u32,
}

impl GenerationConfig {
    pub fn for_kind(kind: RequestKind, model: &str, temperature: f64) -> Self {
        let max_completion_tokens = match kind {
            RequestKind::ProcessDetails => 8000,
            RequestKind::UsecaseCandidates => 15000,
        };

        Self {
            model: model.to_string(),
            temperature,
            max_completion_tokens,
        }
    }
}

/// One packaged request, correlated back to its node through the
/// custom id embedded in the wire line.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub node_id: i64,
    pub line: BatchRequestLine,
}

#[derive(Debug, Default)]
pub struct PackageOutcome {
    pub requests: Vec<GenerationRequest>,
    pub skipped_no_context: Vec<i64>,
    pub skipped_missing_details: Vec<i64>,
}

/// Reproducible correlation id for a node + request kind. Results are
/// attributed through this id alone; the service does not guarantee
/// output order.
pub fn custom_id(kind: RequestKind, node: &ProcessNode) -> String {
    match kind {
        RequestKind::ProcessDetails => format!("node_{}_{}", node.id, node.code),
        RequestKind::UsecaseCandidates => format!("usecases_node_{}_{}", node.id, node.code),
    }
}

pub fn parse_custom_id(custom_id: &str) -> Option<(RequestKind, i64)> {
    let (kind, rest) = if let Some(rest) = custom_id.strip_prefix("usecases_node_") {
        (RequestKind::UsecaseCandidates, rest)
    } else if let Some(rest) = custom_id.strip_prefix("node_") {
        (RequestKind::ProcessDetails, rest)
    } else {
        return None;
    };

    let node_id = rest.split('_').next()?.parse::<i64>().ok()?;
    Some((kind, node_id))
}

/// Package an ordered node collection into independently addressable
/// generation requests. Nodes that cannot be packaged are skipped and
/// logged, never hard-failed: a missing context or missing upstream
/// process-details document is a recoverable precondition.
pub fn package_requests(
    connection: &Connection,
    nodes: &[ProcessNode],
    kind: RequestKind,
    config: &GenerationConfig,
    options: &ContextOptions,
) -> Result<PackageOutcome> {
    let mut outcome = PackageOutcome::default();

    for node in nodes {
        let context_block = match context::build_context(connection, node, options) {
            Ok(block) => block,
            Err(err) => {
                if matches!(
                    err.downcast_ref::<PipelineError>(),
                    Some(PipelineError::ContextUnavailable { .. })
                ) {
                    warn!(
                        node_id = node.id,
                        code = %node.code,
                        "skipping node without usable context"
                    );
                    outcome.skipped_no_context.push(node.id);
                    continue;
                }
                return Err(err);
            }
        };

        let (system_prompt, user_prompt, response_format) = match kind {
            RequestKind::ProcessDetails => (
                PROCESS_DETAILS_SYSTEM_PROMPT,
                process_details_prompt(&context_block),
                None,
            ),
            RequestKind::UsecaseCandidates => {
                let Some(details) = store::process_details_content(connection, node.id)? else {
                    let missing = PipelineError::PreconditionMissing {
                        node_id: node.id,
                        document_type: "process_details",
                    };
                    warn!(code = %node.code, error = %missing, "skipping node");
                    outcome.skipped_missing_details.push(node.id);
                    continue;
                };

                (
                    USECASE_SYSTEM_PROMPT,
                    usecase_prompt(&context_block, &details),
                    Some(ResponseFormat::json_object()),
                )
            }
        };

        let line = BatchRequestLine {
            custom_id: custom_id(kind, node),
            method: "POST".to_string(),
            url: COMPLETIONS_URL.to_string(),
            body: ChatCompletionBody {
                model: config.model.clone(),
                messages: vec![
                    ChatMessage {
                        role: "system".to_string(),
                        content: system_prompt.to_string(),
                    },
                    ChatMessage {
                        role: "user".to_string(),
                        content: user_prompt,
                    },
                ],
                max_completion_tokens: config.max_completion_tokens,
                temperature: Some(config.temperature),
                response_format,
            },
        };

        outcome.requests.push(GenerationRequest {
            node_id: node.id,
            line,
        });
    }

    Ok(outcome)
}

/// Serialize the request sequence into the service's newline-delimited
/// input format.
pub fn write_batch_input(path: &Path, requests: &[GenerationRequest]) -> Result<()> {
    if let Some(parent) = path.parent() {
        crate::util::ensure_directory(parent)?;
    }

    let mut file = File::create(path)
        .with_context(|| format!("failed to create batch input: {}", path.display()))?;

    for request in requests {
        let line = serde_json::to_string(&request.line)
            .with_context(|| format!("failed to serialize request {}", request.line.custom_id))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .with_context(|| format!("failed to write batch input: {}", path.display()))?;
    }

    Ok(())
}

fn process_details_prompt(context_block: &str) -> String {
    format!(
        "Generate comprehensive process details for the following business process node.\n\n\
         {context_block}\n\n{PROCESS_DETAILS_SECTIONS}"
    )
}

fn usecase_prompt(context_block: &str, process_details: &str) -> String {
    format!(
        "Based on the detailed process documentation below, generate innovative use case \
         candidates for process improvement, automation, and optimization.\n\n\
         {context_block}\n\nProcess Details:\n{process_details}\n\n{USECASE_INSTRUCTIONS}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{insert_node, open_in_memory};

    fn sample_node(id: i64, code: &str) -> ProcessNode {
        ProcessNode {
            id,
            model_key: "apqc_pcf".to_string(),
            pcf_id: None,
            code: code.to_string(),
            name: "Develop vision".to_string(),
            description: Some("Articulate the vision".to_string()),
            parent_id: None,
            level: 3,
            is_leaf: true,
        }
    }

    #[test]
    fn custom_ids_round_trip_for_both_kinds() {
        let node = sample_node(42, "1.2.3");

        for kind in [RequestKind::ProcessDetails, RequestKind::UsecaseCandidates] {
            let id = custom_id(kind, &node);
            assert_eq!(parse_custom_id(&id), Some((kind, 42)));
        }
    }

    #[test]
    fn foreign_custom_ids_are_rejected() {
        assert_eq!(parse_custom_id("request_9_1.2"), None);
        assert_eq!(parse_custom_id("node_notanumber_1.2"), None);
        assert_eq!(parse_custom_id(""), None);
    }

    #[test]
    fn per_kind_token_budgets_differ() {
        let details = GenerationConfig::for_kind(RequestKind::ProcessDetails, "gpt-5", 1.0);
        let usecases = GenerationConfig::for_kind(RequestKind::UsecaseCandidates, "gpt-5", 1.0);

        assert_eq!(details.max_completion_tokens, 8000);
        assert_eq!(usecases.max_completion_tokens, 15000);
        assert!(usecases.max_completion_tokens > details.max_completion_tokens);
    }

    #[test]
    fn usecase_packaging_skips_nodes_without_process_details() {
        let connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.0", "Root", Some("Root context"), None, 1);
        insert_node(&connection, 2, "apqc_pcf", None, "1.1.1", "With details", Some("desc"), Some(1), 2);
        insert_node(&connection, 3, "apqc_pcf", None, "1.1.2", "Without details", Some("desc"), Some(1), 2);

        store::upsert_document(&connection, 2, "process_details", "t", "documented", "svc", "{}")
            .expect("document");

        let nodes = store::leaf_nodes(&connection, "apqc_pcf").expect("leaves");
        let config = GenerationConfig::for_kind(RequestKind::UsecaseCandidates, "gpt-5", 1.0);
        let outcome = package_requests(
            &connection,
            &nodes,
            RequestKind::UsecaseCandidates,
            &config,
            &ContextOptions::default(),
        )
        .expect("package");

        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.requests[0].node_id, 2);
        assert_eq!(outcome.skipped_missing_details, vec![3]);
    }

    #[test]
    fn packaged_requests_embed_context_and_format_hint() {
        let connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.0", "Root", Some("Root context"), None, 1);
        insert_node(&connection, 2, "apqc_pcf", None, "1.1.1", "Leaf process", Some("Leaf description"), Some(1), 2);
        store::upsert_document(&connection, 2, "process_details", "t", "the doc body", "svc", "{}")
            .expect("document");

        let nodes = store::leaf_nodes(&connection, "apqc_pcf").expect("leaves");

        let config = GenerationConfig::for_kind(RequestKind::ProcessDetails, "gpt-5", 1.0);
        let details = package_requests(
            &connection,
            &nodes,
            RequestKind::ProcessDetails,
            &config,
            &ContextOptions::default(),
        )
        .expect("package");
        let details_body = &details.requests[0].line.body;
        assert!(details_body.response_format.is_none());
        assert!(details_body.messages[1].content.contains("Leaf description"));
        assert!(details_body.messages[1].content.contains("## Overview"));

        let config = GenerationConfig::for_kind(RequestKind::UsecaseCandidates, "gpt-5", 1.0);
        let usecases = package_requests(
            &connection,
            &nodes,
            RequestKind::UsecaseCandidates,
            &config,
            &ContextOptions::default(),
        )
        .expect("package");
        let usecase_body = &usecases.requests[0].line.body;
        assert!(usecase_body.response_format.is_some());
        assert!(usecase_body.messages[1].content.contains("the doc body"));
        assert!(usecase_body.messages[1].content.contains("use_cases"));
    }

    #[test]
    fn nodes_without_any_context_are_skipped_not_failed() {
        let connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.0", "Root", None, None, 1);
        insert_node(&connection, 2, "apqc_pcf", None, "1.1.1", "Bare leaf", None, Some(1), 2);

        let nodes = store::leaf_nodes(&connection, "apqc_pcf").expect("leaves");
        let config = GenerationConfig::for_kind(RequestKind::ProcessDetails, "gpt-5", 1.0);
        let outcome = package_requests(
            &connection,
            &nodes,
            RequestKind::ProcessDetails,
            &config,
            &ContextOptions::default(),
        )
        .expect("package");

        assert!(outcome.requests.is_empty());
        assert_eq!(outcome.skipped_no_context, vec![2]);
    }

    #[test]
    fn retry_packaging_covers_exactly_the_failed_subset() {
        use std::collections::HashSet;

        use crate::pipeline::failures::classify_unresolved;

        let connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.0", "Root", Some("Root context"), None, 1);
        for (id, code) in [(2, "1.1.1"), (3, "1.1.2"), (4, "1.1.3"), (5, "1.1.4")] {
            insert_node(&connection, id, "apqc_pcf", None, code, "Leaf", Some("desc"), Some(1), 2);
        }

        // First run succeeded for nodes 2 and 4 only.
        let targets = vec![2, 3, 4, 5];
        let satisfied = HashSet::from([2, 4]);
        let unresolved = classify_unresolved(&targets, &satisfied, &[]);

        let mut retry_nodes = Vec::new();
        for record in &unresolved {
            retry_nodes.push(
                store::get_node(&connection, record.node_id)
                    .expect("query")
                    .expect("node"),
            );
        }

        let config = GenerationConfig::for_kind(RequestKind::ProcessDetails, "gpt-5", 1.0);
        let outcome = package_requests(
            &connection,
            &retry_nodes,
            RequestKind::ProcessDetails,
            &config,
            &ContextOptions::default(),
        )
        .expect("package");

        let retried: Vec<i64> = outcome
            .requests
            .iter()
            .map(|request| request.node_id)
            .collect();
        assert_eq!(retried, vec![3, 5]);
    }

    #[test]
    fn batch_input_is_one_json_object_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input.jsonl");

        let node_a = sample_node(1, "1.1.1");
        let node_b = sample_node(2, "1.1.2");
        let config = GenerationConfig::for_kind(RequestKind::ProcessDetails, "gpt-5", 1.0);
        let requests: Vec<GenerationRequest> = [&node_a, &node_b]
            .into_iter()
            .map(|node| GenerationRequest {
                node_id: node.id,
                line: BatchRequestLine {
                    custom_id: custom_id(RequestKind::ProcessDetails, node),
                    method: "POST".to_string(),
                    url: COMPLETIONS_URL.to_string(),
                    body: ChatCompletionBody {
                        model: config.model.clone(),
                        messages: Vec::new(),
                        max_completion_tokens: config.max_completion_tokens,
                        temperature: Some(config.temperature),
                        response_format: None,
                    },
                },
            })
            .collect();

        write_batch_input(&path, &requests).expect("write");

        let raw = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("line json");
            assert_eq!(value["url"], COMPLETIONS_URL);
        }
    }
}
