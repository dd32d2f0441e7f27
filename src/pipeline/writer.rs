use std::collections::HashSet;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::RequestKind;
use crate::model::{DocumentMeta, FailureReason, FailureRecord, UsecaseCandidate, UsecaseMeta};
use crate::pipeline::parser::{ParsedResults, ParsedUsecaseSet};
use crate::store;
use crate::util::now_utc_string;

/// Provenance attached to every row written by one run.
#[derive(Debug, Clone)]
pub struct WriteContext<'a> {
    pub kind: RequestKind,
    pub job_id: &'a str,
    pub model: &'a str,
    pub temperature: f64,
    pub model_key: &'a str,
    pub owner: &'a str,
}

#[derive(Debug, Default)]
pub struct WriteStats {
    pub documents_written: usize,
    pub nodes_with_usecases: usize,
    pub usecases_created: usize,
    pub already_present: usize,
    pub succeeded_node_ids: HashSet<i64>,
    pub failures: Vec<FailureRecord>,
}

/// Commit parsed results to the durable store. The writer is the only
/// stage that touches durable state; everything it writes carries the
/// owning service account and a full audit metadata block.
pub fn persist_results(
    connection: &mut Connection,
    parsed: &ParsedResults,
    write_context: &WriteContext<'_>,
) -> Result<WriteStats> {
    let mut stats = WriteStats::default();

    for document in &parsed.documents {
        let Some(node) = store::get_node(connection, document.node_id)? else {
            warn!(node_id = document.node_id, "parsed document for a node missing from the store");
            stats.failures.push(FailureRecord {
                node_id: document.node_id,
                reason: FailureReason::Unknown,
                error: "node missing from the store".to_string(),
            });
            continue;
        };

        let meta = document_meta(write_context, document.request_id.clone());
        let meta_json =
            serde_json::to_string(&meta).context("failed to serialize document metadata")?;

        store::upsert_document(
            connection,
            node.id,
            write_context.kind.as_str(),
            &format!("Process Details - {}", node.name),
            &document.content,
            write_context.owner,
            &meta_json,
        )?;

        stats.documents_written += 1;
        stats.succeeded_node_ids.insert(node.id);
    }

    for set in &parsed.usecase_sets {
        let Some(node) = store::get_node(connection, set.node_id)? else {
            warn!(node_id = set.node_id, "parsed use cases for a node missing from the store");
            stats.failures.push(FailureRecord {
                node_id: set.node_id,
                reason: FailureReason::Unknown,
                error: "node missing from the store".to_string(),
            });
            continue;
        };

        let candidates = build_candidates(&node.code, set, write_context);
        let outcome = store::replace_usecases(connection, node.id, &candidates, write_context.owner)?;

        if outcome.already_present > 0 {
            info!(
                node_id = node.id,
                already_present = outcome.already_present,
                "candidate uids already present; treated as satisfied"
            );
        }

        stats.nodes_with_usecases += 1;
        stats.usecases_created += outcome.inserted;
        stats.already_present += outcome.already_present;
        stats.succeeded_node_ids.insert(node.id);
    }

    Ok(stats)
}

fn document_meta(write_context: &WriteContext<'_>, request_id: Option<String>) -> DocumentMeta {
    DocumentMeta {
        generated_by: "batch_api".to_string(),
        model: write_context.model.to_string(),
        temperature: write_context.temperature,
        model_key: write_context.model_key.to_string(),
        timestamp: now_utc_string(),
        batch_id: write_context.job_id.to_string(),
        request_id,
    }
}

/// Candidate uids are deterministic in the node code and the entry
/// ordinal, so regeneration is idempotent in naming even though the
/// content differs between runs.
fn build_candidates(
    node_code: &str,
    set: &ParsedUsecaseSet,
    write_context: &WriteContext<'_>,
) -> Vec<UsecaseCandidate> {
    set.entries
        .iter()
        .enumerate()
        .map(|(index, draft)| UsecaseCandidate {
            candidate_uid: format!("{node_code}-UC{:02}", index + 1),
            title: draft.title.clone(),
            description: draft.description.clone(),
            impact_assessment: draft.impact_assessment.clone(),
            complexity_score: draft.complexity_score,
            meta: UsecaseMeta {
                generation: document_meta(write_context, set.request_id.clone()),
                complexity_details: draft.complexity_details.clone(),
                technology_requirements: draft.technology_requirements.clone(),
                success_metrics: draft.success_metrics.clone(),
                implementation_timeline: draft.implementation_timeline.clone(),
                category: draft.category.clone(),
                estimated_roi: draft.estimated_roi.clone(),
                risk_level: draft.risk_level.clone(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parser::{ParsedDocument, UsecaseDraft};
    use crate::store::testutil::{insert_node, open_in_memory};

    fn write_context(kind: RequestKind) -> WriteContext<'static> {
        WriteContext {
            kind,
            job_id: "batch_123",
            model: "gpt-5",
            temperature: 1.0,
            model_key: "apqc_pcf",
            owner: "batch-service",
        }
    }

    fn draft(title: &str) -> UsecaseDraft {
        UsecaseDraft {
            title: title.to_string(),
            description: "desc".to_string(),
            impact_assessment: "impact".to_string(),
            complexity_score: 5,
            complexity_details: String::new(),
            technology_requirements: String::new(),
            success_metrics: String::new(),
            implementation_timeline: String::new(),
            category: "automation".to_string(),
            estimated_roi: "High".to_string(),
            risk_level: "Low".to_string(),
        }
    }

    #[test]
    fn regenerating_a_document_keeps_exactly_one_row() {
        let mut connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.1.1", "Develop vision", Some("desc"), None, 1);

        let context = write_context(RequestKind::ProcessDetails);
        for content in ["first version", "second version"] {
            let parsed = ParsedResults {
                documents: vec![ParsedDocument {
                    node_id: 1,
                    content: content.to_string(),
                    request_id: Some("req_a".to_string()),
                }],
                ..ParsedResults::default()
            };
            persist_results(&mut connection, &parsed, &context).expect("persist");
        }

        let count = store::count_rows(
            &connection,
            "SELECT COUNT(*) FROM node_documents WHERE node_id = 1",
        )
        .expect("count");
        assert_eq!(count, 1);

        let content = store::process_details_content(&connection, 1)
            .expect("query")
            .expect("content");
        assert_eq!(content, "second version");
    }

    #[test]
    fn second_usecase_run_fully_replaces_the_first() {
        let mut connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.1.1", "Develop vision", Some("desc"), None, 1);

        let context = write_context(RequestKind::UsecaseCandidates);
        let run = |titles: &[&str]| ParsedResults {
            usecase_sets: vec![ParsedUsecaseSet {
                node_id: 1,
                entries: titles.iter().map(|title| draft(title)).collect(),
                request_id: None,
            }],
            ..ParsedResults::default()
        };

        persist_results(&mut connection, &run(&["a", "b", "c", "d", "e", "f", "g", "h"]), &context)
            .expect("first run");
        let stats = persist_results(&mut connection, &run(&["x", "y", "z", "w", "v", "u"]), &context)
            .expect("second run");

        assert_eq!(stats.usecases_created, 6);
        assert_eq!(crate::store::testutil::usecase_count(&connection, 1), 6);
    }

    #[test]
    fn candidate_uids_are_deterministic_in_code_and_ordinal() {
        let mut connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.3.5", "Node", Some("desc"), None, 1);

        let context = write_context(RequestKind::UsecaseCandidates);
        let parsed = ParsedResults {
            usecase_sets: vec![ParsedUsecaseSet {
                node_id: 1,
                entries: vec![draft("first"), draft("second")],
                request_id: None,
            }],
            ..ParsedResults::default()
        };
        persist_results(&mut connection, &parsed, &context).expect("persist");

        let uids: Vec<String> = {
            let mut statement = connection
                .prepare("SELECT candidate_uid FROM usecase_candidates ORDER BY candidate_uid")
                .expect("prepare");
            let rows = statement
                .query_map([], |row| row.get(0))
                .expect("query")
                .collect::<rusqlite::Result<Vec<String>>>()
                .expect("rows");
            rows
        };
        assert_eq!(uids, vec!["1.3.5-UC01", "1.3.5-UC02"]);
    }

    #[test]
    fn unknown_nodes_become_failures_not_errors() {
        let mut connection = open_in_memory();

        let context = write_context(RequestKind::ProcessDetails);
        let parsed = ParsedResults {
            documents: vec![ParsedDocument {
                node_id: 404,
                content: "body".to_string(),
                request_id: None,
            }],
            ..ParsedResults::default()
        };

        let stats = persist_results(&mut connection, &parsed, &context).expect("persist");
        assert_eq!(stats.documents_written, 0);
        assert_eq!(stats.failures.len(), 1);
        assert!(stats.succeeded_node_ids.is_empty());
    }

    #[test]
    fn audit_metadata_is_written_with_each_document() {
        let mut connection = open_in_memory();
        insert_node(&connection, 1, "apqc_pcf", None, "1.1.1", "Node", Some("desc"), None, 1);

        let context = write_context(RequestKind::ProcessDetails);
        let parsed = ParsedResults {
            documents: vec![ParsedDocument {
                node_id: 1,
                content: "body".to_string(),
                request_id: Some("req_9".to_string()),
            }],
            ..ParsedResults::default()
        };
        persist_results(&mut connection, &parsed, &context).expect("persist");

        let meta_json: String = connection
            .query_row(
                "SELECT meta_json FROM node_documents WHERE node_id = 1",
                [],
                |row| row.get(0),
            )
            .expect("meta");
        let meta: DocumentMeta = serde_json::from_str(&meta_json).expect("decode");

        assert_eq!(meta.generated_by, "batch_api");
        assert_eq!(meta.batch_id, "batch_123");
        assert_eq!(meta.request_id.as_deref(), Some("req_9"));
    }
}
