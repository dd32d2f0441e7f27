use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::batch::{BatchClient, BatchJob};
use crate::cli::RequestKind;
use crate::model::{FailedNodesManifest, JobStateManifest, RunSummaryManifest};
use crate::pipeline::{self, failures, parser, writer};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

#[derive(Debug)]
pub struct HarvestReport {
    pub targeted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub usecases_created: usize,
}

/// Process one completed job end to end: download the output (and error
/// file when present), parse, persist, classify unresolved targets, and
/// write the failed-nodes and run-summary manifests.
pub fn harvest_completed_job(
    connection: &mut Connection,
    client: &BatchClient,
    job: &BatchJob,
    state: &JobStateManifest,
    kind: RequestKind,
    cache_root: &Path,
    owner: &str,
    run_id: &str,
    started: Instant,
) -> Result<HarvestReport> {
    let Some(output_file_id) = job.output_file_id.as_deref() else {
        bail!("completed job {} reports no output file", job.id);
    };

    let mut raw = client.download_file(output_file_id)?;
    info!(job_id = %job.id, bytes = raw.len(), "batch output downloaded");

    // Requests the service itself rejected land in a separate error
    // file with the same line format.
    if let Some(error_file_id) = job.error_file_id.as_deref() {
        let error_raw = client.download_file(error_file_id)?;
        info!(job_id = %job.id, bytes = error_raw.len(), "batch error file downloaded");
        raw.push('\n');
        raw.push_str(&error_raw);
    }

    let output_path = pipeline::batches_dir(cache_root).join(format!(
        "batch_output_{}_{}.jsonl",
        kind.as_str(),
        utc_compact_string(Utc::now())
    ));
    if let Some(parent) = output_path.parent() {
        crate::util::ensure_directory(parent)?;
    }
    std::fs::write(&output_path, &raw)
        .with_context(|| format!("failed to save batch output: {}", output_path.display()))?;

    let parsed = parser::parse_output(&raw, kind)?;

    let write_context = writer::WriteContext {
        kind,
        job_id: &job.id,
        model: &state.generation_model,
        temperature: state.temperature,
        model_key: &state.model_key,
        owner,
    };
    let stats = writer::persist_results(connection, &parsed, &write_context)?;

    let mut all_failures = parsed.failures.clone();
    all_failures.extend(stats.failures.iter().cloned());

    let unresolved = failures::classify_unresolved(
        &state.target_node_ids,
        &stats.succeeded_node_ids,
        &all_failures,
    );

    let failed_path = pipeline::failed_nodes_path(cache_root, kind);
    write_json_pretty(
        &failed_path,
        &FailedNodesManifest {
            manifest_version: 1,
            generated_at: now_utc_string(),
            kind: kind.as_str().to_string(),
            model_key: state.model_key.clone(),
            job_id: Some(job.id.clone()),
            failures: unresolved.clone(),
        },
    )?;

    let mut failure_reasons = BTreeMap::new();
    for record in &unresolved {
        *failure_reasons
            .entry(record.reason.as_str().to_string())
            .or_insert(0_usize) += 1;
    }

    let report = HarvestReport {
        targeted: state.target_node_ids.len(),
        succeeded: stats.succeeded_node_ids.len(),
        failed: unresolved.len(),
        usecases_created: stats.usecases_created,
    };

    let status = if report.failed == 0 {
        "completed"
    } else {
        "completed_with_failures"
    };

    let summary = RunSummaryManifest {
        manifest_version: 1,
        run_id: run_id.to_string(),
        generated_at: now_utc_string(),
        kind: kind.as_str().to_string(),
        model_key: state.model_key.clone(),
        job_id: job.id.clone(),
        generation_model: state.generation_model.clone(),
        targeted: report.targeted,
        succeeded: report.succeeded,
        failed: report.failed,
        usecases_created: report.usecases_created,
        failure_reasons: failure_reasons.clone(),
        undecodable_lines: parsed.undecodable_lines,
        duration_ms: started.elapsed().as_millis(),
        status: status.to_string(),
        warnings: parsed.warnings.clone(),
    };
    let summary_path = pipeline::run_summary_path(cache_root, run_id);
    write_json_pretty(&summary_path, &summary)?;

    info!(
        run_id,
        targeted = report.targeted,
        succeeded = report.succeeded,
        failed = report.failed,
        usecases_created = report.usecases_created,
        summary = %summary_path.display(),
        "run summary written"
    );
    for (reason, count) in &failure_reasons {
        warn!(reason = %reason, count, "failure reason breakdown");
    }
    if report.failed > 0 {
        info!(
            path = %failed_path.display(),
            "failed nodes recorded; build a retry with the retry-failed command"
        );
    }

    Ok(report)
}
