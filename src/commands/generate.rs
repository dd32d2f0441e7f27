use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::batch::{BatchClient, BatchStatus, BatchJob};
use crate::cli::{GenerateArgs, RequestKind};
use crate::error::PipelineError;
use crate::model::JobStateManifest;
use crate::pipeline::context::ContextOptions;
use crate::pipeline::packager::{self, GenerationConfig, GenerationRequest};
use crate::pipeline::{self, harvest};
use crate::store::{self, GenerationSettings};
use crate::util::{ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty};

pub fn run(args: GenerateArgs) -> Result<()> {
    let started = Instant::now();
    let run_id = format!("gen-{}", utc_compact_string(Utc::now()));

    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    ensure_directory(&args.cache_root)?;

    let mut connection = store::open(&db_path)?;
    store::ensure_schema(&connection)?;
    let settings = store::load_generation_settings(&connection)?;

    info!(
        kind = args.kind.as_str(),
        model_key = %args.model_key,
        generation_model = %settings.model,
        temperature = settings.temperature,
        owner = %settings.owner,
        "generation setup complete"
    );

    let mut nodes = store::leaf_nodes(&connection, &args.model_key)?;
    if nodes.is_empty() {
        bail!("no leaf nodes found for model {}", args.model_key);
    }
    info!(leaf_count = nodes.len(), "loaded leaf nodes");

    if args.test {
        nodes.truncate(args.count);
        warn!(count = nodes.len(), "test mode: restricted node set");
        for node in &nodes {
            info!(code = %node.code, name = %node.name, level = node.level, "test node");
        }
    }

    let config = GenerationConfig::for_kind(args.kind, &settings.model, settings.temperature);
    let options = ContextOptions {
        include_branch: args.include_branch,
        cross_category: args.cross_category,
        max_chars: args.context_budget,
    };

    let outcome = packager::package_requests(&connection, &nodes, args.kind, &config, &options)?;
    if !outcome.skipped_no_context.is_empty() {
        warn!(
            count = outcome.skipped_no_context.len(),
            "nodes skipped for missing context"
        );
    }
    if !outcome.skipped_missing_details.is_empty() {
        warn!(
            count = outcome.skipped_missing_details.len(),
            "nodes skipped without process details; run a process-details generation first"
        );
    }
    if outcome.requests.is_empty() {
        bail!("no packageable nodes; nothing to submit");
    }

    submit_and_follow(
        &mut connection,
        &settings,
        &args.cache_root,
        args.kind,
        &args.model_key,
        &outcome.requests,
        args.no_wait,
        args.poll_interval_secs,
        &run_id,
        started,
    )
}

pub(super) fn resolve_db_path(cache_root: &Path, db_path: Option<PathBuf>) -> PathBuf {
    db_path.unwrap_or_else(|| cache_root.join("caseforge.sqlite"))
}

/// Serialize, upload and create the batch job, persist the job state,
/// then (unless asked not to) poll to a terminal status and harvest.
/// Shared between generate and retry-failed: a retry is the same
/// submission over a smaller node set.
#[allow(clippy::too_many_arguments)]
pub(super) fn submit_and_follow(
    connection: &mut Connection,
    settings: &GenerationSettings,
    cache_root: &Path,
    kind: RequestKind,
    model_key: &str,
    requests: &[GenerationRequest],
    no_wait: bool,
    poll_interval_secs: u64,
    run_id: &str,
    started: Instant,
) -> Result<()> {
    let client = BatchClient::new(&settings.base_url, &settings.api_key)?;

    let input_path = pipeline::batches_dir(cache_root).join(format!(
        "batch_input_{}_{}.jsonl",
        kind.as_str(),
        utc_compact_string(Utc::now())
    ));
    packager::write_batch_input(&input_path, requests)?;
    let input_sha256 = sha256_file(&input_path)?;
    info!(
        path = %input_path.display(),
        requests = requests.len(),
        "batch input prepared"
    );

    let file_id = client.upload_batch_file(&input_path)?;
    let job = client.create_batch(&file_id, kind.as_str(), model_key)?;
    info!(job_id = %job.id, status = job.status.as_str(), "batch submitted");

    let state = JobStateManifest {
        manifest_version: 1,
        job_id: job.id.clone(),
        kind: kind.as_str().to_string(),
        model_key: model_key.to_string(),
        generation_model: settings.model.clone(),
        temperature: settings.temperature,
        submitted_at: now_utc_string(),
        input_path: input_path.display().to_string(),
        input_sha256,
        request_count: requests.len(),
        target_node_ids: requests.iter().map(|request| request.node_id).collect(),
    };
    let state_path = pipeline::job_state_path(cache_root, kind);
    write_json_pretty(&state_path, &state)?;
    info!(path = %state_path.display(), "job state saved");

    if no_wait {
        info!("submission complete; check progress later with the monitor command");
        return Ok(());
    }

    let job = client.poll_until_terminal(&job.id, Duration::from_secs(poll_interval_secs))?;
    finish_terminal_job(
        connection, &client, &job, &state, kind, cache_root, &settings.owner, run_id, started,
    )
}

/// A completed job is harvested; any other terminal status surfaces the
/// full job error and stops the run. Resubmission is an explicit
/// operator decision, never automatic.
#[allow(clippy::too_many_arguments)]
pub(super) fn finish_terminal_job(
    connection: &mut Connection,
    client: &BatchClient,
    job: &BatchJob,
    state: &JobStateManifest,
    kind: RequestKind,
    cache_root: &Path,
    owner: &str,
    run_id: &str,
    started: Instant,
) -> Result<()> {
    match job.status {
        BatchStatus::Completed => {
            harvest::harvest_completed_job(
                connection, client, job, state, kind, cache_root, owner, run_id, started,
            )?;
            Ok(())
        }
        status => Err(PipelineError::JobEnded {
            job_id: job.id.clone(),
            status: status.as_str().to_string(),
            detail: job.errors_summary(),
        }
        .into()),
    }
}
