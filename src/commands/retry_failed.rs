use std::time::Instant;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::RetryFailedArgs;
use crate::commands::generate::{resolve_db_path, submit_and_follow};
use crate::model::FailedNodesManifest;
use crate::pipeline;
use crate::pipeline::context::ContextOptions;
use crate::pipeline::packager::{self, GenerationConfig};
use crate::store;
use crate::util::{read_json, utc_compact_string};

/// Rebuild requests for exactly the recorded failed subset and resubmit
/// them. The requests go through the normal context/packaging path, so a
/// retry is structurally identical to a first run over a smaller set.
pub fn run(args: RetryFailedArgs) -> Result<()> {
    let started = Instant::now();
    let run_id = format!("retry-{}", utc_compact_string(Utc::now()));

    let failed_path = pipeline::failed_nodes_path(&args.cache_root, args.kind);
    if !failed_path.exists() {
        bail!(
            "no failed-node manifest at {}; run identify-failed first",
            failed_path.display()
        );
    }
    let manifest: FailedNodesManifest = read_json(&failed_path)?;
    if manifest.failures.is_empty() {
        info!("no failed nodes recorded; nothing to retry");
        return Ok(());
    }

    info!(
        count = manifest.failures.len(),
        kind = args.kind.as_str(),
        "building retry batch for failed nodes"
    );

    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    let mut connection = store::open(&db_path)?;
    store::ensure_schema(&connection)?;
    let settings = store::load_generation_settings(&connection)?;

    let mut nodes = Vec::new();
    for record in &manifest.failures {
        match store::get_node(&connection, record.node_id)? {
            Some(node) => nodes.push(node),
            None => warn!(
                node_id = record.node_id,
                "failed node missing from store; skipping"
            ),
        }
    }

    let config = GenerationConfig::for_kind(args.kind, &settings.model, settings.temperature);
    let options = ContextOptions {
        include_branch: args.include_branch,
        cross_category: args.cross_category,
        max_chars: args.context_budget,
    };
    let outcome = packager::package_requests(&connection, &nodes, args.kind, &config, &options)?;

    if !outcome.skipped_missing_details.is_empty() {
        warn!(
            count = outcome.skipped_missing_details.len(),
            "failed nodes still missing process details; not retryable yet"
        );
    }
    if outcome.requests.is_empty() {
        bail!("none of the failed nodes are packageable; nothing to retry");
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
