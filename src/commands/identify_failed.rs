use anyhow::Result;
use tracing::{info, warn};

use crate::cli::{IdentifyFailedArgs, RequestKind};
use crate::commands::generate::resolve_db_path;
use crate::model::{FailedNodesManifest, FailureRecord, JobStateManifest};
use crate::pipeline::{self, failures};
use crate::store;
use crate::util::{now_utc_string, read_json, write_json_pretty};

/// Diff the targeted leaf set against persisted results and write the
/// failed-nodes manifest the retry command reads. Reasons are merged
/// from the last harvest's records where available.
pub fn run(args: IdentifyFailedArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    let connection = store::open(&db_path)?;
    store::ensure_schema(&connection)?;

    let leaves = store::leaf_nodes(&connection, &args.model_key)?;
    let targets: Vec<i64> = leaves.iter().map(|node| node.id).collect();

    let satisfied = match args.kind {
        RequestKind::ProcessDetails => {
            store::node_ids_with_document(&connection, &args.model_key, "process_details")?
        }
        RequestKind::UsecaseCandidates => {
            store::node_ids_with_generated_usecases(&connection, &args.model_key)?
        }
    };

    let failed_path = pipeline::failed_nodes_path(&args.cache_root, args.kind);
    let prior_records: Vec<FailureRecord> = if failed_path.exists() {
        read_json::<FailedNodesManifest>(&failed_path)?.failures
    } else {
        Vec::new()
    };

    let state_path = pipeline::job_state_path(&args.cache_root, args.kind);
    let job_id = if state_path.exists() {
        Some(read_json::<JobStateManifest>(&state_path)?.job_id)
    } else {
        None
    };

    let unresolved = failures::classify_unresolved(&targets, &satisfied, &prior_records);

    info!(
        total_leaves = targets.len(),
        satisfied = satisfied.len(),
        failed = unresolved.len(),
        "failure diff computed"
    );

    for record in unresolved.iter().take(10) {
        match store::get_node(&connection, record.node_id)? {
            Some(node) => info!(
                node_id = node.id,
                code = %node.code,
                name = %node.name,
                reason = record.reason.as_str(),
                "failed node"
            ),
            None => warn!(node_id = record.node_id, "failed node missing from store"),
        }
    }
    if unresolved.len() > 10 {
        info!(more = unresolved.len() - 10, "additional failed nodes not listed");
    }

    write_json_pretty(
        &failed_path,
        &FailedNodesManifest {
            manifest_version: 1,
            generated_at: now_utc_string(),
            kind: args.kind.as_str().to_string(),
            model_key: args.model_key.clone(),
            job_id,
            failures: unresolved,
        },
    )?;
    info!(path = %failed_path.display(), "failed-node manifest written");

    Ok(())
}
