use anyhow::Result;
use clap::ValueEnum;
use tracing::{info, warn};

use crate::cli::{RequestKind, StatusArgs};
use crate::commands::generate::resolve_db_path;
use crate::model::{FailedNodesManifest, JobStateManifest};
use crate::pipeline;
use crate::store;
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    info!(cache_root = %args.cache_root.display(), "status requested");

    for kind in RequestKind::value_variants() {
        let state_path = pipeline::job_state_path(&args.cache_root, *kind);
        if state_path.exists() {
            let state: JobStateManifest = read_json(&state_path)?;
            info!(
                kind = kind.as_str(),
                job_id = %state.job_id,
                submitted_at = %state.submitted_at,
                request_count = state.request_count,
                targets = state.target_node_ids.len(),
                "job state"
            );
        } else {
            warn!(kind = kind.as_str(), "no job state recorded");
        }

        let failed_path = pipeline::failed_nodes_path(&args.cache_root, *kind);
        if failed_path.exists() {
            let manifest: FailedNodesManifest = read_json(&failed_path)?;
            info!(
                kind = kind.as_str(),
                failed = manifest.failures.len(),
                generated_at = %manifest.generated_at,
                "failed-node manifest"
            );
        }
    }

    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    if db_path.exists() {
        let connection = store::open(&db_path)?;
        store::ensure_schema(&connection)?;

        let nodes = store::count_rows(&connection, "SELECT COUNT(*) FROM process_nodes")?;
        let documents = store::count_rows(
            &connection,
            "SELECT COUNT(*) FROM node_documents WHERE document_type = 'process_details'",
        )?;
        let usecases = store::count_rows(&connection, "SELECT COUNT(*) FROM usecase_candidates")?;
        let missing =
            store::nodes_missing_document(&connection, &args.model_key, "process_details")?;

        info!(
            path = %db_path.display(),
            nodes,
            process_details = documents,
            usecase_candidates = usecases,
            leaves_missing_details = missing.len(),
            "store status"
        );
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}
