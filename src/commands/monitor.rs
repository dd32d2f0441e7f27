use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::info;

use crate::batch::{self, BatchClient};
use crate::cli::MonitorArgs;
use crate::commands::generate::{finish_terminal_job, resolve_db_path};
use crate::model::JobStateManifest;
use crate::pipeline;
use crate::store;
use crate::util::{read_json, utc_compact_string};

/// Re-attach to the persisted job and report progress. The submitting
/// process may be long gone; the job id in the state manifest is all
/// that is needed to resume observation.
pub fn run(args: MonitorArgs) -> Result<()> {
    let started = Instant::now();
    let run_id = format!("monitor-{}", utc_compact_string(Utc::now()));

    let state_path = pipeline::job_state_path(&args.cache_root, args.kind);
    if !state_path.exists() {
        bail!(
            "no job state at {}; run generate first",
            state_path.display()
        );
    }
    let state: JobStateManifest = read_json(&state_path)?;

    info!(
        job_id = %state.job_id,
        kind = %state.kind,
        submitted_at = %state.submitted_at,
        request_count = state.request_count,
        "monitoring batch job"
    );

    let db_path = resolve_db_path(&args.cache_root, args.db_path.clone());
    let mut connection = store::open(&db_path)?;
    store::ensure_schema(&connection)?;
    let settings = store::load_generation_settings(&connection)?;

    let client = BatchClient::new(&settings.base_url, &settings.api_key)?;
    let job = client.retrieve_batch(&state.job_id)?;
    batch::log_job_progress(&job);

    let job = if job.status.is_terminal() {
        job
    } else if args.wait {
        client.poll_until_terminal(&state.job_id, Duration::from_secs(args.poll_interval_secs))?
    } else {
        info!("job still processing; re-run monitor later or pass --wait");
        return Ok(());
    };

    finish_terminal_job(
        &mut connection,
        &client,
        &job,
        &state,
        args.kind,
        &args.cache_root,
        &settings.owner,
        &run_id,
        started,
    )
}
