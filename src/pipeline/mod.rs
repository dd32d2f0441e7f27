use std::path::{Path, PathBuf};

use crate::cli::RequestKind;

pub mod context;
pub mod failures;
pub mod harvest;
pub mod packager;
pub mod parser;
pub mod writer;

pub fn manifest_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("manifests")
}

pub fn batches_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("batches")
}

pub fn job_state_path(cache_root: &Path, kind: RequestKind) -> PathBuf {
    manifest_dir(cache_root).join(format!("job_state_{}.json", kind.as_str()))
}

pub fn failed_nodes_path(cache_root: &Path, kind: RequestKind) -> PathBuf {
    manifest_dir(cache_root).join(format!("failed_nodes_{}.json", kind.as_str()))
}

pub fn run_summary_path(cache_root: &Path, run_id: &str) -> PathBuf {
    manifest_dir(cache_root).join(format!("run_summary_{run_id}.json"))
}
