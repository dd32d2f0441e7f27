use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "caseforge",
    version,
    about = "Batch generation pipeline for process documentation and use-case candidates"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Generate(GenerateArgs),
    Monitor(MonitorArgs),
    IdentifyFailed(IdentifyFailedArgs),
    RetryFailed(RetryFailedArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, ValueEnum)]
pub enum RequestKind {
    ProcessDetails,
    UsecaseCandidates,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessDetails => "process_details",
            Self::UsecaseCandidates => "usecase_candidates",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(long, default_value = ".cache/caseforge")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = RequestKind::ProcessDetails)]
    pub kind: RequestKind,

    #[arg(long, default_value = "apqc_pcf")]
    pub model_key: String,

    #[arg(long, default_value_t = false)]
    pub test: bool,

    #[arg(long, default_value_t = 5)]
    pub count: usize,

    #[arg(long, default_value_t = false)]
    pub include_branch: bool,

    #[arg(long, default_value_t = false)]
    pub cross_category: bool,

    #[arg(long, default_value_t = 6000)]
    pub context_budget: usize,

    #[arg(long, default_value_t = false)]
    pub no_wait: bool,

    #[arg(long, default_value_t = 60)]
    pub poll_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    #[arg(long, default_value = ".cache/caseforge")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = RequestKind::ProcessDetails)]
    pub kind: RequestKind,

    #[arg(long, default_value_t = false)]
    pub wait: bool,

    #[arg(long, default_value_t = 60)]
    pub poll_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct IdentifyFailedArgs {
    #[arg(long, default_value = ".cache/caseforge")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = RequestKind::UsecaseCandidates)]
    pub kind: RequestKind,

    #[arg(long, default_value = "apqc_pcf")]
    pub model_key: String,
}

#[derive(Args, Debug, Clone)]
pub struct RetryFailedArgs {
    #[arg(long, default_value = ".cache/caseforge")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = RequestKind::UsecaseCandidates)]
    pub kind: RequestKind,

    #[arg(long, default_value = "apqc_pcf")]
    pub model_key: String,

    #[arg(long, default_value_t = false)]
    pub include_branch: bool,

    #[arg(long, default_value_t = false)]
    pub cross_category: bool,

    #[arg(long, default_value_t = 6000)]
    pub context_budget: usize,

    #[arg(long, default_value_t = false)]
    pub no_wait: bool,

    #[arg(long, default_value_t = 60)]
    pub poll_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/caseforge")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value = "apqc_pcf")]
    pub model_key: String,
}
