use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

pub const DEFAULT_STORE_ROOT: &str = ".cache/ragcompare";

#[derive(Parser, Debug)]
#[command(
    name = "ragcompare",
    version,
    about = "Run query sets against retrieval backends and compare runs with an LLM judge"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a query set against one configured system and store the run.
    Run(RunArgs),
    /// Judge two or more stored runs of the same domain query by query.
    Compare(CompareArgs),
    /// List stored runs and comparisons.
    List(ListArgs),
    /// Print one stored run or comparison.
    Show(ShowArgs),
    /// List the retrieval backends this build can construct.
    Backends(BackendsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = DEFAULT_STORE_ROOT)]
    pub store_root: PathBuf,

    /// System config JSON: {name, backend, top_k, options}.
    #[arg(long)]
    pub system: PathBuf,

    /// Query set JSON: {name, domain, queries: [{text, reference?, metadata?}]}.
    #[arg(long)]
    pub query_set: PathBuf,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Per-query retrieval timeout; unset means no limit.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Overrides the system config's top_k.
    #[arg(long)]
    pub top_k: Option<usize>,

    /// NAME=VALUE, takes precedence over the environment. Repeatable.
    #[arg(long = "credential")]
    pub credentials: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub no_save: bool,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    #[arg(long, default_value = DEFAULT_STORE_ROOT)]
    pub store_root: PathBuf,

    #[arg(long)]
    pub domain: String,

    /// Run id, unique id prefix, or `latest`. Repeat for each run.
    #[arg(long = "run", required = true, num_args = 1)]
    pub runs: Vec<String>,

    /// Evaluator config JSON; built-in defaults when omitted.
    #[arg(long)]
    pub evaluator: Option<PathBuf>,

    #[arg(long)]
    pub max_concurrency: Option<usize>,

    #[arg(long = "credential")]
    pub credentials: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub no_save: bool,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ListKind {
    Runs,
    Comparisons,
    All,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    #[arg(long, default_value = DEFAULT_STORE_ROOT)]
    pub store_root: PathBuf,

    #[arg(long)]
    pub domain: Option<String>,

    #[arg(long, value_enum, default_value_t = ListKind::All)]
    pub kind: ListKind,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EntityKind {
    Run,
    Comparison,
}

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    #[arg(long, default_value = DEFAULT_STORE_ROOT)]
    pub store_root: PathBuf,

    #[arg(long)]
    pub domain: String,

    #[arg(long, value_enum, default_value_t = EntityKind::Comparison)]
    pub kind: EntityKind,

    /// Id, unique id prefix, or `latest`.
    #[arg(long, default_value = "latest")]
    pub id: String,

    /// Include per-query detail in plain output.
    #[arg(long, default_value_t = false)]
    pub details: bool,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BackendsArgs {
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
