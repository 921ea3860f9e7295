use std::io::{self, Write};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::{build_runtime, write_json, write_run_text};
use crate::cli::RunArgs;
use crate::config::{
    Credentials, ProcessEnvironment, load_query_set, load_system_config,
    parse_credential_overrides,
};
use crate::engine::run::{ProgressFn, RunEngine, RunOptions};
use crate::model::{Metadata, Run};
use crate::registry::ToolRegistry;
use crate::store::FileStore;
use crate::util::truncate_chars;

#[derive(Serialize)]
struct RunReport<'a> {
    saved_path: Option<String>,
    run: &'a Run,
}

pub fn run(args: RunArgs) -> Result<()> {
    let mut system = load_system_config(&args.system)?;
    if let Some(top_k) = args.top_k {
        system.top_k = top_k;
    }
    let query_set = load_query_set(&args.query_set)?;
    let overrides = parse_credential_overrides(&args.credentials)?;
    let store = if args.no_save {
        None
    } else {
        Some(FileStore::open(&args.store_root)?)
    };

    info!(
        system = %system.name,
        backend = %system.backend,
        query_set = %query_set.name(),
        domain = %query_set.domain(),
        queries = query_set.len(),
        workers = args.workers,
        "starting run"
    );

    let registry = ToolRegistry::with_builtin_backends();
    let environment = ProcessEnvironment;
    let engine = RunEngine::new(&registry, Credentials::new(&overrides, &environment));
    let options = RunOptions {
        max_workers: args.workers,
        top_k: system.top_k,
        per_query_timeout: args.timeout_ms.map(Duration::from_millis),
        extra_metadata: Metadata::new(),
    };
    let progress: &ProgressFn<'_> = &|completed: usize, total: usize, text: &str| {
        info!(completed, total, query = %truncate_chars(text, 60), "query finished");
    };

    let runtime = build_runtime()?;
    let run = runtime.block_on(engine.start(&system, &query_set, options, Some(progress)))?;

    let saved_path = match &store {
        Some(store) => Some(store.save_run(&run)?.display().to_string()),
        None => None,
    };

    if args.json {
        return write_json(
            &RunReport {
                saved_path,
                run: &run,
            },
            "run",
        );
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    write_run_text(&mut output, &run, false)?;
    if let Some(path) = saved_path {
        writeln!(output, "Saved: {path}")?;
    }
    output.flush()?;
    Ok(())
}
