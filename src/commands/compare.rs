use std::io::{self, Write};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use super::{build_runtime, write_comparison_text, write_json};
use crate::cli::CompareArgs;
use crate::config::{
    Credentials, ProcessEnvironment, load_evaluator_config, parse_credential_overrides,
};
use crate::engine::compare::compare;
use crate::judge::chat::ChatJudge;
use crate::model::{Comparison, Run};
use crate::scorecard::Scorecard;
use crate::store::FileStore;

#[derive(Serialize)]
struct ComparisonReport<'a> {
    saved_path: Option<String>,
    scorecard: &'a Scorecard,
    comparison: &'a Comparison,
}

pub fn run(args: CompareArgs) -> Result<()> {
    let store = FileStore::open(&args.store_root)?;
    let runs = args
        .runs
        .iter()
        .map(|key| store.load_run(&args.domain, key))
        .collect::<Result<Vec<Run>>>()?;

    let mut evaluator = load_evaluator_config(args.evaluator.as_deref())?;
    if let Some(max_concurrency) = args.max_concurrency {
        evaluator.max_concurrency = max_concurrency;
        evaluator.validate()?;
    }

    let overrides = parse_credential_overrides(&args.credentials)?;
    let environment = ProcessEnvironment;
    let credentials = Credentials::new(&overrides, &environment);
    let judge = ChatJudge::from_config(&evaluator.provider, &credentials)
        .context("failed to configure judge")?;

    info!(
        domain = %args.domain,
        runs = %runs.iter().map(|run| run.id.as_str()).collect::<Vec<&str>>().join(", "),
        model = %evaluator.provider.model,
        "starting comparison"
    );

    let runtime = build_runtime()?;
    let comparison = runtime.block_on(compare(&runs, &evaluator, &judge))?;
    let scorecard = Scorecard::from_comparison(&comparison);

    let saved_path = if args.no_save {
        None
    } else {
        Some(store.save_comparison(&comparison)?.display().to_string())
    };

    if args.json {
        return write_json(
            &ComparisonReport {
                saved_path,
                scorecard: &scorecard,
                comparison: &comparison,
            },
            "comparison",
        );
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    write_comparison_text(&mut output, &comparison, &scorecard, false)?;
    if let Some(path) = saved_path {
        writeln!(output, "Saved: {path}")?;
    }
    output.flush()?;
    Ok(())
}
