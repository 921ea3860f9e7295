use std::io::{self, Write};

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::write_json;
use crate::cli::{ListArgs, ListKind};
use crate::store::{ComparisonSummary, FileStore, RunSummary};

#[derive(Serialize)]
struct Listing {
    #[serde(skip_serializing_if = "Option::is_none")]
    runs: Option<Vec<RunSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comparisons: Option<Vec<ComparisonSummary>>,
}

pub fn run(args: ListArgs) -> Result<()> {
    let store = FileStore::open(&args.store_root)?;
    let domain = args.domain.as_deref();

    let runs = match args.kind {
        ListKind::Runs | ListKind::All => Some(store.list_runs(domain)?),
        ListKind::Comparisons => None,
    };
    let comparisons = match args.kind {
        ListKind::Comparisons | ListKind::All => Some(store.list_comparisons(domain)?),
        ListKind::Runs => None,
    };

    info!(
        store_root = %store.root().display(),
        domain = domain.unwrap_or("*"),
        runs = runs.as_ref().map(Vec::len).unwrap_or(0),
        comparisons = comparisons.as_ref().map(Vec::len).unwrap_or(0),
        "listing store"
    );

    if args.json {
        return write_json(&Listing { runs, comparisons }, "listing");
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    if let Some(runs) = &runs {
        writeln!(output, "Runs: {}", runs.len())?;
        for run in runs {
            writeln!(
                output,
                "  {}  {:<10} {:<9} {:<20} {:<16} queries={} errors={} {}",
                run.id,
                run.domain,
                run.status,
                run.system_name,
                run.query_set_name,
                run.query_count,
                run.error_count,
                run.completed_at
            )?;
        }
    }
    if let Some(comparisons) = &comparisons {
        writeln!(output, "Comparisons: {}", comparisons.len())?;
        for comparison in comparisons {
            writeln!(
                output,
                "  {}  {:<10} {:<9} systems={} evaluations={} errors={} {}",
                comparison.id,
                comparison.domain,
                comparison.status,
                comparison.systems.join(","),
                comparison.evaluation_count,
                comparison.error_count,
                comparison.created_at
            )?;
        }
    }
    output.flush()?;
    Ok(())
}
