use std::io::{self, Write};

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use super::{write_comparison_text, write_json, write_run_text};
use crate::cli::{EntityKind, ShowArgs};
use crate::model::Comparison;
use crate::scorecard::Scorecard;
use crate::store::FileStore;

#[derive(Serialize)]
struct ComparisonView<'a> {
    scorecard: &'a Scorecard,
    comparison: &'a Comparison,
}

pub fn run(args: ShowArgs) -> Result<()> {
    let store = FileStore::open(&args.store_root)?;
    let mut output = io::BufWriter::new(io::stdout().lock());

    match args.kind {
        EntityKind::Run => {
            let run = store.load_run(&args.domain, &args.id)?;
            info!(run_id = %run.id, domain = %run.domain, "showing run");
            if args.json {
                return write_json(&run, "run");
            }
            write_run_text(&mut output, &run, args.details)?;
        }
        EntityKind::Comparison => {
            let comparison = store.load_comparison(&args.domain, &args.id)?;
            let scorecard = Scorecard::from_comparison(&comparison);
            info!(comparison_id = %comparison.id, domain = %comparison.domain, "showing comparison");
            if args.json {
                return write_json(
                    &ComparisonView {
                        scorecard: &scorecard,
                        comparison: &comparison,
                    },
                    "comparison",
                );
            }
            write_comparison_text(&mut output, &comparison, &scorecard, args.details)?;
        }
    }

    output.flush()?;
    Ok(())
}
