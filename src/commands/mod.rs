pub mod backends;
pub mod compare;
pub mod list;
pub mod run;
pub mod show;

use std::io::{self, Write};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::{Comparison, Run};
use crate::scorecard::Scorecard;
use crate::util::{condense_whitespace, truncate_chars, utc_string};

const QUERY_PREVIEW_CHARS: usize = 70;
const ANALYSIS_PREVIEW_CHARS: usize = 160;

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn write_json<T: Serialize>(value: &T, label: &str) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, value)
        .with_context(|| format!("failed to serialize {label} json output"))?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    truncate_chars(&condense_whitespace(text), max_chars)
}

fn write_run_text(output: &mut impl Write, run: &Run, details: bool) -> Result<()> {
    let backend = run
        .system_config_snapshot
        .get("backend")
        .and_then(|value| value.as_str())
        .unwrap_or("?");

    writeln!(output, "Run: {} ({})", run.id, run.status)?;
    writeln!(
        output,
        "System: {} backend={}  Query set: {}  Domain: {}",
        run.system_name, backend, run.query_set_name, run.domain
    )?;
    writeln!(
        output,
        "Queries: {}  Errors: {}  Duration: {} ms  Completed: {}",
        run.results.len(),
        run.error_count(),
        run.duration_ms().unwrap_or_default(),
        run.completed_at.map(utc_string).unwrap_or_default()
    )?;

    for (index, result) in run.results.iter().enumerate() {
        match result.error.as_deref() {
            Some(error) => writeln!(
                output,
                "  [{}] ERROR {}: {}",
                index + 1,
                preview(result.query.text(), QUERY_PREVIEW_CHARS),
                error
            )?,
            None if details => {
                writeln!(
                    output,
                    "  [{}] {} chunks in {} ms: {}",
                    index + 1,
                    result.retrieved.len(),
                    result.duration_ms,
                    preview(result.query.text(), QUERY_PREVIEW_CHARS)
                )?;
                if let Some(top) = result.retrieved.first() {
                    writeln!(
                        output,
                        "      top ({:.4}): {}",
                        top.score,
                        preview(&top.content, ANALYSIS_PREVIEW_CHARS)
                    )?;
                }
            }
            None => {}
        }
    }
    Ok(())
}

fn write_comparison_text(
    output: &mut impl Write,
    comparison: &Comparison,
    scorecard: &Scorecard,
    details: bool,
) -> Result<()> {
    writeln!(
        output,
        "Comparison: {} ({})",
        comparison.id,
        comparison.status().as_str()
    )?;
    writeln!(
        output,
        "Domain: {}  Runs: {}  Evaluations: {}  Created: {}",
        comparison.domain,
        comparison.run_ids.join(", "),
        scorecard.total,
        utc_string(comparison.timestamp)
    )?;
    writeln!(
        output,
        "{:<24} {:>5} {:>5} {:>6} {:>6} {:>7} {:>10}",
        "system", "wins", "ties", "losses", "errors", "win %", "mean score"
    )?;
    for tally in &scorecard.ranking {
        writeln!(
            output,
            "{:<24} {:>5} {:>5} {:>6} {:>6} {:>6.1}% {:>10}",
            tally.system,
            tally.wins,
            tally.ties,
            tally.losses,
            tally.errors,
            tally.win_pct,
            tally
                .mean_score
                .map(|score| format!("{score:.1}"))
                .unwrap_or_else(|| "-".to_string())
        )?;
    }

    if details {
        for (index, evaluation) in comparison.evaluations.iter().enumerate() {
            writeln!(
                output,
                "  [{}] winner={} {}",
                index + 1,
                evaluation.winner.label(),
                preview(&evaluation.query, QUERY_PREVIEW_CHARS)
            )?;
            if !evaluation.analysis.is_empty() {
                writeln!(
                    output,
                    "      {}",
                    preview(&evaluation.analysis, ANALYSIS_PREVIEW_CHARS)
                )?;
            }
        }
    }
    Ok(())
}
