use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{FutureExt, StreamExt, TryStreamExt, stream};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::panic_message;
use super::retry::{RetryOutcome, RetryPolicy};
use crate::config::EvaluatorConfig;
use crate::error::EngineError;
use crate::judge::parse::{ParseOutcome, VerdictParser};
use crate::judge::prompt::{PromptLimits, PromptRenderer};
use crate::judge::{FailureClass, Judge, JudgeError};
use crate::model::{Comparison, Evaluation, Metadata, QueryResult, Run, Winner};
use crate::util::{new_entity_id, truncate_chars};

const RUN_ID_SUFFIX_CHARS: usize = 8;

/// Everything one evaluation needs, borrowed from the caller for the whole comparison.
struct EvaluationContext<'a> {
    runs: &'a [Run],
    labels: &'a [String],
    domain: &'a str,
    renderer: &'a PromptRenderer,
    parser: &'a VerdictParser,
    policy: &'a RetryPolicy,
    judge: &'a dyn Judge,
}

pub async fn compare(
    runs: &[Run],
    evaluator: &EvaluatorConfig,
    judge: &dyn Judge,
) -> Result<Comparison, EngineError> {
    evaluator.validate()?;
    validate_runs(runs)?;

    let renderer = PromptRenderer::new(
        &evaluator.prompt_template,
        PromptLimits {
            max_chunks_per_system: evaluator.max_chunks_per_system,
            max_chunk_chars: evaluator.max_chunk_chars,
        },
    )
    .map_err(|err| EngineError::configuration(format!("{err:#}")))?;
    let parser =
        VerdictParser::new().map_err(|err| EngineError::configuration(format!("{err:#}")))?;
    let policy = RetryPolicy {
        max_attempts: evaluator.max_attempts,
        base_delay: Duration::from_millis(evaluator.base_delay_ms),
        max_delay: Duration::from_millis(evaluator.max_delay_ms),
    };
    let evaluator_config_snapshot = serde_json::to_value(evaluator).map_err(|err| {
        EngineError::configuration(format!("evaluator config is not serializable: {err}"))
    })?;

    let labels = system_labels(runs);
    let domain = runs[0].domain.clone();
    let query_count = runs[0].results.len();
    let id = new_entity_id();
    let started = Instant::now();

    info!(
        comparison_id = %id,
        domain = %domain,
        systems = %labels.join(", "),
        queries = query_count,
        evaluator = %evaluator.name,
        max_concurrency = evaluator.max_concurrency,
        "comparison started"
    );

    let context = EvaluationContext {
        runs,
        labels: &labels,
        domain: &domain,
        renderer: &renderer,
        parser: &parser,
        policy: &policy,
        judge,
    };

    let evaluations = stream::iter(0..query_count)
        .map(|index| evaluate_query(&context, index))
        .buffered(evaluator.max_concurrency)
        .try_collect::<Vec<Evaluation>>()
        .await
        .inspect_err(|err| {
            warn!(
                comparison_id = %id,
                code = err.code(),
                error = %err,
                "comparison aborted"
            )
        })?;

    let error_count = evaluations
        .iter()
        .filter(|evaluation| evaluation.winner.is_error())
        .count();
    let mut metadata = Metadata::new();
    metadata.insert(
        "tool_version".to_string(),
        Value::from(env!("CARGO_PKG_VERSION")),
    );
    metadata.insert("evaluator".to_string(), Value::from(evaluator.name.clone()));
    metadata.insert("error_count".to_string(), Value::from(error_count));
    metadata.insert(
        "duration_ms".to_string(),
        Value::from(started.elapsed().as_millis() as u64),
    );

    let comparison = Comparison {
        id,
        domain,
        run_ids: runs.iter().map(|run| run.id.clone()).collect(),
        systems: labels,
        evaluations,
        evaluator_config_snapshot,
        timestamp: Utc::now(),
        metadata,
    };

    info!(
        comparison_id = %comparison.id,
        status = comparison.status().as_str(),
        evaluations = comparison.evaluations.len(),
        errors = error_count,
        duration_ms = started.elapsed().as_millis() as u64,
        "comparison finished"
    );

    Ok(comparison)
}

fn validate_runs(runs: &[Run]) -> Result<(), EngineError> {
    if runs.len() < 2 {
        return Err(EngineError::validation(format!(
            "a comparison needs at least two runs, got {}",
            runs.len()
        )));
    }

    let mut seen = BTreeSet::new();
    for run in runs {
        if !seen.insert(run.id.as_str()) {
            return Err(EngineError::validation(format!(
                "run {} is listed more than once",
                run.id
            )));
        }
        if !run.is_finished() {
            return Err(EngineError::validation(format!(
                "run {} is not finished (status {})",
                run.id, run.status
            )));
        }
        check_results_match_snapshot(run)?;
    }

    let first = &runs[0];
    let expected = first.query_set_snapshot.queries();
    for other in &runs[1..] {
        if other.domain != first.domain {
            return Err(EngineError::validation(format!(
                "runs belong to different domains: {} is '{}', {} is '{}'",
                first.id, first.domain, other.id, other.domain
            )));
        }
        let actual = other.query_set_snapshot.queries();
        if actual.len() != expected.len() {
            return Err(EngineError::validation(format!(
                "runs {} and {} cover different numbers of queries ({} vs {})",
                first.id,
                other.id,
                expected.len(),
                actual.len()
            )));
        }
        let misaligned = expected
            .iter()
            .zip(actual)
            .position(|(left, right)| !left.aligns_with(right));
        if let Some(index) = misaligned {
            return Err(EngineError::validation(format!(
                "runs {} and {} disagree on query {}: '{}' vs '{}'",
                first.id,
                other.id,
                index + 1,
                expected[index].text(),
                actual[index].text()
            )));
        }
    }

    Ok(())
}

// Evaluations read query text from results, so they must mirror the snapshot slot for slot.
fn check_results_match_snapshot(run: &Run) -> Result<(), EngineError> {
    let queries = run.query_set_snapshot.queries();
    if run.results.len() != queries.len() {
        return Err(EngineError::validation(format!(
            "run {} has {} results for a query set of {} queries",
            run.id,
            run.results.len(),
            queries.len()
        )));
    }
    let stray = run
        .results
        .iter()
        .zip(queries)
        .position(|(result, query)| !result.query.aligns_with(query));
    if let Some(index) = stray {
        return Err(EngineError::validation(format!(
            "run {} result {} does not match its query set snapshot",
            run.id,
            index + 1
        )));
    }
    Ok(())
}

/// One label per run in run order; repeated system names get a run-id suffix.
pub fn system_labels(runs: &[Run]) -> Vec<String> {
    let mut counts = BTreeMap::<&str, usize>::new();
    for run in runs {
        *counts.entry(run.system_name.as_str()).or_default() += 1;
    }

    runs.iter()
        .map(|run| {
            if counts.get(run.system_name.as_str()).copied().unwrap_or(0) > 1 {
                let suffix = run.id.chars().take(RUN_ID_SUFFIX_CHARS).collect::<String>();
                format!("{}@{suffix}", run.system_name)
            } else {
                run.system_name.clone()
            }
        })
        .collect()
}

async fn evaluate_query(
    context: &EvaluationContext<'_>,
    index: usize,
) -> Result<Evaluation, EngineError> {
    let query = &context.runs[0].results[index].query;
    let ordered = context
        .labels
        .iter()
        .zip(context.runs)
        .map(|(label, run)| (label.as_str(), &run.results[index]))
        .collect::<Vec<(&str, &QueryResult)>>();
    let per_system_results = ordered
        .iter()
        .map(|(label, result)| (label.to_string(), (*result).clone()))
        .collect::<BTreeMap<String, QueryResult>>();

    let mut evaluation = Evaluation {
        query: query.text().to_string(),
        reference: query.reference().map(str::to_string),
        per_system_results,
        winner: Winner::Error,
        scores: BTreeMap::new(),
        analysis: String::new(),
        metadata: Metadata::new(),
    };
    evaluation
        .metadata
        .insert("index".to_string(), Value::from(index));

    if ordered.iter().all(|(_, result)| result.is_error()) {
        debug!(index, "every system failed retrieval; skipping judge");
        evaluation.analysis =
            "every system failed to retrieve for this query; judge not called".to_string();
        evaluation
            .metadata
            .insert("judge_skipped".to_string(), Value::Bool(true));
        return Ok(evaluation);
    }

    let prompt = context.renderer.render(context.domain, query, &ordered);
    let prompt = prompt.as_str();
    let judge = context.judge;
    let started = Instant::now();
    let outcome = context
        .policy
        .run(
            move |_| guarded_complete(judge, prompt),
            |error| judge.classify(error),
            JudgeError::retry_after,
        )
        .await;
    evaluation.metadata.insert(
        "latency_ms".to_string(),
        Value::from(started.elapsed().as_millis() as u64),
    );

    match outcome {
        RetryOutcome::Success { value, attempts } => {
            let parsed = context.parser.parse(&value, context.labels);
            evaluation
                .metadata
                .insert("attempts".to_string(), Value::from(attempts));
            evaluation
                .metadata
                .insert("parse_status".to_string(), Value::from(parsed.status()));
            if let Some(reason) = parsed.reason() {
                warn!(index, status = parsed.status(), reason = %reason, "judge verdict not clean");
                evaluation
                    .metadata
                    .insert("parse_reason".to_string(), Value::from(reason));
            }
            if !matches!(parsed, ParseOutcome::Parsed(_)) {
                evaluation.metadata.insert(
                    "raw_response".to_string(),
                    Value::from(truncate_chars(&value, 2_000)),
                );
            }

            let verdict = parsed.into_verdict();
            evaluation.winner = verdict.winner;
            evaluation.scores = verdict.scores;
            evaluation.analysis = verdict.analysis;
        }
        RetryOutcome::Failed {
            error,
            class,
            attempts,
        } => {
            if class == FailureClass::Fatal {
                return Err(EngineError::comparison(format!(
                    "judge failed on query {} ({}): {error}",
                    index + 1,
                    error.code()
                )));
            }

            warn!(
                index,
                attempts,
                class = class.as_str(),
                error = %error,
                "judge failed; recording error verdict"
            );
            evaluation.winner = Winner::Error;
            evaluation.analysis = format!("judge failed after {attempts} attempt(s): {error}");
            evaluation
                .metadata
                .insert("attempts".to_string(), Value::from(attempts));
            evaluation
                .metadata
                .insert("failure_class".to_string(), Value::from(class.as_str()));
            evaluation
                .metadata
                .insert("error_code".to_string(), Value::from(error.code()));
        }
    }

    Ok(evaluation)
}

// A panicking adapter fails only the query it was judging.
async fn guarded_complete(judge: &dyn Judge, prompt: &str) -> Result<String, JudgeError> {
    AssertUnwindSafe(judge.complete(prompt))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(JudgeError::Panicked(panic_message(panic.as_ref()))))
}
