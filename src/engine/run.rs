use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Credentials, SystemConfig};
use crate::error::EngineError;
use crate::model::{Metadata, Query, QueryResult, QuerySet, RetrievedChunk, Run, RunStatus};
use crate::registry::ToolRegistry;
use crate::retrieval::Retriever;
use super::panic_message;
use crate::util::{new_entity_id, sha256_json};

/// Called as `(completed, total, query_text)` after each query resolves.
pub type ProgressFn<'a> = dyn Fn(usize, usize, &str) + Send + Sync + 'a;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_workers: usize,
    pub top_k: usize,
    pub per_query_timeout: Option<Duration>,
    pub extra_metadata: Metadata,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            top_k: crate::config::DEFAULT_TOP_K,
            per_query_timeout: None,
            extra_metadata: Metadata::new(),
        }
    }
}

/// Builds retrievers through the registry before any Run exists, so a backend
/// that cannot be constructed never produces a `failed` Run.
pub struct RunEngine<'a> {
    registry: &'a ToolRegistry,
    credentials: Credentials<'a>,
}

impl<'a> RunEngine<'a> {
    pub fn new(registry: &'a ToolRegistry, credentials: Credentials<'a>) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    pub async fn start(
        &self,
        config: &SystemConfig,
        query_set: &QuerySet,
        mut options: RunOptions,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<Run, EngineError> {
        let system = self.registry.build(config, &self.credentials)?;
        let snapshot = serde_json::to_value(config).map_err(|err| {
            EngineError::configuration(format!("system config is not serializable: {err}"))
        })?;

        options.top_k = config.top_k;
        options
            .extra_metadata
            .insert("backend".to_string(), Value::from(config.backend.clone()));

        execute(system, &config.name, query_set, &snapshot, &options, progress).await
    }
}

pub async fn execute(
    system: Arc<dyn Retriever>,
    system_name: &str,
    query_set: &QuerySet,
    system_config_snapshot: &Value,
    options: &RunOptions,
    progress: Option<&ProgressFn<'_>>,
) -> Result<Run, EngineError> {
    validate_options(system_name, options)?;

    let system_config_sha256 = sha256_json(system_config_snapshot)
        .map_err(|err| EngineError::configuration(format!("{err:#}")))?;
    let query_set_sha256 = sha256_json(query_set)
        .map_err(|err| EngineError::configuration(format!("{err:#}")))?;

    let mut metadata = options.extra_metadata.clone();
    metadata.insert(
        "tool_version".to_string(),
        Value::from(env!("CARGO_PKG_VERSION")),
    );
    metadata.insert("max_workers".to_string(), Value::from(options.max_workers));
    metadata.insert("top_k".to_string(), Value::from(options.top_k));
    metadata.insert(
        "per_query_timeout_ms".to_string(),
        options
            .per_query_timeout
            .map(|limit| Value::from(limit.as_millis() as u64))
            .unwrap_or(Value::Null),
    );
    metadata.insert(
        "system_config_sha256".to_string(),
        Value::from(system_config_sha256),
    );
    metadata.insert("query_set_sha256".to_string(), Value::from(query_set_sha256));

    let mut run = Run {
        id: new_entity_id(),
        domain: query_set.domain().to_string(),
        system_name: system_name.to_string(),
        query_set_name: query_set.name().to_string(),
        status: RunStatus::Pending,
        results: Vec::new(),
        system_config_snapshot: system_config_snapshot.clone(),
        query_set_snapshot: query_set.clone(),
        started_at: None,
        completed_at: None,
        metadata,
    };

    run.status = RunStatus::Running;
    run.started_at = Some(Utc::now());
    let started = Instant::now();
    let total = query_set.len();

    info!(
        run_id = %run.id,
        system = %run.system_name,
        query_set = %run.query_set_name,
        domain = %run.domain,
        queries = total,
        max_workers = options.max_workers,
        "run started"
    );

    let semaphore = Arc::new(Semaphore::new(options.max_workers));
    let mut tasks = JoinSet::new();
    for (index, query) in query_set.queries().iter().cloned().enumerate() {
        let system = Arc::clone(&system);
        let semaphore = Arc::clone(&semaphore);
        let top_k = options.top_k;
        let timeout = options.per_query_timeout;
        tasks.spawn(async move {
            let result = run_single_query(system, semaphore, query, top_k, timeout).await;
            (index, result)
        });
    }

    let mut slots: Vec<Option<QueryResult>> = vec![None; total];
    let mut completed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                completed += 1;
                if let Some(error) = result.error.as_deref() {
                    warn!(run_id = %run.id, index, error = %error, "query failed");
                }
                notify_progress(progress, completed, total, result.query.text());
                slots[index] = Some(result);
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "query task ended abnormally");
            }
        }
    }

    run.results = slots
        .into_iter()
        .zip(query_set.queries())
        .map(|(slot, query)| {
            slot.unwrap_or_else(|| {
                QueryResult::failure(
                    query.clone(),
                    "query task ended without reporting a result",
                    0,
                )
            })
        })
        .collect();

    let error_count = run.error_count();
    run.status = RunStatus::from_error_counts(error_count, total);
    run.completed_at = Some(Utc::now());
    run.metadata
        .insert("error_count".to_string(), Value::from(error_count));
    run.metadata.insert(
        "duration_ms".to_string(),
        Value::from(started.elapsed().as_millis() as u64),
    );

    info!(
        run_id = %run.id,
        status = %run.status,
        queries = total,
        errors = error_count,
        duration_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );

    Ok(run)
}

fn validate_options(system_name: &str, options: &RunOptions) -> Result<(), EngineError> {
    if system_name.trim().is_empty() {
        return Err(EngineError::configuration("system name must not be empty"));
    }
    if options.max_workers == 0 {
        return Err(EngineError::configuration("max_workers must be at least 1"));
    }
    if options.top_k == 0 {
        return Err(EngineError::configuration("top_k must be at least 1"));
    }
    if options.per_query_timeout.is_some_and(|limit| limit.is_zero()) {
        return Err(EngineError::configuration(
            "per-query timeout must be positive when set",
        ));
    }
    Ok(())
}

async fn run_single_query(
    system: Arc<dyn Retriever>,
    semaphore: Arc<Semaphore>,
    query: Query,
    top_k: usize,
    timeout: Option<Duration>,
) -> QueryResult {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return QueryResult::failure(query, "worker pool closed before the query started", 0);
    };

    let text = query.text().to_string();
    let started = Instant::now();
    let call = AssertUnwindSafe(system.search(&text, top_k)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return QueryResult::failure(
                    query,
                    format!("timed out after {} ms", limit.as_millis()),
                    elapsed_ms(started),
                );
            }
        },
        None => call.await,
    };
    let duration_ms = elapsed_ms(started);

    match outcome {
        Ok(Ok(chunks)) => match check_chunks(&chunks) {
            Ok(()) => QueryResult::success(query, chunks, duration_ms),
            Err(reason) => {
                QueryResult::failure(query, format!("malformed result: {reason}"), duration_ms)
            }
        },
        Ok(Err(err)) => QueryResult::failure(query, format!("{err:#}"), duration_ms),
        Err(panic) => QueryResult::failure(
            query,
            format!("retriever panicked: {}", panic_message(panic.as_ref())),
            duration_ms,
        ),
    }
}

fn check_chunks(chunks: &[RetrievedChunk]) -> Result<(), String> {
    for (rank, chunk) in chunks.iter().enumerate() {
        if !chunk.score.is_finite() {
            return Err(format!("non-finite score at rank {}", rank + 1));
        }
    }
    Ok(())
}

fn notify_progress(
    progress: Option<&ProgressFn<'_>>,
    completed: usize,
    total: usize,
    text: &str,
) {
    debug!(completed, total, "query resolved");
    let Some(callback) = progress else {
        return;
    };
    let delivered =
        std::panic::catch_unwind(AssertUnwindSafe(|| callback(completed, total, text)));
    if delivered.is_err() {
        warn!(completed, total, "progress callback panicked; continuing run");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests;
