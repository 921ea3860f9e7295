use super::*;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

enum Behavior {
    Answer(Vec<RetrievedChunk>),
    Delay(Duration, Vec<RetrievedChunk>),
    Fail(&'static str),
    Hang,
    Panic,
}

/// Answers from a fixed script keyed by query text; unknown queries fail.
struct ScriptedRetriever {
    script: BTreeMap<String, Behavior>,
}

impl ScriptedRetriever {
    fn new(entries: Vec<(&str, Behavior)>) -> Arc<Self> {
        Arc::new(Self {
            script: entries
                .into_iter()
                .map(|(text, behavior)| (text.to_string(), behavior))
                .collect(),
        })
    }
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        match self.script.get(query) {
            Some(Behavior::Answer(chunks)) => Ok(chunks.iter().take(top_k).cloned().collect()),
            Some(Behavior::Delay(delay, chunks)) => {
                tokio::time::sleep(*delay).await;
                Ok(chunks.clone())
            }
            Some(Behavior::Fail(message)) => bail!("{message}"),
            Some(Behavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(Vec::new())
            }
            Some(Behavior::Panic) => panic!("index corrupted"),
            None => bail!("no script for '{query}'"),
        }
    }
}

/// Tracks the highest number of overlapping `search` calls.
#[derive(Default)]
struct InFlightRetriever {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Retriever for InFlightRetriever {
    async fn search(&self, query: &str, _top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![RetrievedChunk::new(query, 1.0)])
    }
}

fn query_set(texts: &[&str]) -> QuerySet {
    let queries = texts
        .iter()
        .map(|text| Query::new(*text).unwrap())
        .collect::<Vec<Query>>();
    QuerySet::new("pillars", "fiqh", queries).unwrap()
}

fn chunk(content: &str, score: f64) -> RetrievedChunk {
    RetrievedChunk::new(content, score)
}

fn options(max_workers: usize) -> RunOptions {
    RunOptions {
        max_workers,
        top_k: 5,
        per_query_timeout: None,
        extra_metadata: Metadata::new(),
    }
}

fn snapshot() -> Value {
    json!({"name": "bm25", "backend": "scripted", "top_k": 5})
}

#[tokio::test]
async fn every_query_succeeds_and_run_completes() {
    let retriever = ScriptedRetriever::new(vec![
        (
            "What is zakat?",
            Behavior::Answer(vec![chunk("Zakat is obligatory alms.", 3.2)]),
        ),
        (
            "What is hajj?",
            Behavior::Answer(vec![chunk("Hajj is the pilgrimage.", 2.9)]),
        ),
    ]);
    let queries = query_set(&["What is zakat?", "What is hajj?"]);

    let run = execute(retriever, "bm25", &queries, &snapshot(), &options(2), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.domain, "fiqh");
    assert_eq!(run.results.len(), 2);
    assert_eq!(run.results[0].query.text(), "What is zakat?");
    assert_eq!(run.results[1].retrieved[0].content, "Hajj is the pilgrimage.");
    assert!(run.results.iter().all(|result| !result.is_error()));
    assert!(run.is_finished());
    assert!(run.started_at <= run.completed_at);
    assert_eq!(run.metadata.get("error_count"), Some(&Value::from(0)));
    assert!(run.metadata.contains_key("query_set_sha256"));
}

#[tokio::test]
async fn timed_out_query_is_recorded_and_run_is_partial() {
    let retriever = ScriptedRetriever::new(vec![
        (
            "What is zakat?",
            Behavior::Answer(vec![chunk("Zakat is obligatory alms.", 3.2)]),
        ),
        ("What is hajj?", Behavior::Hang),
    ]);
    let queries = query_set(&["What is zakat?", "What is hajj?"]);
    let mut options = options(2);
    options.per_query_timeout = Some(Duration::from_millis(50));

    let run = execute(retriever, "bm25", &queries, &snapshot(), &options, None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    assert!(run.results[0].error.is_none());
    let error = run.results[1].error.as_deref().unwrap();
    assert!(error.contains("timed out"), "unexpected error: {error}");
    assert!(run.results[1].retrieved.is_empty());
}

#[tokio::test]
async fn all_failures_mark_run_failed() {
    let retriever = ScriptedRetriever::new(vec![
        ("What is zakat?", Behavior::Fail("connection refused")),
        ("What is hajj?", Behavior::Fail("connection refused")),
    ]);
    let queries = query_set(&["What is zakat?", "What is hajj?"]);

    let run = execute(retriever, "bm25", &queries, &snapshot(), &options(1), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_count(), 2);
    assert!(
        run.results
            .iter()
            .all(|result| result.error.as_deref() == Some("connection refused"))
    );
}

#[tokio::test]
async fn results_keep_query_order_when_completion_order_differs() {
    let texts = ["q1", "q2", "q3", "q4"];
    let retriever = ScriptedRetriever::new(
        texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let delay = Duration::from_millis(80 - 20 * index as u64);
                (*text, Behavior::Delay(delay, vec![chunk(text, 1.0)]))
            })
            .collect(),
    );
    let queries = query_set(&texts);

    let run = execute(retriever, "bm25", &queries, &snapshot(), &options(4), None)
        .await
        .unwrap();

    let order = run
        .results
        .iter()
        .map(|result| result.query.text())
        .collect::<Vec<&str>>();
    assert_eq!(order, texts);
    for result in &run.results {
        assert_eq!(result.retrieved[0].content, result.query.text());
    }
}

#[tokio::test]
async fn worker_ceiling_bounds_concurrent_searches() {
    let retriever = Arc::new(InFlightRetriever::default());
    let texts = (0..20).map(|index| format!("question {index}")).collect::<Vec<String>>();
    let refs = texts.iter().map(String::as_str).collect::<Vec<&str>>();
    let queries = query_set(&refs);

    let run = execute(
        Arc::clone(&retriever) as Arc<dyn Retriever>,
        "bm25",
        &queries,
        &snapshot(),
        &options(3),
        None,
    )
    .await
    .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(retriever.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn panicking_retriever_only_fails_its_own_query() {
    let retriever = ScriptedRetriever::new(vec![
        ("What is zakat?", Behavior::Panic),
        (
            "What is hajj?",
            Behavior::Answer(vec![chunk("Hajj is the pilgrimage.", 2.9)]),
        ),
    ]);
    let queries = query_set(&["What is zakat?", "What is hajj?"]);

    let run = execute(retriever, "bm25", &queries, &snapshot(), &options(2), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    let error = run.results[0].error.as_deref().unwrap();
    assert!(error.contains("panicked"));
    assert!(error.contains("index corrupted"));
    assert!(!run.results[1].is_error());
}

#[tokio::test]
async fn non_finite_scores_are_reported_as_malformed() {
    let retriever = ScriptedRetriever::new(vec![(
        "What is zakat?",
        Behavior::Answer(vec![chunk("ok", 1.0), chunk("broken", f64::NAN)]),
    )]);
    let queries = query_set(&["What is zakat?"]);

    let run = execute(retriever, "bm25", &queries, &snapshot(), &options(1), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.results[0].error.as_deref().unwrap();
    assert!(error.contains("malformed"));
    assert!(error.contains("rank 2"));
}

#[tokio::test]
async fn progress_reports_each_completion_and_survives_callback_panics() {
    let retriever = ScriptedRetriever::new(vec![
        ("q1", Behavior::Answer(vec![chunk("a", 1.0)])),
        ("q2", Behavior::Answer(vec![chunk("b", 1.0)])),
        ("q3", Behavior::Answer(vec![chunk("c", 1.0)])),
    ]);
    let queries = query_set(&["q1", "q2", "q3"]);

    let seen = Mutex::new(Vec::<(usize, usize)>::new());
    let record: &ProgressFn<'_> = &|completed: usize, total: usize, _text: &str| {
        seen.lock().unwrap().push((completed, total));
        if completed == 2 {
            panic!("progress bar broke");
        }
    };

    let run = execute(
        retriever,
        "bm25",
        &queries,
        &snapshot(),
        &options(2),
        Some(record),
    )
    .await
    .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
}

#[tokio::test]
async fn snapshots_are_independent_of_caller_values() {
    let retriever = ScriptedRetriever::new(vec![(
        "What is zakat?",
        Behavior::Answer(vec![chunk("Zakat is obligatory alms.", 3.2)]),
    )]);
    let queries = query_set(&["What is zakat?"]);
    let mut config = snapshot();

    let run = execute(retriever, "bm25", &queries, &config, &options(1), None)
        .await
        .unwrap();
    config["top_k"] = Value::from(99);

    assert_eq!(run.system_config_snapshot["top_k"], Value::from(5));
    assert_eq!(run.query_set_snapshot, queries);
}

#[tokio::test]
async fn zero_workers_is_rejected_before_any_query_runs() {
    let retriever = Arc::new(InFlightRetriever::default());
    let queries = query_set(&["What is zakat?"]);

    let err = execute(
        Arc::clone(&retriever) as Arc<dyn Retriever>,
        "bm25",
        &queries,
        &snapshot(),
        &options(0),
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::Configuration(_)));
    assert_eq!(retriever.peak.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn engine_builds_backend_from_registry_and_records_it() {
    let mut registry = ToolRegistry::new();
    registry.register("scripted", |_, _| {
        Ok(ScriptedRetriever::new(vec![(
            "What is zakat?",
            Behavior::Answer(vec![chunk("Zakat is obligatory alms.", 3.2)]),
        )]) as Arc<dyn Retriever>)
    });
    let overrides = BTreeMap::new();
    let environment = BTreeMap::<String, String>::new();
    let engine = RunEngine::new(&registry, Credentials::new(&overrides, &environment));

    let config: SystemConfig =
        serde_json::from_value(json!({"name": "bm25", "backend": "scripted", "top_k": 3}))
            .unwrap();
    let run = engine
        .start(&config, &query_set(&["What is zakat?"]), RunOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(run.system_name, "bm25");
    assert_eq!(run.metadata.get("backend"), Some(&Value::from("scripted")));
    assert_eq!(run.metadata.get("top_k"), Some(&Value::from(3)));
    assert_eq!(run.system_config_snapshot["backend"], "scripted");
}

#[tokio::test]
async fn unknown_backend_fails_without_producing_a_run() {
    let registry = ToolRegistry::with_builtin_backends();
    let overrides = BTreeMap::new();
    let environment = BTreeMap::<String, String>::new();
    let engine = RunEngine::new(&registry, Credentials::new(&overrides, &environment));

    let config: SystemConfig =
        serde_json::from_value(json!({"name": "vec", "backend": "pinecone"})).unwrap();
    let err = engine
        .start(&config, &query_set(&["What is zakat?"]), RunOptions::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Configuration(_)));
}
