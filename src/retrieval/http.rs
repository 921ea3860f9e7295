use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use super::Retriever;
use crate::config::{Credentials, SystemConfig};
use crate::error::EngineError;
use crate::model::{Metadata, RetrievedChunk};

pub const BACKEND_NAME: &str = "http";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const CONTENT_KEYS: &[&str] = &["content", "text", "chunk", "page_content"];
const SCORE_KEYS: &[&str] = &["score", "similarity", "relevance_score", "_score"];
const LIST_KEYS: &[&str] = &["results", "chunks", "documents", "hits", "data"];
const PROVENANCE_KEYS: &[&str] = &["source_id", "doc_id", "chunk_id", "id", "url", "title"];

/// JSON search endpoint: `POST {url}` with `{"query", "top_k"}`.
#[derive(Debug, Clone)]
pub struct HttpSearchRetriever {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
}

impl HttpSearchRetriever {
    pub fn new(url: impl Into<String>, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .context("api key contains characters not allowed in a header")?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(
        config: &SystemConfig,
        credentials: &Credentials<'_>,
    ) -> Result<Self, EngineError> {
        let url = config.require_str("url")?;
        let api_key = match config.option_str("api_key_env") {
            Some(env_name) => Some(credentials.resolve(env_name).ok_or_else(|| {
                EngineError::configuration(format!(
                    "system '{}' needs credential '{env_name}' but it is not set",
                    config.name
                ))
            })?),
            None => None,
        };
        let timeout = Duration::from_millis(
            config
                .option_u64("request_timeout_ms")
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        );

        Self::new(url, api_key.as_deref(), timeout)
            .map_err(|err| EngineError::run(format!("{err:#}")))
    }
}

#[async_trait]
impl Retriever for HttpSearchRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let response = self
            .client
            .post(&self.url)
            .json(&SearchRequest { query, top_k })
            .send()
            .await
            .with_context(|| format!("search request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "search endpoint returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            );
        }

        let payload: Value = response
            .json()
            .await
            .context("search endpoint returned invalid json")?;
        let mut chunks = parse_search_payload(&payload)?;
        chunks.truncate(top_k);
        Ok(chunks)
    }
}

fn parse_search_payload(payload: &Value) -> Result<Vec<RetrievedChunk>> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(object) => LIST_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_array))
            .context("search response has no result list")?,
        _ => bail!("search response must be a json object or array"),
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_search_item(index, item))
        .collect()
}

fn parse_search_item(index: usize, item: &Value) -> Result<RetrievedChunk> {
    let object = item
        .as_object()
        .with_context(|| format!("search result {index} is not an object"))?;

    let content = CONTENT_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .with_context(|| format!("search result {index} has no text content"))?;
    let score = SCORE_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_f64))
        .unwrap_or(0.0);

    let mut metadata = Metadata::new();
    if let Some(Value::Object(extra)) = object.get("metadata") {
        for (key, value) in extra {
            metadata.insert(key.clone(), value.clone());
        }
    }
    for key in PROVENANCE_KEYS {
        if let Some(value) = object.get(*key) {
            metadata.entry(key.to_string()).or_insert_with(|| value.clone());
        }
    }

    Ok(RetrievedChunk {
        content: content.to_string(),
        score,
        metadata,
    })
}
