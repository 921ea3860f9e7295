use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Credentials, SystemConfig};
use crate::error::EngineError;
use crate::retrieval::{http, sqlite_fts, HttpSearchRetriever, Retriever, SqliteFtsRetriever};

pub type RetrieverFactory = Box<
    dyn Fn(&SystemConfig, &Credentials<'_>) -> Result<Arc<dyn Retriever>, EngineError>
        + Send
        + Sync,
>;

/// Backend-type name to constructor mapping, built once and passed by reference.
#[derive(Default)]
pub struct ToolRegistry {
    factories: BTreeMap<String, RetrieverFactory>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::new();
        registry.register(sqlite_fts::BACKEND_NAME, |config, _credentials| {
            Ok(Arc::new(SqliteFtsRetriever::from_config(config)?) as Arc<dyn Retriever>)
        });
        registry.register(http::BACKEND_NAME, |config, credentials| {
            Ok(Arc::new(HttpSearchRetriever::from_config(config, credentials)?)
                as Arc<dyn Retriever>)
        });
        registry
    }

    pub fn register<F>(&mut self, backend: &str, factory: F)
    where
        F: Fn(&SystemConfig, &Credentials<'_>) -> Result<Arc<dyn Retriever>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(backend.trim().to_ascii_lowercase(), Box::new(factory));
    }

    pub fn backends(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Unknown backend types are configuration errors; a failing factory surfaces
    /// as whatever the factory reports (typically `EngineError::Run`).
    pub fn build(
        &self,
        config: &SystemConfig,
        credentials: &Credentials<'_>,
    ) -> Result<Arc<dyn Retriever>, EngineError> {
        let key = config.backend.trim().to_ascii_lowercase();
        let factory = self.factories.get(&key).ok_or_else(|| {
            EngineError::configuration(format!(
                "unknown backend '{}' for system '{}'; registered: {}",
                config.backend,
                config.name,
                self.backends().join(", ")
            ))
        })?;
        factory(config, credentials)
    }
}
