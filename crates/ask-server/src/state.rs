use std::sync::Arc;

use anyhow::Context;
use common::AppConfig;
use embeddings::{Embedder, EmbeddingConfig, EmbeddingEngine};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use search_core::{
    DenseEngine, LexicalStats, RetrievalDefaults, StoragePaths, open_retriever, read_meta,
};
use serde::Serialize;

use crate::services::{
    answer::{AnswerGenerator, generator_from_settings},
    ask::{AskError, AskService},
    cache::QueryCache,
};

#[derive(Clone)]
pub struct AppState {
    pub metrics: PrometheusHandle,
    pub api_token: Option<String>,
    pub config: Arc<AppConfig>,
    pub embedder: Arc<dyn Embedder>,
    pub ask: Arc<AskService<DenseEngine>>,
}

#[derive(Debug, Serialize)]
pub struct ReloadSummary {
    pub index_id: String,
    pub n_chunks: usize,
    pub lexical: LexicalStats,
}

impl AppState {
    /// Opens the persisted indexes and installs the global Prometheus recorder.
    ///
    /// Fails when the indexes are missing or were built with a different embedder.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install prometheus recorder")?;
        let generator = generator_from_settings(&config.llm)?;
        Self::assemble(config, handle, generator)
    }

    /// Same wiring without touching the global recorder.
    pub fn for_tests(config: AppConfig, generator: Arc<dyn AnswerGenerator>) -> anyhow::Result<Self> {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self::assemble(config, recorder.handle(), generator)
    }

    fn assemble(
        config: AppConfig,
        metrics: PrometheusHandle,
        generator: Arc<dyn AnswerGenerator>,
    ) -> anyhow::Result<Self> {
        let embedder = open_embedder(&config)?;
        let ask = open_ask_service(&config, Arc::clone(&embedder), generator)?;
        Ok(Self {
            metrics,
            api_token: config.server.api_token.clone().filter(|t| !t.is_empty()),
            config: Arc::new(config),
            embedder,
            ask: Arc::new(ask),
        })
    }

    pub fn storage(&self) -> StoragePaths {
        StoragePaths::new(&self.config.storage_dir)
    }

    /// Reopens both persisted indexes from storage and swaps them in as one retriever.
    pub async fn reload_indexes(&self) -> Result<ReloadSummary, AskError> {
        let meta = read_meta(&self.config)?;
        let retriever = open_retriever(&self.config, Arc::clone(&self.embedder))?;
        let lexical = retriever.lexical().stats();
        self.ask.swap_index(retriever, &meta.index_id).await;
        tracing::info!(
            storage = %self.config.storage_dir,
            index_id = %meta.index_id,
            chunks = meta.n_chunks,
            "indexes reloaded"
        );
        Ok(ReloadSummary {
            index_id: meta.index_id,
            n_chunks: meta.n_chunks,
            lexical,
        })
    }
}

pub fn open_embedder(config: &AppConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    let engine = EmbeddingEngine::new(EmbeddingConfig::from(&config.embedding));
    if !engine.is_available() {
        anyhow::bail!(
            "embedding model unavailable at {}; set SOP_RAG_ALLOW_PSEUDO_EMBED=true only for offline testing",
            config.embedding.model_path
        );
    }
    Ok(Arc::new(engine))
}

/// Opens the persisted indexes and the query cache behind one ask service.
pub fn open_ask_service(
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn AnswerGenerator>,
) -> anyhow::Result<AskService<DenseEngine>> {
    let retriever = open_retriever(config, embedder)
        .with_context(|| format!("failed to open indexes under {}", config.storage_dir))?;
    let meta = read_meta(config)
        .with_context(|| format!("failed to read index metadata under {}", config.storage_dir))?;
    let cache = QueryCache::from_settings(&config.cache).context("failed to open query cache")?;
    Ok(AskService::new(
        retriever,
        RetrievalDefaults::from(&config.retrieval),
        cache,
        generator,
    )
    .with_index_id(&meta.index_id))
}
