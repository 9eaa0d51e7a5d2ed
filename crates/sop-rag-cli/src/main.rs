use std::path::{Path, PathBuf};

use anyhow::Context;
use ask_server::{
    services::answer::generator_from_settings,
    state::{open_ask_service, open_embedder},
};
use clap::{Args, Parser, Subcommand};
use common::{AppConfig, AskParams, VectorBackend};
use search_core::{
    AttributeFilter, ChunkingConfig, IndexMeta, RetrievalDefaults, RetrievalParams, StoragePaths,
    build_indexes, open_retriever, read_jsonl, records_to_chunks, storage::open_lexical,
};
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "sop-rag")]
#[command(about = "Build and query the hybrid troubleshooting index")]
struct Cli {
    /// TOML config file; missing files fall back to defaults.
    #[arg(long, global = true, default_value = "sop-rag.toml")]
    config: PathBuf,
    /// Overrides the configured storage directory.
    #[arg(long, global = true)]
    storage: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reads prepared JSONL records and writes bm25.json, the dense index and meta.json.
    BuildIndex {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        backend: Option<VectorBackend>,
        #[arg(long, default_value_t = ChunkingConfig::default().chunk_size)]
        chunk_size: usize,
        #[arg(long, default_value_t = ChunkingConfig::default().chunk_overlap)]
        chunk_overlap: usize,
    },
    /// Runs hybrid retrieval and prints the fused ranking with debug details.
    Search {
        query: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Runs the full ask flow, including the query cache.
    Ask {
        question: String,
        #[command(flatten)]
        scope: ScopeArgs,
        /// Print the whole result as JSON instead of the markdown answer.
        #[arg(long)]
        json: bool,
    },
    /// Prints meta.json and lexical index statistics.
    Inspect,
}

#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long = "component")]
    components: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    fetch_k: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .json()
        .init();

    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(storage) = &cli.storage {
        point_at_storage(&mut config, storage);
    }

    match cli.command {
        Commands::BuildIndex {
            data,
            backend,
            chunk_size,
            chunk_overlap,
        } => {
            if let Some(backend) = backend {
                config.vector_backend = backend;
            }
            build_index(
                &config,
                &data,
                ChunkingConfig {
                    chunk_size,
                    chunk_overlap,
                },
            )
            .await
        }
        Commands::Search { query, scope } => search(&config, &query, &scope).await,
        Commands::Ask {
            question,
            scope,
            json,
        } => ask(&config, question, scope, json).await,
        Commands::Inspect => inspect(&config),
    }
}

/// Moves the index and its query cache together, so answers cached for one storage
/// directory are never served for another.
fn point_at_storage(config: &mut AppConfig, storage: &Path) {
    config.storage_dir = storage.display().to_string();
    config.cache.dir = storage.join("cache").display().to_string();
}

async fn build_index(config: &AppConfig, data: &Path, chunking: ChunkingConfig) -> anyhow::Result<()> {
    let records = read_jsonl(data).with_context(|| format!("failed to read {}", data.display()))?;
    let chunks = records_to_chunks(&records, chunking);
    let meta = build_indexes(config, open_embedder(config)?, chunks, records.len()).await?;
    println!(
        "built index: backend={} records={} chunks={} storage={}",
        meta.backend, meta.n_records, meta.n_chunks, config.storage_dir
    );
    Ok(())
}

async fn search(config: &AppConfig, query: &str, scope: &ScopeArgs) -> anyhow::Result<()> {
    let retriever = open_retriever(config, open_embedder(config)?)
        .with_context(|| format!("failed to open indexes under {}", config.storage_dir))?;
    let filter = AttributeFilter::new(Some(&scope.components), Some(&scope.tags));
    let params = RetrievalParams::resolve(
        &RetrievalDefaults::from(&config.retrieval),
        scope.top_k,
        scope.fetch_k,
    );
    let retrieval = retriever.retrieve(query, params, &filter).await?;

    let results = retrieval
        .fused
        .iter()
        .map(|f| {
            serde_json::json!({
                "key": f.key,
                "rrf_score": f.rrf_score,
                "source_id": f.chunk.meta.source_id,
                "chunk_index": f.chunk.meta.chunk_index,
                "component": f.chunk.meta.component,
                "tags": f.chunk.meta.tags,
                "title": f.chunk.meta.title,
                "snippet": f.chunk.snippet(),
            })
        })
        .collect::<Vec<_>>();
    let output = serde_json::json!({
        "query": query,
        "top_k": params.top_k,
        "fetch_k": params.fetch_k,
        "results": results,
        "debug": retrieval.debug,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn ask(config: &AppConfig, question: String, scope: ScopeArgs, json: bool) -> anyhow::Result<()> {
    let service = open_ask_service(
        config,
        open_embedder(config)?,
        generator_from_settings(&config.llm)?,
    )?;
    let result = service
        .ask(AskParams {
            components: Some(scope.components),
            tags: Some(scope.tags),
            top_k: scope.top_k,
            fetch_k: scope.fetch_k,
            debug: json,
            ..AskParams::new(question)
        })
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.answer_md);
        for (i, source) in result.sources.iter().enumerate() {
            println!(
                "[{}] {} ({}, rrf={:.4})",
                i + 1,
                source.title,
                source.component,
                source.rrf_score
            );
        }
    }
    Ok(())
}

fn inspect(config: &AppConfig) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&config.storage_dir);
    let meta = IndexMeta::read(&paths.meta())
        .with_context(|| format!("no index metadata under {}", config.storage_dir))?;
    let lexical = open_lexical(config)?;
    let output = serde_json::json!({
        "meta": meta,
        "lexical": lexical.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
