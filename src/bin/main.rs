//! askql CLI - Ask questions against the warehouse
//!
//! Usage:
//!   askql ask "total revenue by month in 2025"
//!   askql sql "top 5 distributors by gross margin"
//!   askql tables
//!   askql load-knowledge
//!   askql cache stats
//!
//! Configuration is read from ASKQL_CONFIG, ./askql.toml or
//! ~/.config/askql/config.toml. The warehouse OAuth token comes from
//! BIGQUERY_TOKEN.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use askql::cache::QueryCache;
use askql::config::Settings;
use askql::embedding::{CachedEmbedder, Embedder, HttpEmbedder};
use askql::knowledge::load_knowledge;
use askql::llm::HttpLlmClient;
use askql::vector::VectorStore;
use askql::warehouse::{BigQueryWarehouse, Warehouse};
use askql::{Engine, Services};

#[derive(Parser)]
#[command(name = "askql")]
#[command(about = "askql - natural-language SQL over an analytic warehouse")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate SQL for a question, execute it and print the rows
    Ask {
        /// The question, in plain language
        question: String,

        /// Use this dataset instead of the configured one
        #[arg(short, long)]
        dataset: Option<String>,
    },

    /// Generate and print SQL without executing it
    Sql {
        /// The question, in plain language
        question: String,

        #[arg(short, long)]
        dataset: Option<String>,
    },

    /// List the tables available to question answering
    Tables,

    /// Reload the knowledge corpus and rebuild the vector index
    LoadKnowledge,

    /// Inspect or clear the local cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print entry counts and on-disk size
    Stats,
    /// Delete every cached entry
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "askql=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ask { question, dataset } => cmd_ask(&question, dataset, true).await,
        Commands::Sql { question, dataset } => cmd_ask(&question, dataset, false).await,
        Commands::Tables => cmd_tables().await,
        Commands::LoadKnowledge => cmd_load_knowledge().await,
        Commands::Cache { command } => cmd_cache(command),
    }
}

fn load_settings() -> Option<Settings> {
    match Settings::load() {
        Ok(settings) => Some(settings),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            None
        }
    }
}

async fn build_engine(settings: Settings) -> Result<Engine, String> {
    let token = std::env::var("BIGQUERY_TOKEN")
        .map_err(|_| "BIGQUERY_TOKEN is not set".to_string())?;

    let cache = Arc::new(QueryCache::open().map_err(|e| e.to_string())?);
    let warehouse: Arc<dyn Warehouse> = Arc::new(
        BigQueryWarehouse::new(&settings.project, &token).map_err(|e| e.to_string())?,
    );
    let llm = Arc::new(HttpLlmClient::new(&settings.llm).map_err(|e| e.to_string())?);
    let embedder: Arc<dyn Embedder> = Arc::new(CachedEmbedder::new(
        HttpEmbedder::new(&settings.embedding).map_err(|e| e.to_string())?,
        cache.clone(),
        settings.cache.ttl_embed_secs,
    ));

    let vectors = Arc::new(VectorStore::new());
    let knowledge = load_knowledge(&settings.knowledge.ttl_dir, &embedder, &vectors)
        .await
        .map_err(|e| format!("knowledge corpus failed to load: {}", e))?;

    Ok(Engine::new(Services {
        settings: Arc::new(settings),
        cache,
        warehouse,
        llm,
        embedder,
        vectors,
        knowledge: Arc::new(knowledge),
    }))
}

async fn cmd_ask(question: &str, dataset: Option<String>, execute: bool) -> ExitCode {
    let Some(settings) = load_settings() else {
        return ExitCode::FAILURE;
    };

    let engine = match build_engine(settings).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Startup error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(dataset) = dataset {
        if let Err(e) = engine.switch_dataset(&dataset).await {
            eprintln!("Dataset switch failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if !execute {
        match engine.generate_sql(question, &[]).await {
            Ok(artifact) => match artifact.sql {
                Some(sql) => {
                    println!("{}", sql);
                    if let Some(error) = artifact.error {
                        eprintln!("Warning: {}", error);
                    }
                    ExitCode::SUCCESS
                }
                None => {
                    eprintln!(
                        "{}",
                        artifact
                            .explanation
                            .or(artifact.error)
                            .unwrap_or_else(|| "data not available".to_string())
                    );
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        }
    } else {
        match engine.generate_and_execute(question, &[]).await {
            Ok((artifact, Some(result))) if result.success => {
                println!("{}", render_table(&result.columns, &result.rows));
                println!();
                println!(
                    "{} rows | {:.4} USD estimated | {}",
                    result.row_count,
                    result.estimated_cost_usd,
                    artifact.sql.as_deref().unwrap_or_default()
                );
                ExitCode::SUCCESS
            }
            Ok((_, Some(result))) => {
                eprintln!(
                    "Execution failed: {}",
                    result.error.unwrap_or_else(|| "unknown error".to_string())
                );
                ExitCode::FAILURE
            }
            Ok((artifact, None)) => {
                eprintln!(
                    "{}",
                    artifact
                        .explanation
                        .or(artifact.error)
                        .unwrap_or_else(|| "data not available".to_string())
                );
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        }
    }
}

async fn cmd_tables() -> ExitCode {
    let Some(settings) = load_settings() else {
        return ExitCode::FAILURE;
    };

    let token = match std::env::var("BIGQUERY_TOKEN") {
        Ok(token) => token,
        Err(_) => {
            eprintln!("BIGQUERY_TOKEN is not set");
            return ExitCode::FAILURE;
        }
    };
    let warehouse = match BigQueryWarehouse::new(&settings.project, &token) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Startup error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match warehouse.list_tables(&settings.dataset).await {
        Ok(tables) => {
            let allowed = &settings.allowed_tables;
            for table in tables {
                if allowed.is_empty() || allowed.contains(&table) {
                    println!("{}", table);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_load_knowledge() -> ExitCode {
    let Some(settings) = load_settings() else {
        return ExitCode::FAILURE;
    };

    let cache = match QueryCache::open() {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            eprintln!("Cache error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let embedder: Arc<dyn Embedder> = match HttpEmbedder::new(&settings.embedding) {
        Ok(inner) => Arc::new(CachedEmbedder::new(
            inner,
            cache,
            settings.cache.ttl_embed_secs,
        )),
        Err(e) => {
            eprintln!("Embedder error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let vectors = VectorStore::new();
    match load_knowledge(&settings.knowledge.ttl_dir, &embedder, &vectors).await {
        Ok(kb) => {
            println!(
                "Loaded {} metrics, {} terms, {} column rules, {} examples from {}",
                kb.metrics.len(),
                kb.terms.len(),
                kb.column_rules.len(),
                kb.examples.len(),
                settings.knowledge.ttl_dir
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_cache(command: CacheCommands) -> ExitCode {
    let cache = match QueryCache::open() {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Cache error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match command {
        CacheCommands::Stats => match cache.stats() {
            Ok(stats) => {
                println!("entries:      {}", stats.entry_count);
                println!("live entries: {}", stats.live_count);
                println!("size (bytes): {}", stats.total_size_bytes);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
        CacheCommands::Clear => match cache.clear_all() {
            Ok(()) => {
                println!("cache cleared");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

/// Minimal fixed-width table rendering for terminal output.
fn render_table(columns: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() && cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:<width$}", c, width = w))
        .collect();
    out.push_str(&header.join(" | "));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in rows {
        out.push('\n');
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = w))
            .collect();
        out.push_str(&cells.join(" | "));
    }
    out
}
