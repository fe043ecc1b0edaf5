use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clippings::config;
use clippings::search::{library_search, LibraryParams, SearchMode, SortDir, SortKey};
use clippings::server;
use clippings::store::Store;

#[derive(Parser)]
#[command(
    name = "clip",
    about = "Clippings — a personal read-it-later knowledge pipeline",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/clip.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Start the HTTP API server
    Serve,

    /// Search the library from the command line
    Search {
        /// Search query
        query: String,

        /// Search mode: fts or semantic
        #[arg(long, default_value = "fts")]
        mode: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Show library and index statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = Store::open(&cfg).await?;
            store.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let store = Store::open(&cfg).await?;
            server::run_server(store, Arc::new(cfg)).await?;
        }
        Commands::Search { query, mode, limit } => {
            let Some(mode) = SearchMode::parse(&mode) else {
                anyhow::bail!("Unknown search mode: {}. Use fts or semantic.", mode);
            };
            let store = Store::open(&cfg).await?;

            let params = LibraryParams {
                query,
                mode,
                sort_by: if mode == SearchMode::Semantic {
                    SortKey::Relevance
                } else {
                    SortKey::SavedAt
                },
                sort_dir: SortDir::Desc,
                limit,
                ..Default::default()
            };

            let results = library_search(&store, &cfg, &params).await?;

            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                let title = result.title.as_deref().unwrap_or("(untitled)");
                match result.distance {
                    Some(distance) => println!("{}. [{:.4}] {}", i + 1, distance, title),
                    None => println!("{}. {}", i + 1, title),
                }
                if let Some(url) = &result.url {
                    println!("    url: {}", url);
                }
                if let Some(saved_at) = &result.saved_at {
                    println!("    saved: {}", saved_at);
                }
                if let Some(chunk) = &result.chunk_text {
                    println!("    excerpt: \"{}\"", chunk.replace('\n', " ").trim());
                }
                println!("    id: {}", result.id);
                println!();
            }

            store.close().await;
        }
        Commands::Stats => {
            let store = Store::open(&cfg).await?;

            let documents = store.count_documents().await?;
            let highlights = store.count_highlights().await?;
            let chunks = store.count_chunks().await?;
            let fetch = store.fetch_stats().await?;
            let embed = store
                .count_chunks_for_embedding(&cfg.embedding.provider, &cfg.embedding.model)
                .await?;

            println!("library");
            println!("  documents: {}", documents);
            println!("  highlights: {}", highlights);
            println!("  chunks: {}", chunks);
            println!("fetch");
            println!("  with fulltext: {}", fetch.with_fulltext);
            println!("  pending: {}", fetch.pending);
            println!("  failed: {}", fetch.failed);
            println!(
                "embeddings ({}/{})",
                cfg.embedding.provider, cfg.embedding.model
            );
            println!("  embedded: {}", embed.embedded);
            println!("  pending: {}", embed.pending);
            println!("  orphaned: {}", embed.orphaned);

            store.close().await;
        }
    }

    Ok(())
}
