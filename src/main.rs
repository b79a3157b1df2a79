//! likeness-db CLI
//!
//! # Usage
//!
//! ```bash
//! # Start the server
//! likeness-db serve --data-dir data --port 8080
//!
//! # Rebuild the snapshot from data/images
//! likeness-db rebuild --data-dir data
//!
//! # Ask a running server for the images closest to a file
//! likeness-db search --image query.png -k 5
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use likeness_core::embed::MAX_HISTOGRAM_DIM;
use likeness_core::{ByteHistogramEmbedder, SearchStrategy, SnapshotStore};
use likeness_db::config::{ServiceConfig, DEFAULT_DIM, DEFAULT_IDENTIFIER_PREFIX};
use likeness_db::server::{serve, ErrorResponse, FindResponse};
use likeness_db::Coordinator;

#[derive(Parser)]
#[command(name = "likeness-db")]
#[command(about = "A persistent image-similarity index")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct IndexArgs {
    /// Data directory (holds images/ and index/)
    #[arg(long, env = "LIKENESS_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Feature vector dimension
    #[arg(
        long,
        env = "LIKENESS_DIM",
        default_value_t = DEFAULT_DIM,
        value_parser = parse_dim
    )]
    dim: usize,

    /// Search strategy: flat (exact) or hnsw (approximate)
    #[arg(long, env = "LIKENESS_STRATEGY", default_value = "flat")]
    strategy: SearchStrategy,

    /// HNSW M parameter (max neighbors per layer)
    #[arg(long, default_value = "16")]
    m: usize,

    /// HNSW ef_construction parameter (search depth during build)
    #[arg(long, default_value = "100")]
    ef_construction: usize,

    /// HNSW ef parameter at query time
    #[arg(long, default_value = "64")]
    ef_search: usize,

    /// Write a full snapshot every N inserts (the append log covers the rest)
    #[arg(long, env = "LIKENESS_SNAPSHOT_EVERY", default_value = "1")]
    snapshot_every: usize,

    /// Prefix joined to stored image names to form identifiers
    #[arg(long, default_value = DEFAULT_IDENTIFIER_PREFIX)]
    identifier_prefix: String,
}

impl IndexArgs {
    fn into_config(self) -> ServiceConfig {
        let mut config = ServiceConfig::from_data_dir(self.data_dir, self.dim);
        config.strategy = self.strategy;
        config.hnsw_m = self.m;
        config.hnsw_ef_construction = self.ef_construction;
        config.hnsw_ef_search = self.ef_search;
        config.snapshot_every = self.snapshot_every.max(1);
        config.identifier_prefix = self.identifier_prefix;
        config
    }
}

fn parse_dim(value: &str) -> Result<usize, String> {
    let dim: usize = value
        .parse()
        .map_err(|_| format!("`{}` is not a dimension", value))?;
    if !(1..=MAX_HISTOGRAM_DIM).contains(&dim) {
        return Err(format!("dimension must be in 1..={}", MAX_HISTOGRAM_DIM));
    }
    Ok(dim)
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[command(flatten)]
        index: IndexArgs,

        /// Server port
        #[arg(short, long, env = "LIKENESS_PORT", default_value = "8080")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Largest accepted upload in bytes
        #[arg(long, default_value_t = likeness_db::config::DEFAULT_MAX_UPLOAD_BYTES)]
        max_upload_bytes: usize,
    },

    /// Rebuild the index snapshot from the images directory
    Rebuild {
        #[command(flatten)]
        index: IndexArgs,
    },

    /// Display statistics about a persisted index
    Stats {
        /// Data directory (holds images/ and index/)
        #[arg(long, env = "LIKENESS_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
    },

    /// Find similar images using the HTTP server
    Search {
        /// Server URL
        #[arg(long, default_value = "http://localhost:8080")]
        server: String,

        /// Query image (PNG or JPEG)
        #[arg(short, long)]
        image: PathBuf,

        /// Number of results
        #[arg(short = 'k', long, default_value = "5")]
        k: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            index,
            port,
            host,
            max_upload_bytes,
        } => {
            let mut config = index.into_config();
            config.max_upload_bytes = max_upload_bytes;
            let embedder = Arc::new(ByteHistogramEmbedder::new(config.dim));
            let coordinator = Arc::new(Coordinator::new(config, embedder));

            let starter = coordinator.clone();
            let report = tokio::task::spawn_blocking(move || starter.start())
                .await
                .context("startup task panicked")??;
            tracing::info!(
                source = ?report.source,
                vectors = report.vectors,
                skipped = report.skipped.len(),
                "index loaded"
            );
            for skipped in &report.skipped {
                tracing::warn!(file = %skipped.file_name, reason = %skipped.reason, "image not indexed");
            }

            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("invalid listen address {}:{}", host, port))?;
            serve(coordinator, addr).await?;
        }

        Commands::Rebuild { index } => {
            let config = index.into_config();
            let embedder = ByteHistogramEmbedder::new(config.dim);
            let params = config.index_params();

            tracing::info!("Rebuilding index from {:?}", config.images_dir);
            let (rebuilt, report) = SnapshotStore::rebuild_from_directory(
                &config.images_dir,
                &embedder,
                &params,
                &config.identifier_prefix,
            )?;
            let mut snapshots = SnapshotStore::open(&config.index_dir)?;
            snapshots
                .save(&rebuilt)
                .with_context(|| format!("writing snapshot to {:?}", config.index_dir))?;

            println!("Rebuilt index in {:?}", config.index_dir);
            println!("  Images scanned: {}", report.scanned);
            println!("  Indexed: {}", report.indexed);
            println!("  Skipped: {}", report.skipped.len());
            for skipped in &report.skipped {
                println!("    {}: {}", skipped.file_name, skipped.reason);
            }
        }

        Commands::Stats { data_dir } => {
            let index_dir = data_dir.join("index");
            let snapshots = SnapshotStore::open(&index_dir)?;
            let summary = snapshots
                .describe()
                .with_context(|| format!("reading snapshot in {:?}", index_dir))?;
            println!("Index Directory: {:?}", index_dir);
            println!("  Vectors: {}", summary.count);
            println!("  Dimensions: {}", summary.dim);
            println!("  Strategy: {}", summary.strategy);
            println!(
                "  Blob Size: {:.2} MB",
                summary.blob_bytes as f64 / (1024.0 * 1024.0)
            );
            println!("  Blob SHA-256: {}", summary.blob_sha256);
            match summary.log_base {
                Some(base) => println!(
                    "  Append Log: {} records on top of {}",
                    summary.log_records, base
                ),
                None => println!("  Append Log: none"),
            }
        }

        Commands::Search { server, image, k } => {
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("reading {:?}", image))?;
            let file_name = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "query.png".to_string());
            let mime = match image.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") => {
                    "image/jpeg"
                }
                _ => "image/png",
            };

            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime)?;
            let form = reqwest::multipart::Form::new().part("file", part);
            let url = format!("{}/api/find_similar?k={}", server.trim_end_matches('/'), k);

            let client = reqwest::Client::new();
            let response = client.post(&url).multipart(form).send().await?;

            if !response.status().is_success() {
                let status = response.status();
                let error: ErrorResponse = response.json().await?;
                eprintln!("Error ({}): {} [{}]", status, error.error, error.code);
                std::process::exit(1);
            }

            let result: FindResponse = response.json().await?;
            println!("Query time: {:.2}ms", result.query_time_ms);
            println!("Results:");
            for res in result.results {
                println!("  {}  distance {:.6}", res.path, res.distance);
            }
        }
    }

    Ok(())
}
