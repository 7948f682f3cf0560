//! Shardwright Indexing Node
//!
//! Runs the write path against local volumes and in-memory metadata. Reads
//! newline-delimited JSON documents from stdin into one index and keeps the
//! retention, sweep, flush and delete jobs running until stdin closes or the
//! process is signalled.

use shardwright::config::NodeConfig;
use shardwright::metadata::{IndexDoc, LocalMetadataStore};
use shardwright::node::IndexingNode;
use shardwright::partition::PartitionBy;
use shardwright::telemetry::Telemetry;
use shardwright::volume::LocalVolumeAllocator;
use shardwright::writer::{Document, JsonLinesWriterFactory};

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shardwright Indexing Node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name recorded as shard owner
    #[arg(long, env = "SHARDWRIGHT_NODE_NAME")]
    node_name: Option<String>,

    /// Volume directories (comma separated)
    #[arg(long = "volume", env = "SHARDWRIGHT_VOLUMES", value_delimiter = ',')]
    volumes: Vec<PathBuf>,

    /// Name of the index documents are written to
    #[arg(long, default_value = "events")]
    index_name: String,

    /// Partitioning (DAY, WEEK, MONTH, YEAR); unpartitioned when omitted
    #[arg(long)]
    partition_by: Option<String>,

    /// Number of partition units per window
    #[arg(long, default_value = "1")]
    partition_size: u32,

    /// Shards written in parallel per partition
    #[arg(long, default_value = "1")]
    shards_per_partition: usize,

    /// Documents per shard before a new shard is started
    #[arg(long, default_value = "1000000")]
    max_docs_per_shard: u64,

    /// Delete shards whose partition ended this many days ago
    #[arg(long)]
    retention_days: Option<u32>,

    /// Document field holding the event time in epoch millis
    #[arg(long, default_value = "EventTime")]
    time_field: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = Telemetry::init("shardwright-node", &args.log_level)?;

    info!("Starting Shardwright indexing node");

    let mut config = NodeConfig::from_env()?;
    if let Some(node_name) = args.node_name.clone() {
        config.node_name = node_name;
    }
    if !args.volumes.is_empty() {
        config.volume_paths = args.volumes.clone();
    }
    for path in &config.volume_paths {
        tokio::fs::create_dir_all(path).await?;
    }

    let partition_by = args
        .partition_by
        .as_deref()
        .map(str::parse::<PartitionBy>)
        .transpose()?;

    let metadata = Arc::new(LocalMetadataStore::new());
    let index = IndexDoc {
        partition_by,
        partition_size: args.partition_size,
        max_docs_per_shard: args.max_docs_per_shard,
        shards_per_partition: args.shards_per_partition,
        retention_day_age: args.retention_days,
        volume_group: config.default_volume_group.clone(),
        ..IndexDoc::new(uuid::Uuid::new_v4().to_string(), args.index_name.clone())
    };
    let index_uuid = index.uuid.clone();
    metadata.put_index(index);

    let volumes = Arc::new(LocalVolumeAllocator::with_paths(
        &config.default_volume_group,
        &config.node_name,
        config.volume_paths.clone(),
    ));

    let node = Arc::new(IndexingNode::new(
        config,
        metadata.clone(),
        metadata,
        volumes,
        Arc::new(JsonLinesWriterFactory::new()),
    )?);
    node.startup().await?;

    info!(
        node = %node.config().node_name,
        index = %args.index_name,
        index_uuid = %index_uuid,
        volumes = node.config().volume_paths.len(),
        "Indexing node ready"
    );

    let cancel = CancellationToken::new();
    let jobs = {
        let node = node.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { node.run(cancel).await })
    };

    tokio::select! {
        indexed = ingest_stdin(&node, &index_uuid, &args.time_field) => {
            info!(indexed, "Input closed");
        }
        _ = shutdown_signal() => {}
    }

    info!("Indexing node shutting down");
    cancel.cancel();
    jobs.await?;

    Ok(())
}

async fn ingest_stdin(node: &IndexingNode, index_uuid: &str, time_field: &str) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut indexed = 0u64;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let document: Document = match serde_json::from_str(&line) {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "Skipping malformed document");
                continue;
            }
        };
        let event_time = document
            .get(time_field)
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        match node.indexer().index(index_uuid, event_time, &document).await {
            Ok(()) => indexed += 1,
            Err(e) => error!(error = %e, "Failed to index document"),
        }
    }
    indexed
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
