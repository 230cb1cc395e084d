//! evlog-daemon entry point.
//!
//! Thin by design: parses flags/env, wires one Coordinator per track over a
//! shared object store and lock, installs signal handling, and waits for
//! every track to settle before choosing an exit code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use evlog_coordinator::{Coordinator, CoordinatorConfig};
use evlog_lock::DistributedLock;
use evlog_objstore::{ObjectStore, S3ObjectStore};
use evlog_position::PositionStore;
use evlog_puller::{ChronologicalPuller, GraphQlClient};
use evlog_schemas::TrackDef;
use evlog_writer::BufferedWriter;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

/// Upper-bound pagination window used for every track unless overridden per
/// track (§9 Open Question 1: exposed as configuration, soft by default).
const DEFAULT_WINDOW: i64 = 1_000_000;

#[derive(Parser)]
#[command(name = "evlog-daemon", about = "Sidechain event indexer & linker sync sidecar", long_about = None)]
struct Cli {
    /// GraphQL endpoint to pull realm events from.
    #[arg(long, env = "EVLOG_ENDPOINT")]
    endpoint: String,

    /// Object storage bucket backing the event log, track state, and locks.
    #[arg(long, env = "EVLOG_BUCKET")]
    bucket: String,

    /// Custom object-storage endpoint (enables path-style addressing).
    #[arg(long = "object-store-endpoint", env = "EVLOG_OBJECT_STORE_ENDPOINT")]
    object_store_endpoint: Option<String>,

    /// Key prefix applied to every object this process writes or reads.
    #[arg(long, env = "EVLOG_PREFIX")]
    prefix: Option<String>,

    /// One track to index, as `track_id=realm_path[:event_type_prefix]`.
    /// Repeatable.
    #[arg(long = "track", required = true)]
    tracks: Vec<String>,

    /// Poll interval in seconds, used when a pull returns no new events.
    #[arg(long = "poll-interval", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Periodic flush interval in seconds for the buffered writer.
    #[arg(long = "flush-interval", default_value_t = 30)]
    flush_interval_secs: i64,

    /// Flush the writer's buffer once it reaches this many bytes.
    #[arg(long = "flush-bytes", default_value_t = 1_048_576)]
    flush_bytes: usize,

    /// Lease TTL in seconds for each track's distributed lock.
    #[arg(long = "lease-ttl", default_value_t = 30)]
    lease_ttl_secs: u64,

    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn parse_track(spec: &str) -> anyhow::Result<TrackDef> {
    let (track_id, rest) = spec
        .split_once('=')
        .with_context(|| format!("--track must be track_id=realm_path[:event_type_prefix], got `{spec}`"))?;
    let (realm_path, event_type_prefix) = match rest.split_once(':') {
        Some((realm_path, prefix)) => (realm_path.to_string(), Some(prefix.to_string())),
        None => (rest.to_string(), None),
    };
    Ok(TrackDef {
        track_id: track_id.to_string(),
        realm_path,
        event_type_prefix,
        window: DEFAULT_WINDOW,
    })
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

#[tokio::main]
async fn main() {
    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    // Dev convenience; silent if absent, production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let tracks: Vec<TrackDef> = match cli.tracks.iter().map(|s| parse_track(s)).collect::<anyhow::Result<Vec<_>>>() {
        Ok(tracks) => tracks,
        Err(err) => {
            tracing::error!(error = %err, "invalid --track flag");
            return 1;
        }
    };

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(cli.bucket.clone(), cli.object_store_endpoint.clone(), cli.prefix.clone()).await,
    );

    if let Err(err) = store.head_bucket().await {
        tracing::error!(error = %err, bucket = %cli.bucket, "bucket unreachable, refusing to start");
        return 1;
    }

    let lock = Arc::new(DistributedLock::new(Arc::clone(&store)));
    let holder_id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();

    let sigint_received = Arc::new(AtomicBool::new(false));
    {
        let sigint_received = Arc::clone(&sigint_received);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    sigint_received.store(true, Ordering::SeqCst);
                    tracing::info!(signal = "SIGINT", "shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!(signal = "SIGTERM", "shutting down");
                }
            }
            cancel.cancel();
        });
    }

    let mut handles = Vec::new();
    for track in tracks {
        let store = Arc::clone(&store);
        let lock = Arc::clone(&lock);
        let holder_id = holder_id.clone();
        let cancel = cancel.clone();
        let endpoint = cli.endpoint.clone();
        let config = CoordinatorConfig {
            holder_id,
            lease_ttl_secs: cli.lease_ttl_secs,
            poll_interval: Duration::from_secs(cli.poll_interval_secs),
            flush_interval: chrono::Duration::seconds(cli.flush_interval_secs),
            max_restart_attempts: 8,
        };
        let flush_bytes = cli.flush_bytes;

        let handle = tokio::spawn(async move {
            let track_id = track.track_id.clone();
            let transport = Arc::new(GraphQlClient::new(endpoint));
            let puller = Arc::new(ChronologicalPuller::new(
                transport,
                track.realm_path.clone(),
                track.event_type_prefix.clone(),
            ));
            let writer = Arc::new(BufferedWriter::new(Arc::clone(&store), track_id.clone(), flush_bytes, Utc::now()));

            let mut position = match PositionStore::load(Arc::clone(&store), &track_id, Utc::now()).await {
                Ok(p) => p,
                Err(err) => {
                    tracing::error!(track_id = %track_id, error = %err, "failed to load track state");
                    return Err(());
                }
            };

            let (coordinator, _state_rx) = Coordinator::new(track, lock, puller, writer, config, cancel);
            coordinator.run(&mut position).await.map_err(|err| {
                tracing::error!(track_id = %track_id, error = %err, "track gave up after repeated failures");
            })
        });
        handles.push(handle);
    }

    let mut fatal = false;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(())) => fatal = true,
            Err(err) => {
                tracing::error!(error = %err, "track task panicked");
                fatal = true;
            }
        }
    }

    if fatal {
        2
    } else if sigint_received.load(Ordering::SeqCst) {
        130
    } else {
        0
    }
}
