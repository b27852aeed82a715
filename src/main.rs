//! Command-line interface for mongo-mirror.
//!
//! # Usage Examples
//!
//! ```bash
//! # Initial migration (bulk copy + catch-up update + verification)
//! mongo-mirror --source-uri mongodb://src:27017 --target-uri mongodb://tgt:27017 migrate
//!
//! # Continuous change capture, one worker per collection
//! mongo-mirror cdc --threads auto
//!
//! # Continuous capture with four workers, collections round-robin
//! mongo-mirror cdc --threads 4
//!
//! # Reconcile without writing anything
//! mongo-mirror verify --sample-size 500
//!
//! # One-shot update pass
//! mongo-mirror update
//! ```
//!
//! Connection strings can also come from the `SOURCE_URI` and `TARGET_URI`
//! environment variables.

use std::sync::Arc;

use anyhow::Context;
use checkpoint::FilesystemStore;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::broadcast;

use mongo_mirror::{
    load_collections, verify, BulkCopier, CaptureContext, CaptureWorker, CollectionSpec,
    ConnectionOpts, FailedDocumentSink, MongoSource, MongoTarget, ProgressAggregator, SyncOpts,
    Threads, Verifier, VerifyOptions, VerifyStatus, WorkerPool, WorkerState,
};

#[derive(Parser)]
#[command(name = "mongo-mirror")]
#[command(about = "Migrate and continuously mirror MongoDB collections between deployments")]
#[command(long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionOpts,

    #[command(flatten)]
    sync: SyncOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk copy all collections, then catch up and verify
    Migrate {
        /// Collections copied concurrently
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },

    /// Run continuous change capture workers
    Cdc {
        /// Worker count: "auto" (one per collection) or a fixed number
        #[arg(long, default_value = "auto")]
        threads: String,
    },

    /// Compare source and target without writing
    Verify {
        /// Content-check sample bound per collection
        #[arg(long, default_value = "100")]
        sample_size: usize,
    },

    /// One-shot update pass without continuous capture
    Update,
}

/// Shared handles every mode needs.
struct Engine {
    specs: Vec<CollectionSpec>,
    source: Arc<MongoSource>,
    target: Arc<MongoTarget>,
    progress: ProgressAggregator,
    ctx: CaptureContext,
    sync: SyncOpts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("mongo-mirror starting");

    let engine = connect(&cli).await?;

    let exit_code = match cli.command {
        Commands::Migrate { concurrency } => run_migrate(&engine, concurrency).await?,
        Commands::Cdc { threads } => {
            let threads = Threads::parse(&threads)?;
            run_cdc(&engine, threads).await?
        }
        Commands::Verify { sample_size } => run_verify(&engine, sample_size).await?,
        Commands::Update => run_update(&engine).await?,
    };

    std::process::exit(exit_code);
}

async fn connect(cli: &Cli) -> anyhow::Result<Engine> {
    tracing::info!("validating source database connection");
    let source = Arc::new(MongoSource::connect(&cli.connection.source_uri).await?);
    source.ping().await.context("source database unreachable")?;

    tracing::info!("validating target database connection");
    let target = Arc::new(MongoTarget::connect(&cli.connection.target_uri).await?);
    target.ping().await.context("target database unreachable")?;
    tracing::info!("database connections validated");

    let specs = load_collections(&cli.sync.collections_file)?;
    if specs.is_empty() {
        anyhow::bail!("collection list is empty, nothing to do");
    }

    let progress = ProgressAggregator::new();
    let ctx = CaptureContext {
        source: source.clone(),
        target: target.clone(),
        checkpoints: Arc::new(FilesystemStore::new(&cli.sync.progress_dir)),
        progress: progress.clone(),
        failed: Arc::new(FailedDocumentSink::new(&cli.sync.log_dir)),
        config: cli.sync.capture_config(),
    };

    Ok(Engine {
        specs,
        source,
        target,
        progress,
        ctx,
        sync: cli.sync.clone(),
    })
}

/// Initial migration: concurrent bulk copies, a catch-up update pass for
/// documents written during the copy, then verification.
async fn run_migrate(engine: &Engine, concurrency: usize) -> anyhow::Result<i32> {
    let copier = Arc::new(BulkCopier::new(
        engine.ctx.source.clone(),
        engine.ctx.target.clone(),
        engine.ctx.checkpoints.clone(),
        engine.progress.clone(),
        engine.ctx.failed.clone(),
        engine.sync.retry_policy(),
        engine.sync.batch_size,
    ));

    tracing::info!(
        collections = engine.specs.len(),
        concurrency,
        "starting migration"
    );

    let results: Vec<(String, Result<_, _>)> = futures::stream::iter(engine.specs.clone())
        .map(|spec| {
            let copier = Arc::clone(&copier);
            async move {
                let name = spec.collection.clone();
                (name, copier.run(&spec).await)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut failed_collections = Vec::new();
    for (name, result) in results {
        match result {
            Ok(report) => tracing::info!(
                collection = %name,
                rows_copied = report.rows_copied,
                rows_failed = report.rows_failed,
                "collection migrated"
            ),
            Err(err) => {
                tracing::error!(collection = %name, "migration failed: {err}");
                failed_collections.push(name);
            }
        }
    }
    tracing::info!(
        success = engine.specs.len() - failed_collections.len(),
        failed = failed_collections.len(),
        "migration complete"
    );

    // Catch documents that changed while the copy was running.
    tracing::info!("running catch-up update pass");
    for spec in &engine.specs {
        let mut worker = CaptureWorker::new(engine.ctx.clone(), spec.clone());
        if let Err(err) = worker.update_cycle(true).await {
            tracing::error!(collection = %spec.collection, "catch-up cycle failed: {err}");
            failed_collections.push(spec.collection.clone());
        }
    }

    let mismatches = verify_all(engine, engine.sync.force_refresh, verify::DELETION_SAMPLE).await?;

    Ok(i32::from(!failed_collections.is_empty() || mismatches > 0))
}

/// Continuous CDC until interrupted.
async fn run_cdc(engine: &Engine, threads: Threads) -> anyhow::Result<i32> {
    let (shutdown_tx, _) = broadcast::channel(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("shutdown requested, completing in-flight work");
                    let _ = shutdown_tx.send(());
                }
                Err(err) => tracing::error!("failed to listen for shutdown signal: {err}"),
            }
        });
    }

    let pool = WorkerPool::new(engine.ctx.clone(), threads);
    let states = pool.run(&engine.specs, &shutdown_tx).await;

    for snapshot in engine.progress.snapshot() {
        tracing::info!(
            collection = %snapshot.collection,
            source_count = snapshot.source_count,
            target_count = snapshot.target_count,
            updates = snapshot.updates_applied,
            deletions = snapshot.deletions_applied,
            state = ?snapshot.state,
            "final progress"
        );
    }

    let any_failed =
        states.values().any(|s| *s == WorkerState::Failed) || engine.progress.any_failed();
    Ok(i32::from(any_failed))
}

/// Reconcile every collection and write a verification report.
async fn run_verify(engine: &Engine, sample_size: usize) -> anyhow::Result<i32> {
    let mismatches = verify_all(engine, engine.sync.force_refresh, sample_size).await?;
    Ok(i32::from(mismatches > 0))
}

async fn verify_all(
    engine: &Engine,
    exhaustive: bool,
    sample_size: usize,
) -> anyhow::Result<usize> {
    let verifier = Verifier::new(
        engine.source.clone(),
        engine.target.clone(),
        VerifyOptions {
            sample_size,
            exhaustive,
        },
    );

    let mut results = Vec::new();
    for spec in &engine.specs {
        results.push(verifier.compare(spec).await?);
    }

    let report_path = verify::write_report(&engine.sync.verification_dir, &results)
        .context("failed to write verification report")?;
    tracing::info!("verification report written to {}", report_path.display());

    let mismatches = results
        .iter()
        .filter(|r| r.status != VerifyStatus::Ok)
        .count();
    if mismatches > 0 {
        tracing::warn!(mismatches, "collections failed verification");
    } else {
        tracing::info!("all collections verified successfully");
    }
    Ok(mismatches)
}

/// One full synchronization cycle per collection, then exit.
async fn run_update(engine: &Engine) -> anyhow::Result<i32> {
    let mut total_updates = 0u64;
    let mut total_deletions = 0u64;
    let mut failures = 0usize;

    for spec in &engine.specs {
        let mut worker = CaptureWorker::new(engine.ctx.clone(), spec.clone());
        match worker.update_cycle(true).await {
            Ok(stats) => {
                tracing::info!(
                    collection = %spec.collection,
                    scanned = stats.scanned,
                    updates = stats.updates,
                    deletions = stats.deletions,
                    "update cycle complete"
                );
                total_updates += stats.updates;
                total_deletions += stats.deletions;
            }
            Err(err) => {
                tracing::error!(collection = %spec.collection, "update cycle failed: {err}");
                failures += 1;
            }
        }
    }

    tracing::info!(
        updates = total_updates,
        deletions = total_deletions,
        failures,
        "update operation complete"
    );
    Ok(i32::from(failures > 0))
}
