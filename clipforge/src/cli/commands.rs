//! Command executors.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{ProcessArgs, QueueCommands, RunArgs};
use crate::config::RunConfig;
use crate::database::models::JobStatus;
use crate::database::repositories::{ManifestRepository, SqlxManifestRepository};
use crate::database::{database_url, init_pool, init_write_pool, run_migrations};
use crate::fingerprint;
use crate::pipeline::worker_pool::{RunStats, WorkerPool, WorkerPoolConfig};
use crate::pipeline::{ClipPipeline, JobPipeline};
use crate::queue::{QueueCoordinator, ResolveOptions};
use crate::runner::RunnerPolicy;
use crate::scan::{ScanOptions, scan_inputs};
use crate::Result;

/// Open both pools, migrate, and wrap them in the repository.
async fn open_manifest(db_path: &Path) -> Result<Arc<SqlxManifestRepository>> {
    let url = database_url(db_path);
    let read = init_pool(&url).await?;
    let write = init_write_pool(&url).await?;
    run_migrations(&read).await?;
    Ok(Arc::new(SqlxManifestRepository::new(read, write)))
}

fn runner_policy(config: &RunConfig) -> RunnerPolicy {
    RunnerPolicy {
        global_timeout: std::time::Duration::from_secs(config.queue.global_timeout_s),
        stall_timeout: std::time::Duration::from_secs(config.queue.stall_timeout_s),
        kill_grace: std::time::Duration::from_secs(config.queue.kill_grace_s),
        write_failure_artifacts: true,
    }
}

/// Drain the queue with a worker pool wired to ctrl-c.
async fn run_workers(
    manifest: Arc<SqlxManifestRepository>,
    config: &RunConfig,
    run_args: &RunArgs,
) -> Result<RunStats> {
    let pipeline = ClipPipeline::new(config.clone(), &run_args.output, runner_policy(config));
    let kill_switch = pipeline.kill_switch();
    let pipeline: Arc<dyn JobPipeline> = Arc::new(pipeline);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after in-flight jobs");
                cancel.cancel();
                kill_switch.cancel();
            }
        });
    }

    let pool_config = WorkerPoolConfig {
        workers: run_args.workers.unwrap_or(config.queue.workers).max(1),
        heartbeat_interval: config.queue.heartbeat_interval(),
        max_jobs: run_args.max_jobs,
        ..Default::default()
    };

    let pool = WorkerPool::new(manifest, pipeline, pool_config, cancel);
    pool.run().await
}

fn print_run_summary(stats: &RunStats) {
    println!("run summary:");
    println!("  processed: {}", stats.processed);
    println!("  succeeded: {}", stats.succeeded);
    println!("  skipped:   {} (no events)", stats.skipped);
    println!("  retried:   {}", stats.retried);
    println!("  failed:    {}", stats.failed);
}

/// `process`: scan, resolve, and (unless told otherwise) drain.
pub async fn process(db_path: &Path, args: &ProcessArgs) -> Result<i32> {
    let config = RunConfig::load(args.run.config.as_deref())?;
    let config_fp = fingerprint::payload_fingerprint(&config.fingerprint_payload()?);

    let manifest = open_manifest(db_path).await?;

    let scan_options = ScanOptions {
        recursive: args.recursive,
        extensions: args.ext.clone(),
        limit: args.limit,
    };
    let artifacts = scan_inputs(&args.input, &scan_options)?;
    info!(count = artifacts.len(), "discovered artifacts");

    let coordinator = QueueCoordinator::new(manifest.clone());
    let resolve_options = ResolveOptions {
        force: args.force,
        max_attempts: config.queue.max_attempts,
        priority: 0,
        stale_timeout: config.queue.stale_timeout(),
    };
    let resolve = coordinator
        .resolve_batch(&artifacts, &config_fp, &resolve_options)
        .await?;

    println!(
        "resolved {} artifacts: {} enqueued, {} cache hits, {} dirty, {} errors",
        resolve.total(),
        resolve.enqueued,
        resolve.cache_hits,
        resolve.dirty,
        resolve.errors
    );

    if args.no_process {
        return Ok(0);
    }

    let stats = run_workers(manifest, &config, &args.run).await?;
    print_run_summary(&stats);
    Ok(if stats.failed > 0 { 1 } else { 0 })
}

/// `queue <subcommand>`.
pub async fn queue(db_path: &Path, command: &QueueCommands) -> Result<i32> {
    let manifest = open_manifest(db_path).await?;

    match command {
        QueueCommands::Status => {
            let counts = manifest.counts().await?;
            println!("queue status ({} jobs):", counts.total());
            println!("  pending:   {}", counts.pending);
            println!("  running:   {}", counts.running);
            println!("  succeeded: {}", counts.succeeded);
            println!("  failed:    {}", counts.failed);
            println!("  dirty:     {}", counts.dirty);

            let failed = manifest.list_by_status(JobStatus::Failed).await?;
            if !failed.is_empty() {
                println!("\nfailed jobs:");
                for job in failed {
                    println!(
                        "  {} ({} attempts): {}",
                        job.artifact_path,
                        job.attempt_count,
                        job.last_error.as_deref().unwrap_or("no error recorded")
                    );
                }
            }
            Ok(0)
        }
        QueueCommands::Process(run_args) => {
            let config = RunConfig::load(run_args.config.as_deref())?;
            manifest.reset_stale(config.queue.stale_timeout()).await?;
            let stats = run_workers(manifest, &config, run_args).await?;
            print_run_summary(&stats);
            Ok(if stats.failed > 0 { 1 } else { 0 })
        }
        QueueCommands::Retry => {
            let count = manifest.retry_failed().await?;
            println!("re-queued {} failed jobs", count);
            Ok(0)
        }
        QueueCommands::Clear { manifest: with_history } => {
            let count = manifest.clear(*with_history).await?;
            println!(
                "cleared {} jobs{}",
                count,
                if *with_history { " and their history" } else { "" }
            );
            Ok(0)
        }
    }
}

/// `check`: encoder binaries resolvable, manifest writable.
pub async fn check(db_path: &Path) -> Result<i32> {
    let config = RunConfig::default();
    let mut ok = true;

    for binary in [&config.rendering.ffmpeg_binary, &config.rendering.ffprobe_binary] {
        match process_utils::tokio_command(binary)
            .arg("-version")
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                let first = version.lines().next().unwrap_or("unknown version");
                println!("ok: {} ({})", binary, first);
            }
            Ok(output) => {
                println!("FAIL: {} exited with {:?}", binary, output.status.code());
                ok = false;
            }
            Err(e) => {
                println!("FAIL: {} not runnable: {}", binary, e);
                ok = false;
            }
        }
    }

    match open_manifest(db_path).await {
        Ok(manifest) => {
            let counts = manifest.counts().await?;
            println!("ok: manifest {} ({} jobs)", db_path.display(), counts.total());
        }
        Err(e) => {
            println!("FAIL: manifest {}: {}", db_path.display(), e);
            ok = false;
        }
    }

    Ok(if ok { 0 } else { 1 })
}
