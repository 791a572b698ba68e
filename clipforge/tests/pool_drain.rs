//! Worker pool drain behavior with a scripted pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use clipforge::database::models::{JobItem, JobStatus};
use clipforge::database::repositories::{ManifestRepository, SqlxManifestRepository};
use clipforge::database::{database_url, init_pool, init_write_pool, run_migrations};
use clipforge::fingerprint::ArtifactFingerprint;
use clipforge::pipeline::JobPipeline;
use clipforge::pipeline::worker_pool::{WorkerPool, WorkerPoolConfig};
use clipforge::{Error, Result};

async fn setup() -> (TempDir, Arc<SqlxManifestRepository>) {
    let dir = TempDir::new().unwrap();
    let url = database_url(&dir.path().join("manifest.db"));
    let read = init_pool(&url).await.unwrap();
    let write = init_write_pool(&url).await.unwrap();
    run_migrations(&read).await.unwrap();
    (dir, Arc::new(SqlxManifestRepository::new(read, write)))
}

fn seed_job(path: &str, max_attempts: u32) -> JobItem {
    let fp = ArtifactFingerprint {
        quick: format!("q-{path}"),
        strong: format!("s-{path}"),
        size: 1,
    };
    JobItem::new(path, &fp, "cfg", max_attempts)
}

/// Pipeline scripted per artifact path:
/// - `ok`      succeeds with one real output file
/// - `quiet`   succeeds with no outputs
/// - `corrupt` fails permanently
/// - `flaky`   fails transiently until the second attempt
struct ScriptedPipeline {
    output_dir: std::path::PathBuf,
}

#[async_trait]
impl JobPipeline for ScriptedPipeline {
    async fn execute(&self, job: &JobItem) -> Result<Vec<String>> {
        let name = std::path::Path::new(&job.artifact_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        match name.as_str() {
            "ok" => {
                let out = self.output_dir.join("ok_clip_000.mp4");
                tokio::fs::write(&out, b"clip").await?;
                Ok(vec![out.to_string_lossy().into_owned()])
            }
            "quiet" => Ok(Vec::new()),
            "corrupt" => Err(Error::permanent("moov atom not found")),
            // attempt_count counts acked failures, so 0 on the first run.
            "flaky" if job.attempt_count < 1 => Err(Error::transient("spurious encoder exit")),
            "flaky" => Ok(Vec::new()),
            other => panic!("unscripted artifact {other}"),
        }
    }
}

fn pool(
    manifest: Arc<SqlxManifestRepository>,
    output_dir: std::path::PathBuf,
    workers: usize,
    max_jobs: Option<u64>,
) -> WorkerPool {
    WorkerPool::new(
        manifest,
        Arc::new(ScriptedPipeline { output_dir }),
        WorkerPoolConfig {
            workers,
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(100),
            max_jobs,
        },
        CancellationToken::new(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drains_mixed_outcomes_without_crashing_slots() {
    let (dir, manifest) = setup().await;
    for name in ["ok", "quiet", "corrupt", "flaky"] {
        manifest
            .upsert(&seed_job(&format!("/in/{name}.mp4"), 3))
            .await
            .unwrap();
    }

    let stats = pool(manifest.clone(), dir.path().to_path_buf(), 2, None)
        .run()
        .await
        .unwrap();

    assert_eq!(stats.succeeded, 1); // ok
    assert_eq!(stats.skipped, 2); // quiet + flaky's eventual pass
    assert_eq!(stats.failed, 1); // corrupt
    assert_eq!(stats.retried, 1); // flaky's first attempt
    assert_eq!(stats.processed, 5);

    let counts = manifest.counts().await.unwrap();
    assert_eq!(counts.succeeded, 3);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.outstanding(), 0);

    let flaky = manifest.get("/in/flaky.mp4").await.unwrap().unwrap();
    assert_eq!(flaky.status, JobStatus::Succeeded);
    assert_eq!(flaky.attempt_count, 1);

    let corrupt = manifest.get("/in/corrupt.mp4").await.unwrap().unwrap();
    assert_eq!(corrupt.status, JobStatus::Failed);
    assert_eq!(corrupt.attempt_count, 1);
    assert!(corrupt.last_error.unwrap().contains("moov atom"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_jobs_bounds_the_run() {
    let (dir, manifest) = setup().await;
    for i in 0..5 {
        manifest
            .upsert(&seed_job(&format!("/in/quiet{i}/quiet.mp4"), 3))
            .await
            .unwrap();
    }

    let stats = pool(manifest.clone(), dir.path().to_path_buf(), 2, Some(2))
        .run()
        .await
        .unwrap();

    assert_eq!(stats.processed, 2);
    let counts = manifest.counts().await.unwrap();
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.succeeded, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_queue_run_finishes_immediately() {
    let (dir, manifest) = setup().await;
    let stats = pool(manifest, dir.path().to_path_buf(), 4, None)
        .run()
        .await
        .unwrap();
    assert_eq!(stats.processed, 0);
}
