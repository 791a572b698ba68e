//! Claim correctness under heavy contention.

use dashmap::DashSet;
use rand::random;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use clipforge::database::models::JobItem;
use clipforge::database::repositories::{ManifestRepository, SqlxManifestRepository};
use clipforge::database::{database_url, init_pool, init_write_pool, run_migrations};
use clipforge::fingerprint::ArtifactFingerprint;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to validate claim atomicity under contention"]
async fn claim_stress_no_double_claims_or_lost_rows() {
    const JOBS: usize = 300;
    const WORKERS: usize = 24;

    let dir = TempDir::new().unwrap();
    let url = database_url(&dir.path().join("stress.db"));
    let read = init_pool(&url).await.unwrap();
    let write = init_write_pool(&url).await.unwrap();
    run_migrations(&read).await.unwrap();
    let repo = Arc::new(SqlxManifestRepository::new(read.clone(), write));

    // Seed a backlog with mixed priorities.
    for i in 0..JOBS {
        let fp = ArtifactFingerprint {
            quick: format!("q{i}"),
            strong: format!("s{i}"),
            size: 1,
        };
        let job =
            JobItem::new(format!("/in/input-{i}.mp4"), &fp, "cfg", 3).with_priority((i % 5) as i64);
        repo.upsert(&job).await.unwrap();
    }

    // Background writer briefly holding the write lock to force busy
    // windows onto the claim path.
    let locker_pool = read.clone();
    let locker = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            if let Ok(mut tx) = locker_pool.begin().await {
                let _ = sqlx::query(
                    "UPDATE job_items SET updated_at = updated_at
                     WHERE id IN (SELECT id FROM job_items LIMIT 1)",
                )
                .execute(&mut *tx)
                .await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.commit().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let claimed_ids = Arc::new(DashSet::<String>::new());

    let mut workers = JoinSet::new();
    for w in 0..WORKERS {
        let repo = repo.clone();
        let claimed_ids = claimed_ids.clone();
        workers.spawn(async move {
            let owner = format!("stress-{w}");
            loop {
                match repo.claim(&owner).await.unwrap() {
                    Some(claimed) => {
                        let inserted = claimed_ids.insert(claimed.id.clone());
                        assert!(inserted, "double-claimed job {}", claimed.id);

                        // Tiny jitter to widen the interleavings.
                        if random::<u8>() % 3 == 0 {
                            tokio::task::yield_now().await;
                        } else {
                            tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
                        }

                        repo.ack_success(&claimed.id, &[]).await.unwrap();
                    }
                    None => {
                        if repo.counts().await.unwrap().pending == 0 {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    let _ = locker.await;

    assert_eq!(claimed_ids.len(), JOBS, "not all jobs were claimed");

    let counts = repo.counts().await.unwrap();
    assert_eq!(counts.pending, 0, "pending jobs remain");
    assert_eq!(counts.running, 0, "running jobs remain");
    assert_eq!(counts.succeeded, JOBS as u64, "not all jobs succeeded");

    let missing_times: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM job_items WHERE started_at IS NULL OR completed_at IS NULL",
    )
    .fetch_one(&read)
    .await
    .unwrap();
    assert_eq!(missing_times, 0, "some jobs missing timestamps");
}
