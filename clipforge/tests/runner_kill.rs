//! Encoder supervision against real (shell) child processes.
#![cfg(unix)]

use std::time::Duration;

use tempfile::TempDir;

use clipforge::error::TimeoutKind;
use clipforge::runner::{EncoderCommand, EncoderRunner, ExitClassification, RunnerPolicy};

fn policy(global_s: u64, stall_ms: u64) -> RunnerPolicy {
    RunnerPolicy {
        global_timeout: Duration::from_secs(global_s),
        stall_timeout: Duration::from_millis(stall_ms),
        kill_grace: Duration::from_millis(500),
        write_failure_artifacts: true,
    }
}

fn shell(dir: &TempDir, script: &str, output: &str) -> EncoderCommand {
    EncoderCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        workdir: Some(dir.path().to_path_buf()),
        output_path: dir.path().join(output),
    }
}

#[tokio::test]
async fn silent_child_is_killed_by_the_stall_watchdog() {
    let dir = TempDir::new().unwrap();
    let runner = EncoderRunner::new(policy(3600, 400), dir.path().join("failures"));
    let command = shell(&dir, "sleep 30", "never.mp4");

    let started = std::time::Instant::now();
    let report = runner.run(&command, &|_| {}).await.unwrap();

    assert!(!report.success);
    assert_eq!(
        report.classification,
        Some(ExitClassification::Timeout(TimeoutKind::Stall))
    );
    // Stall budget + grace + slack, nowhere near the 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn runaway_child_hits_the_global_ceiling() {
    let dir = TempDir::new().unwrap();
    let runner = EncoderRunner::new(policy(1, 10_000), dir.path().join("failures"));
    let command = shell(&dir, "sleep 30", "never.mp4");

    let report = runner.run(&command, &|_| {}).await.unwrap();
    assert_eq!(
        report.classification,
        Some(ExitClassification::Timeout(TimeoutKind::Global))
    );
}

#[tokio::test]
async fn progress_output_keeps_the_stall_watchdog_quiet() {
    let dir = TempDir::new().unwrap();
    let runner = EncoderRunner::new(policy(3600, 1000), dir.path().join("failures"));
    // Emits progress every 200ms for ~1.6s, then writes the output.
    let script = "i=0; while [ $i -lt 8 ]; do \
                  echo \"out_time=00:00:0$i.000000\" 1>&2; sleep 0.2; i=$((i+1)); done; \
                  echo clip > out.mp4";
    let command = shell(&dir, script, "out.mp4");

    let saw_progress = std::sync::atomic::AtomicBool::new(false);
    let report = runner
        .run(&command, &|p| {
            assert!(p.media_seconds >= 0.0);
            saw_progress.store(true, std::sync::atomic::Ordering::Relaxed);
        })
        .await
        .unwrap();

    assert!(report.success, "stderr: {}", report.stderr_excerpt);
    assert!(saw_progress.load(std::sync::atomic::Ordering::Relaxed));
    assert!(report.final_progress.media_seconds >= 7.0);
}

#[tokio::test]
async fn clean_exit_without_output_is_a_transient_failure() {
    let dir = TempDir::new().unwrap();
    let runner = EncoderRunner::new(policy(30, 10_000), dir.path().join("failures"));
    let command = shell(&dir, "exit 0", "missing.mp4");

    let report = runner.run(&command, &|_| {}).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.classification, Some(ExitClassification::Transient));
}

#[tokio::test]
async fn failure_leaves_log_and_rerun_script_behind() {
    let dir = TempDir::new().unwrap();
    let runner = EncoderRunner::new(policy(30, 10_000), dir.path().join("failures"));
    let command = shell(&dir, "echo 'boom with space' 1>&2; exit 1", "never.mp4");

    let report = runner.run(&command, &|_| {}).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.artifacts.len(), 2);

    let log = report
        .artifacts
        .iter()
        .find(|p| p.extension().is_some_and(|e| e == "log"))
        .unwrap();
    let log_body = std::fs::read_to_string(log).unwrap();
    assert!(log_body.contains("boom with space"));

    let script = report
        .artifacts
        .iter()
        .find(|p| p.extension().is_some_and(|e| e == "sh"))
        .unwrap();
    let script_body = std::fs::read_to_string(script).unwrap();
    assert!(script_body.starts_with("#!/bin/sh"));
    assert!(script_body.contains("sh -c"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(script).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "rerun script is not executable");
    }
}

#[tokio::test]
async fn concurrent_failures_keep_separate_artifacts() {
    let dir = TempDir::new().unwrap();
    let runner = EncoderRunner::new(policy(30, 10_000), dir.path().join("failures"));
    let a = shell(&dir, "echo first 1>&2; exit 1", "never_a.mp4");
    let b = shell(&dir, "echo second 1>&2; exit 1", "never_b.mp4");

    // Same millisecond, same directory; nothing may be clobbered.
    let (ra, rb) = tokio::join!(runner.run(&a, &|_| {}), runner.run(&b, &|_| {}));
    let mut all = ra.unwrap().artifacts;
    all.extend(rb.unwrap().artifacts);

    assert_eq!(all.len(), 4);
    let unique: std::collections::HashSet<_> = all.iter().collect();
    assert_eq!(unique.len(), 4);
    for path in &all {
        assert!(path.exists(), "artifact {} is missing", path.display());
    }
}

#[tokio::test]
async fn kill_switch_tears_the_child_down() {
    let dir = TempDir::new().unwrap();
    let runner = EncoderRunner::new(policy(3600, 10_000), dir.path().join("failures"));
    let command = shell(&dir, "sleep 30", "never.mp4");

    let switch = runner.kill_switch();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        switch.cancel();
    });

    let started = std::time::Instant::now();
    let report = runner.run(&command, &|_| {}).await.unwrap();
    assert_eq!(report.classification, Some(ExitClassification::Killed));
    assert!(started.elapsed() < Duration::from_secs(5));
}
