// crates/server/src/demo.rs
//! Synthetic job producer for `--demo`.
//!
//! Submits fake library scans through the worker pool at a steady pace so
//! the snapshot and push endpoints have something to show.

use std::time::Duration;

use anyhow::bail;
use jobcast_server_jobs::{JobContext, WorkerPool};
use rand::Rng;
use tokio::task::JoinHandle;

/// Job kind used for every demo job.
pub const DEMO_KIND: &str = "library_scan";

/// Parameters for one synthetic scan, rolled up front.
#[derive(Debug, Clone, Copy)]
struct ScanPlan {
    task_count: u64,
    task_delay: Duration,
    /// Task at which the scan fails, if it does.
    fail_at: Option<u64>,
}

impl ScanPlan {
    fn roll() -> Self {
        let mut rng = rand::thread_rng();
        let task_count = rng.gen_range(20..=400);
        Self {
            task_count,
            task_delay: Duration::from_millis(rng.gen_range(5..=40)),
            fail_at: rng
                .gen_bool(0.15)
                .then(|| rng.gen_range(1..task_count)),
        }
    }
}

/// Start submitting a demo job every `every` until the returned task is
/// aborted.
pub fn spawn_demo_producer(pool: WorkerPool, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let plan = ScanPlan::roll();
            match pool.submit(DEMO_KIND, plan.task_count, move |ctx| scan(ctx, plan)) {
                Ok(handle) => {
                    tracing::info!(
                        runner_id = %handle.runner_id(),
                        task_count = plan.task_count,
                        "demo scan submitted"
                    );
                }
                Err(e) => tracing::warn!("demo scan rejected: {e}"),
            }
        }
    })
}

async fn scan(ctx: JobContext, plan: ScanPlan) -> anyhow::Result<Option<String>> {
    let mut found = Vec::new();
    for task in 1..=plan.task_count {
        tokio::time::sleep(plan.task_delay).await;
        if plan.fail_at == Some(task) {
            bail!("unreadable file at task {task}");
        }
        ctx.advance();

        if task % 50 == 0 {
            found.push(format!("media-{}-{task}", ctx.runner_id()));
        }
        if found.len() >= 3 {
            ctx.created_media(std::mem::take(&mut found));
        }
    }
    if !found.is_empty() {
        ctx.created_media(found);
    }
    Ok(Some(format!("scanned {} files", plan.task_count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcast_types::{JobEvent, JobStatus};

    use crate::state::AppState;

    #[test]
    fn test_plan_is_within_bounds() {
        for _ in 0..100 {
            let plan = ScanPlan::roll();
            assert!((20..=400).contains(&plan.task_count));
            if let Some(at) = plan.fail_at {
                assert!(at >= 1 && at < plan.task_count);
            }
        }
    }

    #[tokio::test]
    async fn test_scan_completes_and_reports_media() {
        let state = AppState::for_tests();
        let mut sub = state.bus.subscribe();
        let plan = ScanPlan {
            task_count: 100,
            task_delay: Duration::ZERO,
            fail_at: None,
        };

        let handle = state
            .pool
            .submit_with_id("demo", DEMO_KIND, plan.task_count, move |ctx| scan(ctx, plan))
            .unwrap();
        assert_eq!(handle.join().await, Some(JobStatus::Completed));

        let job = state.registry.get("demo").unwrap();
        assert_eq!(job.current_task, 100);
        assert_eq!(job.message.as_deref(), Some("scanned 100 files"));

        let mut media = Vec::new();
        while let Ok(Some(event)) = sub.try_recv() {
            if let JobEvent::CreatedMedia { media_ids } = event {
                media.extend(media_ids);
            }
        }
        assert_eq!(media, vec!["media-demo-50", "media-demo-100"]);
    }

    #[tokio::test]
    async fn test_scan_failure_is_recorded() {
        let state = AppState::for_tests();
        let plan = ScanPlan {
            task_count: 10,
            task_delay: Duration::ZERO,
            fail_at: Some(4),
        };

        let handle = state
            .pool
            .submit_with_id("broken", DEMO_KIND, plan.task_count, move |ctx| scan(ctx, plan))
            .unwrap();
        assert_eq!(handle.join().await, Some(JobStatus::Failed));

        let job = state.registry.get("broken").unwrap();
        assert_eq!(job.current_task, 3);
        assert_eq!(job.message.as_deref(), Some("unreadable file at task 4"));
    }
}
