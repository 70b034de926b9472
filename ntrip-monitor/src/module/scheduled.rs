//! Periodic pipeline runs for daemon mode
//!
//! Runs are aligned to wall-clock multiples of the interval (xx:00, xx:15,
//! ... for 15 minutes). A failed run, fail-safe included, is logged and left
//! for the next tick; there is no retry inside a cycle.

use chrono::{Duration as ChronoDuration, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::ScheduleConfig;
use crate::module::reconcile::MetadataStore;
use crate::module::sourcetable::SourceTableFetcher;
use crate::pipeline::{self, Pipeline};

pub struct ScheduledRunner<F, S> {
    pipeline: Arc<Pipeline<F, S>>,
    schedule: ScheduleConfig,
    task_handle: Option<JoinHandle<()>>,
}

impl<F, S> ScheduledRunner<F, S>
where
    F: SourceTableFetcher + 'static,
    S: MetadataStore + 'static,
{
    pub fn new(pipeline: Arc<Pipeline<F, S>>, schedule: ScheduleConfig) -> Self {
        Self {
            pipeline,
            schedule,
            task_handle: None,
        }
    }

    pub fn start(&mut self) {
        let pipeline = self.pipeline.clone();
        let schedule = self.schedule.clone();

        tracing::info!(
            "Scheduling caster scans (interval: {} minutes, initial: {}, verify: {})",
            schedule.interval_minutes,
            schedule.run_on_start,
            pipeline.config().verify_on_scan(schedule.verify_after_scan)
        );

        self.task_handle = Some(tokio::spawn(async move {
            if schedule.run_on_start {
                tracing::info!("Performing initial scan...");
                Self::run_once(&pipeline, &schedule).await;
            }
            Self::scan_loop(pipeline, schedule).await;
        }));
    }

    async fn scan_loop(pipeline: Arc<Pipeline<F, S>>, schedule: ScheduleConfig) {
        loop {
            let now = pipeline::now();
            let next_trigger = calculate_next_run_time(now, schedule.interval_minutes);
            let sleep_duration = (next_trigger - now)
                .to_std()
                .unwrap_or(Duration::from_secs(60));

            tracing::info!(
                "Next scan at: {} (in {:.1} min)",
                next_trigger.format("%Y-%m-%d %H:%M:%S"),
                sleep_duration.as_secs_f64() / 60.0
            );

            tokio::time::sleep(sleep_duration).await;
            Self::run_once(&pipeline, &schedule).await;
        }
    }

    async fn run_once(pipeline: &Pipeline<F, S>, schedule: &ScheduleConfig) {
        let timeout_duration = Duration::from_secs(schedule.run_timeout_secs);
        let verify = pipeline.config().verify_on_scan(schedule.verify_after_scan);
        let run = pipeline.run_scan(verify, pipeline::now());

        match tokio::time::timeout(timeout_duration, run).await {
            Ok(Ok(_)) => tracing::info!("Scheduled scan completed successfully"),
            Ok(Err(e)) => tracing::error!("Scheduled scan failed: {:#}", e),
            Err(_) => tracing::error!(
                "Scheduled scan timed out after {} seconds",
                timeout_duration.as_secs()
            ),
        }
    }

    pub async fn shutdown(mut self) {
        tracing::info!("Stopping scheduled scans...");
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Next multiple of `interval_minutes` counted from local midnight,
/// strictly after `now`.
pub fn calculate_next_run_time(now: NaiveDateTime, interval_minutes: u64) -> NaiveDateTime {
    let interval = interval_minutes.max(1) as i64;
    let midnight = now.date().and_time(chrono::NaiveTime::MIN);
    let elapsed = i64::from(now.hour() * 60 + now.minute());
    let next = (elapsed / interval + 1) * interval;

    // an interval that does not divide the day restarts at midnight
    let candidate = midnight + ChronoDuration::minutes(next);
    let next_midnight = midnight + ChronoDuration::days(1);
    candidate.min(next_midnight)
}
