use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::state::{AppState, RunOverrides};

pub struct Scheduler {
    state: AppState,
    config: SchedulerConfig,
    busy: Arc<Mutex<()>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(state: AppState, config: SchedulerConfig) -> Self {
        Self {
            state,
            config,
            busy: Arc::new(Mutex::new(())),
        }
    }

    /// Runs until the state's cancellation token fires.
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Scheduler is disabled in config");
            return Ok(());
        }

        info!(
            attributes = ?self.config.attributes,
            max_per_run = self.config.max_per_run,
            "Starting background scheduler"
        );

        if let Some(cron_expr) = &self.config.cron_expression {
            self.run_with_cron(cron_expr).await
        } else {
            self.run_with_interval().await
        }
    }

    async fn run_with_cron(&self, cron_expr: &str) -> Result<()> {
        let mut sched = JobScheduler::new().await?;

        let state = self.state.clone();
        let config = self.config.clone();
        let busy = Arc::clone(&self.busy);

        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let state = state.clone();
            let config = config.clone();
            let busy = Arc::clone(&busy);
            Box::pin(async move {
                run_tick(&state, &config, &busy).await;
            })
        })?;

        sched.add(job).await?;
        sched.start().await?;

        info!("Scheduler running with cron: {}", cron_expr);

        self.state.cancel.cancelled().await;

        sched.shutdown().await?;
        info!("Scheduler stopped");
        Ok(())
    }

    async fn run_with_interval(&self) -> Result<()> {
        let interval_mins = self.config.interval_minutes.max(1);
        info!("Scheduler running every {} minutes", interval_mins);

        let mut ticker = interval(Duration::from_secs(u64::from(interval_mins) * 60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.state.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    run_tick(&self.state, &self.config, &self.busy).await;
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }
}

async fn run_tick(state: &AppState, config: &SchedulerConfig, busy: &Mutex<()>) {
    let Ok(_guard) = busy.try_lock() else {
        warn!(
            event = "job_skipped",
            "Previous scheduled run still in progress, skipping tick"
        );
        return;
    };

    for attribute in &config.attributes {
        if state.cancel.is_cancelled() {
            break;
        }

        let job_name = attribute.label();
        let start = std::time::Instant::now();
        info!(event = "job_started", job_name, "Starting scheduled enrichment");

        let overrides = RunOverrides {
            limit: Some(config.max_per_run),
            ..RunOverrides::default()
        };

        let job = match state.job(*attribute, overrides) {
            Ok(job) => job,
            Err(e) => {
                error!(event = "job_failed", job_name, error = %e, "Scheduled enrichment not runnable");
                continue;
            }
        };

        match job.run().await {
            Ok(summary) => info!(
                event = "job_finished",
                job_name,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                interrupted = summary.interrupted,
                duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Scheduled enrichment finished"
            ),
            Err(e) => {
                error!(event = "job_failed", job_name, error = %e, "Scheduled enrichment failed");
            }
        }
    }
}
