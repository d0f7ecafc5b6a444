//! Fixed-interval host for [`NewsletterJob`].
//!
//! Plays the part of the external scheduler when the binary runs on its own.
//! Runs never overlap: the next tick is only awaited after the previous run
//! returned.

use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::job::{LogProgress, NewsletterJob, RunOutcome, Trigger, NEWSLETTER_TASK};
use crate::mailer::SmtpConnector;

/// Summary of a scheduler lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs: u64,
    pub delivered: u64,
}

/// Triggers a job every `interval` until cancelled.
#[derive(Debug, Clone, Copy)]
pub struct IntervalScheduler {
    interval: Duration,
    run_on_start: bool,
}

impl IntervalScheduler {
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            run_on_start: false,
        }
    }

    pub const fn from_trigger(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Interval(interval) => Self::new(interval),
        }
    }

    /// Fire once immediately instead of waiting a full interval first.
    #[must_use]
    pub const fn run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Drive `job` until `cancel` fires.
    ///
    /// Each run gets a child token, so cancelling the scheduler also marks a
    /// pending run as cancelled.
    pub async fn run<C: SmtpConnector>(
        &self,
        job: &NewsletterJob<C>,
        cancel: &CancellationToken,
    ) -> SchedulerStats {
        let start = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stats = SchedulerStats::default();
        self.log_next_run(start);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(task = NEWSLETTER_TASK.key, runs = stats.runs, "Scheduler stopped");
                    return stats;
                }
                _ = ticker.tick() => {}
            }

            info!(task = NEWSLETTER_TASK.key, name = NEWSLETTER_TASK.name, "Starting scheduled run");
            let outcome = job.run(&cancel.child_token(), &LogProgress).await;
            stats.runs += 1;

            match outcome {
                RunOutcome::Delivered => stats.delivered += 1,
                RunOutcome::Cancelled => {}
                RunOutcome::Failed(_) | RunOutcome::Faulted(_) => {
                    warn!(task = NEWSLETTER_TASK.key, "Scheduled run did not deliver; waiting for next trigger");
                }
            }

            self.log_next_run(Instant::now() + self.interval);
        }
    }

    fn log_next_run(&self, at: Instant) {
        let wait = at.saturating_duration_since(Instant::now());
        let next = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));

        if let Some(next) = next {
            info!(
                task = NEWSLETTER_TASK.key,
                interval_hours = self.interval.as_secs() / 3600,
                next_run = %next.to_rfc3339(),
                "Next newsletter run scheduled"
            );
        }
    }
}
