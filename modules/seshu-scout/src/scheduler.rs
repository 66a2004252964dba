use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use seshu_common::error::Result;
use seshu_common::{SeshuError, SeshuJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;
use crate::store::JobStore;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Maps wall time onto hour buckets, optionally fast-forwarded.
///
/// With a compression ratio of 3600 a whole simulated day passes in 24 real
/// seconds, one bucket per second. A ratio of 1 or less is real time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedClock {
    ratio: f64,
}

impl SimulatedClock {
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_finite() && ratio > 0.0 { ratio } else { 1.0 };
        Self { ratio }
    }

    pub fn real_time() -> Self {
        Self::new(1.0)
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    fn is_compressed(&self) -> bool {
        self.ratio > 1.0
    }

    /// The hour bucket (0-23) that `now` falls in.
    pub fn current_bucket(&self, now: DateTime<Utc>) -> i32 {
        if !self.is_compressed() {
            return now.hour() as i32;
        }
        let seconds_per_day = SECONDS_PER_DAY / self.ratio;
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        let position = now_secs.rem_euclid(seconds_per_day);
        ((position / seconds_per_day * 24.0).floor() as i32).rem_euclid(24)
    }

    /// Shrink a simulated duration to the real time it takes.
    pub fn compress_duration(&self, d: Duration) -> Duration {
        if self.is_compressed() {
            d.div_f64(self.ratio)
        } else {
            d
        }
    }

    /// Stretch a real duration to the simulated time it represents.
    pub fn simulated_elapsed(&self, real: Duration) -> Duration {
        if self.is_compressed() {
            real.mul_f64(self.ratio)
        } else {
            real
        }
    }
}

/// A queued job is overdue when its bucket lies up to half a day behind now.
pub fn is_overdue(now_hour: i32, job_hour: i32) -> bool {
    let behind = (now_hour - job_hour).rem_euclid(24);
    behind > 0 && behind < 12
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherReport {
    pub bucket: i32,
    /// The gather interval had not elapsed; nothing was looked at.
    pub skipped: bool,
    /// The job table was scanned for this bucket.
    pub scanned: bool,
    pub published: usize,
}

/// Publishes each bucket's jobs to the work queue once per gather interval.
pub struct Scheduler {
    clock: SimulatedClock,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    gather_interval: Duration,
    last_gather: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        clock: SimulatedClock,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        gather_interval: Duration,
    ) -> Self {
        Self {
            clock,
            jobs,
            queue,
            gather_interval,
            last_gather: Mutex::new(None),
        }
    }

    pub fn clock(&self) -> SimulatedClock {
        self.clock
    }

    fn interval_elapsed(&self, now: DateTime<Utc>) -> Result<bool> {
        let last = self
            .last_gather
            .lock()
            .map_err(|_| SeshuError::Storage("gather clock lock poisoned".into()))?;
        Ok(match *last {
            None => true,
            Some(prev) => {
                let real = (now - prev).to_std().unwrap_or(Duration::ZERO);
                self.clock.simulated_elapsed(real) >= self.gather_interval
            }
        })
    }

    fn mark_gathered(&self, now: DateTime<Utc>) -> Result<()> {
        *self
            .last_gather
            .lock()
            .map_err(|_| SeshuError::Storage("gather clock lock poisoned".into()))? = Some(now);
        Ok(())
    }

    /// One gather tick.
    ///
    /// Scans the current bucket when the queue is empty or its head belongs
    /// to an earlier bucket; a head in the current bucket means this hour was
    /// already gathered. The interval is only stamped once the queue and job
    /// table were read, so a storage error is retried on the next tick. A job
    /// that fails to publish is logged and the rest still go out.
    pub async fn gather(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<GatherReport> {
        let bucket = self.clock.current_bucket(now);
        let mut report = GatherReport {
            bucket,
            skipped: false,
            scanned: false,
            published: 0,
        };

        if !self.interval_elapsed(now)? {
            debug!(bucket, "Gather interval not reached");
            report.skipped = true;
            return Ok(report);
        }

        let head = self.queue.peek_top().await?;
        let should_scan = match head {
            None => true,
            Some(payload) => match serde_json::from_value::<SeshuJob>(payload) {
                Ok(job) => is_overdue(bucket, job.scheduled_hour),
                Err(e) => {
                    warn!(error = %e, "Queue head is not a job, gathering anyway");
                    true
                }
            },
        };
        if !should_scan {
            self.mark_gathered(now)?;
            info!(bucket, "Queue head already covers this bucket");
            return Ok(report);
        }

        let jobs = self.jobs.jobs_scheduled_for_hour(bucket).await?;
        self.mark_gathered(now)?;
        report.scanned = true;

        for job in jobs {
            if cancel.is_cancelled() {
                return Err(SeshuError::Cancelled);
            }
            let published = match serde_json::to_value(&job) {
                Ok(payload) => self.queue.publish(&payload).await,
                Err(e) => Err(e.into()),
            };
            match published {
                Ok(()) => report.published += 1,
                Err(e) => warn!(url = %job.normalized_url_key, error = %e, "Failed to queue job"),
            }
        }

        info!(bucket, published = report.published, "Gathered scheduled jobs");
        Ok(report)
    }
}
