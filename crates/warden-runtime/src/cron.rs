//! The cron sub-scheduler: services contribute `schedule -> action` bindings
//! at registration time, and one background task fires them in wall-clock order.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use warden_core::{CronJob, Session};

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidSchedule(String, cron::error::Error),
}

struct ScheduledJob {
    service: String,
    schedule: Schedule,
    job: CronJob,
}

/// Holds every cron binding contributed by registered services and drives
/// them off one timer task, rather than spawning a task per job.
pub struct CronScheduler {
    jobs: std::sync::Mutex<Vec<ScheduledJob>>,
    timezone: Tz,
}

impl CronScheduler {
    pub fn new(timezone: Tz) -> Self {
        Self {
            jobs: std::sync::Mutex::new(Vec::new()),
            timezone,
        }
    }

    pub fn add(&self, service: impl Into<String>, job: CronJob) -> Result<(), CronError> {
        let schedule = Schedule::from_str(&job.schedule)
            .map_err(|e| CronError::InvalidSchedule(job.schedule.clone(), e))?;
        self.jobs.lock().expect("cron jobs lock poisoned").push(ScheduledJob {
            service: service.into(),
            schedule,
            job,
        });
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().expect("cron jobs lock poisoned").len()
    }

    /// Runs until `cancel` fires, sleeping until the nearest upcoming
    /// occurrence across every job rather than polling on a fixed interval.
    pub async fn run(self: Arc<Self>, session: Arc<dyn Session>, cancel: CancellationToken) {
        loop {
            let next = self.next_occurrence();
            let sleep_for = match next {
                Some((when, _)) => {
                    let now = Utc::now();
                    (when - now).to_std().unwrap_or(std::time::Duration::ZERO)
                }
                None => {
                    // No jobs registered yet; poll occasionally in case some arrive.
                    std::time::Duration::from_secs(1)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cron scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            if next.is_some() {
                self.fire_due(&*session);
            }
        }
    }

    fn next_occurrence(&self) -> Option<(DateTime<Utc>, usize)> {
        let jobs = self.jobs.lock().expect("cron jobs lock poisoned");
        let now = Utc::now().with_timezone(&self.timezone);
        jobs.iter()
            .enumerate()
            .filter_map(|(i, job)| job.schedule.after(&now).next().map(|t| (t.with_timezone(&Utc), i)))
            .min_by_key(|(t, _)| *t)
    }

    fn fire_due(&self, session: &dyn Session) {
        let now = Utc::now().with_timezone(&self.timezone);
        let jobs = self.jobs.lock().expect("cron jobs lock poisoned");
        for job in jobs.iter() {
            let mut upcoming = job.schedule.after(&(now - chrono::Duration::seconds(1)));
            if let Some(fire_at) = upcoming.next() {
                if fire_at <= now {
                    debug!(service = job.service.as_str(), schedule = job.job.schedule.as_str(), "firing cron job");
                    if let Err(err) = (job.job.action)(session) {
                        error!(service = job.service.as_str(), %err, "cron job action failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use warden_core::{Address, EngineError, Event};

    struct NoopSession;
    impl Session for NoopSession {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn dispatch(&self, _event: Event) {}
        fn resolve(&self, slug: &str) -> Result<Address, warden_core::AddressError> {
            Ok(Address::new("warden", "test", "primary", slug))
        }
        fn destroy(&self, _err: Option<EngineError>) {}
        fn can_recover(&self) -> bool {
            true
        }
    }

    #[test]
    fn rejects_invalid_schedule() {
        let scheduler = CronScheduler::new(chrono_tz::UTC);
        let job = CronJob {
            schedule: "not a schedule".into(),
            action: StdArc::new(|_| Ok(())),
        };
        assert!(scheduler.add("svc", job).is_err());
    }

    #[test]
    fn accepts_six_field_schedule_and_orders_by_next_fire() {
        let scheduler = CronScheduler::new(chrono_tz::UTC);
        scheduler
            .add(
                "svc-a",
                CronJob {
                    schedule: "0 0 0 1 1 * 2999".into(),
                    action: StdArc::new(|_| Ok(())),
                },
            )
            .unwrap();
        scheduler
            .add(
                "svc-b",
                CronJob {
                    schedule: "* * * * * *".into(),
                    action: StdArc::new(|_| Ok(())),
                },
            )
            .unwrap();
        assert_eq!(scheduler.job_count(), 2);
        let (_, idx) = scheduler.next_occurrence().unwrap();
        assert_eq!(idx, 1, "the every-second job should fire first");
    }

    #[tokio::test]
    async fn fire_due_invokes_matching_job() {
        let scheduler = CronScheduler::new(chrono_tz::UTC);
        let fired = StdArc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = StdArc::clone(&fired);
        scheduler
            .add(
                "svc",
                CronJob {
                    schedule: "* * * * * *".into(),
                    action: StdArc::new(move |_| {
                        fired2.store(true, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }),
                },
            )
            .unwrap();
        scheduler.fire_due(&NoopSession);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
