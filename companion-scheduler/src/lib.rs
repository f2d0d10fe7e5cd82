//! Recurring-job scheduler. Each enabled job owns one armed timer task; on
//! fire it records a compacting pending marker (it never executes work) and
//! re-arms for the next occurrence.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use companion_core::cron::{CronJob, CronSchedule};
use companion_store::CronStore;

pub struct Scheduler {
    store: CronStore,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: CronStore) -> Self {
        Self {
            store,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Arm timers for every enabled stored job.
    pub async fn schedule_all(&self) {
        for job in self.store.list_jobs().await {
            self.schedule_job(&job).await;
        }
    }

    /// (Re-)arm one job: any existing timer is cancelled first; disabled jobs
    /// end up unscheduled.
    pub async fn schedule_job(&self, job: &CronJob) {
        self.unschedule(&job.id).await;
        if !job.enabled {
            return;
        }
        let Some(delay) = next_delay(&job.schedule, Utc::now()) else {
            warn!(job = %job.id, "cron job has an unschedulable spec, skipping");
            return;
        };

        let store = self.store.clone();
        let schedule = job.schedule.clone();
        let id = job.id.clone();
        let handle = tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::time::sleep(delay).await;
                store.add_pending_run(&id).await;
                info!(job = %id, "cron job fired, pending marker recorded");
                match next_delay(&schedule, Utc::now()) {
                    Some(next) => delay = next,
                    None => break,
                }
            }
        });
        self.timers.lock().await.insert(job.id.clone(), handle);
    }

    pub async fn unschedule(&self, id: &str) {
        if let Some(handle) = self.timers.lock().await.remove(id) {
            handle.abort();
        }
    }

    pub async fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

/// Whether a schedule can be armed at all (known timezone, valid time).
pub fn is_schedulable(schedule: &CronSchedule) -> bool {
    next_delay(schedule, Utc::now()).is_some()
}

/// Delay until the next firing. `None` means the schedule cannot be armed
/// (unknown timezone, invalid hour/minute).
pub fn next_delay(schedule: &CronSchedule, now: DateTime<Utc>) -> Option<Duration> {
    match schedule {
        CronSchedule::Interval { minutes } => Some(Duration::from_secs((*minutes).max(1) * 60)),
        CronSchedule::Daily { hour, minute, tz } => {
            let zone: chrono_tz::Tz = tz.parse().ok()?;
            let local = now.with_timezone(&zone);
            let today = local.date_naive().and_hms_opt(*hour, *minute, 0)?;
            // A DST gap can make today's time nonexistent; in that case (or
            // when the time is already past) the next occurrence is tomorrow.
            let target = match zone.from_local_datetime(&today).earliest() {
                Some(target) if target > local => target,
                _ => {
                    let tomorrow = local.date_naive().succ_opt()?.and_hms_opt(*hour, *minute, 0)?;
                    zone.from_local_datetime(&tomorrow).earliest()?
                }
            };
            let millis = (target.with_timezone(&Utc) - now).num_milliseconds();
            Some(Duration::from_millis(millis.max(0) as u64))
        }
    }
}
