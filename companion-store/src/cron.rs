//! Mirror of extension-authored cron jobs plus the pending-firing queue the
//! extension drains after the fact.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use companion_core::cron::{CronJob, PendingFiring};
use companion_core::time::now_ms;

use crate::{DebouncedFile, StoreError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CronFile {
    #[serde(default)]
    jobs: Vec<CronJob>,
    #[serde(default)]
    pending: Vec<PendingFiring>,
}

#[derive(Clone)]
pub struct CronStore {
    file: DebouncedFile<CronFile>,
}

impl CronStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: DebouncedFile::new(path, false),
        }
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.file.read(|file| file.jobs.clone()).await
    }

    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        self.file
            .read(|file| file.jobs.iter().find(|j| j.id == id).cloned())
            .await
    }

    /// Insert or replace by id, preserving position on replace.
    pub async fn upsert_job(&self, job: CronJob) -> CronJob {
        self.file
            .mutate(|file| {
                match file.jobs.iter_mut().find(|j| j.id == job.id) {
                    Some(existing) => *existing = job.clone(),
                    None => file.jobs.push(job.clone()),
                }
                job.clone()
            })
            .await
    }

    pub async fn remove_job(&self, id: &str) -> bool {
        self.file
            .mutate(|file| {
                let before = file.jobs.len();
                file.jobs.retain(|j| j.id != id);
                file.jobs.len() != before
            })
            .await
    }

    pub async fn pending_runs(&self) -> Vec<PendingFiring> {
        self.file.read(|file| file.pending.clone()).await
    }

    /// Record a firing. Compacting: any older pending entry for the same task
    /// is superseded by this one.
    pub async fn add_pending_run(&self, task_id: &str) -> PendingFiring {
        let firing = PendingFiring {
            task_id: task_id.to_string(),
            missed_at: now_ms(),
        };
        self.file
            .mutate(|file| {
                file.pending.retain(|p| p.task_id != firing.task_id);
                file.pending.push(firing.clone());
            })
            .await;
        firing
    }

    /// Drop every pending entry matching any of `task_ids`; returns how many
    /// were removed.
    pub async fn ack_pending_runs(&self, task_ids: &[String]) -> usize {
        self.file
            .mutate(|file| {
                let before = file.pending.len();
                file.pending.retain(|p| !task_ids.contains(&p.task_id));
                before - file.pending.len()
            })
            .await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_core::cron::CronSchedule;

    fn store(dir: &tempfile::TempDir) -> CronStore {
        CronStore::new(dir.path().join("cron-jobs.json"))
    }

    fn job(id: &str, minutes: u64) -> CronJob {
        CronJob {
            id: id.into(),
            name: format!("job {id}"),
            enabled: true,
            schedule: CronSchedule::Interval { minutes },
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cron = store(&tmp);
        cron.upsert_job(job("a", 5)).await;
        cron.upsert_job(job("b", 10)).await;
        cron.upsert_job(job("a", 30)).await;

        let jobs = cron.list_jobs().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(
            cron.get_job("a").await.expect("a").schedule,
            CronSchedule::Interval { minutes: 30 }
        );
    }

    #[tokio::test]
    async fn pending_firings_compact_per_task() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cron = store(&tmp);
        for _ in 0..4 {
            cron.add_pending_run("digest").await;
        }
        let last = cron.add_pending_run("digest").await;
        cron.add_pending_run("other").await;

        let pending = cron.pending_runs().await;
        assert_eq!(pending.len(), 2);
        let digest = pending
            .iter()
            .find(|p| p.task_id == "digest")
            .expect("digest pending");
        assert_eq!(digest.missed_at, last.missed_at, "newest firing wins");
    }

    #[tokio::test]
    async fn ack_removes_matching_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cron = store(&tmp);
        cron.add_pending_run("a").await;
        cron.add_pending_run("b").await;
        cron.add_pending_run("c").await;

        let removed = cron
            .ack_pending_runs(&["a".to_string(), "c".to_string(), "missing".to_string()])
            .await;
        assert_eq!(removed, 2);
        let left = cron.pending_runs().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].task_id, "b");
    }

    #[tokio::test]
    async fn remove_job_reports_presence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cron = store(&tmp);
        cron.upsert_job(job("a", 1)).await;
        assert!(cron.remove_job("a").await);
        assert!(!cron.remove_job("a").await);
    }
}
