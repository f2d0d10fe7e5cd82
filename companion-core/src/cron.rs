use serde::{Deserialize, Serialize};

/// Schedule shapes the extension can author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// Every `minutes` minutes (clamped to at least one).
    Interval { minutes: u64 },
    /// Every day at `hour:minute` in the named IANA timezone.
    Daily { hour: u32, minute: u32, tz: String },
}

/// Daemon-side mirror of an extension-authored recurring job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schedule: CronSchedule,
}

fn default_enabled() -> bool {
    true
}

/// Marker written when a job fires with no online consumer. At most one per
/// task id; a newer firing supersedes older ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFiring {
    pub task_id: String,
    pub missed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_serialization_is_tagged() {
        let interval = CronSchedule::Interval { minutes: 15 };
        let json = serde_json::to_value(&interval).expect("serialize");
        assert_eq!(json["kind"], "interval");
        assert_eq!(json["minutes"], 15);

        let daily = CronSchedule::Daily {
            hour: 9,
            minute: 30,
            tz: "Europe/Berlin".into(),
        };
        let json = serde_json::to_value(&daily).expect("serialize");
        assert_eq!(json["kind"], "daily");
        assert_eq!(json["tz"], "Europe/Berlin");
    }

    #[test]
    fn job_defaults_to_enabled() {
        let job: CronJob = serde_json::from_value(serde_json::json!({
            "id": "daily-digest",
            "schedule": {"kind": "interval", "minutes": 5}
        }))
        .expect("deserialize");
        assert!(job.enabled);
        assert!(job.name.is_empty());
    }
}
