use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::time::now_ms;

/// Summary and error strings on run records are clipped to this length.
pub const RUN_TEXT_MAX: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    #[default]
    Exec,
    Session,
    Cron,
    Heartbeat,
}

impl RunType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exec" => Some(Self::Exec),
            "session" => Some(Self::Session),
            "cron" => Some(Self::Cron),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    WaitingApproval,
    Retrying,
    Done,
    Failed,
}

impl RunState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "waiting_approval" => Some(Self::WaitingApproval),
            "retrying" => Some(Self::Retrying),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryState {
    pub channel: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
}

/// Durable record of an exec, session, cron or heartbeat run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEnvelope {
    pub run_id: String,
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub state: RunState,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_state: Option<DeliveryState>,
}

impl RunEnvelope {
    pub fn new(run_id: String, run_type: RunType, state: RunState) -> Self {
        let now = now_ms();
        let mut run = Self {
            run_id,
            run_type,
            state: RunState::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            summary: None,
            error: None,
            meta: Map::new(),
            delivery_state: None,
        };
        run.apply_state(state, now);
        run
    }

    /// Transition to `state`, auto-filling `started_at` for active states and
    /// `finished_at` for terminal ones.
    pub fn apply_state(&mut self, state: RunState, now: i64) {
        self.state = state;
        self.updated_at = now;
        if state.is_active() && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if state.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    /// The key run listings sort by, most recent first.
    pub fn sort_key(&self) -> i64 {
        self.finished_at.unwrap_or(self.updated_at)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

/// Clip a free-form string to the persisted bound, trimming whitespace first.
pub fn clip_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.chars().count() <= RUN_TEXT_MAX {
        trimmed.to_string()
    } else {
        trimmed.chars().take(RUN_TEXT_MAX).collect()
    }
}
