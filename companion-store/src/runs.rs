//! Durable run records: bounded FIFO retention, state-transition
//! normalization, filtered listings, and aggregate diagnostics.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use companion_core::ids::new_id;
use companion_core::run::{clip_text, RunEnvelope, RunState, RunType};
use companion_core::time::now_ms;

use crate::{DebouncedFile, StoreError};

const MAX_RUNS: usize = 200;
const LIST_LIMIT_DEFAULT: usize = 50;
const LIST_LIMIT_MAX: usize = 500;
const DIAGNOSTICS_SAMPLE_DEFAULT: usize = 100;
const DIAGNOSTICS_SAMPLE_MAX: usize = 500;
const DIAGNOSTICS_RECENT_DETAIL: usize = 10;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunsFile {
    #[serde(default)]
    runs: Vec<RunEnvelope>,
}

#[derive(Debug, Default, Clone)]
pub struct CreateRun {
    pub run_id: Option<String>,
    pub run_type: RunType,
    pub state: Option<RunState>,
    pub summary: Option<String>,
    pub meta: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Clone)]
pub struct UpdateRun {
    pub state: Option<RunState>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub meta: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Clone)]
pub struct RunFilter {
    pub run_type: Option<RunType>,
    pub state: Option<RunState>,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPage {
    pub runs: Vec<RunEnvelope>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDiagnostics {
    pub sampled: usize,
    pub completion_rate: f64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: i64,
    pub by_type: BTreeMap<String, usize>,
    pub windows: DiagnosticWindows,
    pub recent: Vec<RunEnvelope>,
    pub history: Vec<RunHistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticWindows {
    #[serde(rename = "1h")]
    pub one_hour: usize,
    #[serde(rename = "6h")]
    pub six_hours: usize,
    #[serde(rename = "24h")]
    pub day: usize,
}

/// Compact line for runs beyond the recent-detail slice.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHistoryEntry {
    pub run_id: String,
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

#[derive(Clone)]
pub struct RunStore {
    file: DebouncedFile<RunsFile>,
}

impl RunStore {
    /// Runs are the one store that keeps a `.bak` of the previous snapshot.
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: DebouncedFile::new(path, true),
        }
    }

    pub async fn create(&self, input: CreateRun) -> RunEnvelope {
        let run_id = input.run_id.filter(|id| !id.is_empty()).unwrap_or_else(new_id);
        let state = input.state.unwrap_or(RunState::Queued);
        let mut run = RunEnvelope::new(run_id, input.run_type, state);
        if let Some(summary) = input.summary {
            run.summary = Some(clip_text(&summary));
        }
        if let Some(meta) = input.meta {
            run.meta = meta;
        }
        self.file
            .mutate(|file| {
                file.runs.push(run.clone());
                if file.runs.len() > MAX_RUNS {
                    let excess = file.runs.len() - MAX_RUNS;
                    file.runs.drain(..excess);
                }
            })
            .await;
        run
    }

    pub async fn update(&self, run_id: &str, patch: UpdateRun) -> Option<RunEnvelope> {
        let now = now_ms();
        self.file
            .mutate(|file| {
                let run = file.runs.iter_mut().find(|r| r.run_id == run_id)?;
                if let Some(state) = patch.state {
                    run.apply_state(state, now);
                } else {
                    run.updated_at = now;
                }
                if let Some(summary) = patch.summary {
                    run.summary = Some(clip_text(&summary));
                }
                if let Some(error) = patch.error {
                    run.error = Some(clip_text(&error));
                }
                if let Some(meta) = patch.meta {
                    for (key, value) in meta {
                        run.meta.insert(key, value);
                    }
                }
                Some(run.clone())
            })
            .await
    }

    pub async fn get(&self, run_id: &str) -> Option<RunEnvelope> {
        self.file
            .read(|file| file.runs.iter().find(|r| r.run_id == run_id).cloned())
            .await
    }

    pub async fn list(&self, filter: RunFilter) -> RunPage {
        let limit = filter
            .limit
            .unwrap_or(LIST_LIMIT_DEFAULT)
            .clamp(1, LIST_LIMIT_MAX);
        let offset = filter.offset;
        self.file
            .read(|file| {
                let mut matched: Vec<&RunEnvelope> = file
                    .runs
                    .iter()
                    .filter(|r| filter.run_type.is_none_or(|t| r.run_type == t))
                    .filter(|r| filter.state.is_none_or(|s| r.state == s))
                    .collect();
                matched.sort_by_key(|r| {
                    Reverse((r.sort_key(), r.updated_at, r.created_at))
                });
                let total = matched.len();
                let runs: Vec<RunEnvelope> = matched
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect();
                let has_more = offset.min(total) + runs.len() < total;
                RunPage {
                    runs,
                    total,
                    offset,
                    limit,
                    has_more,
                }
            })
            .await
    }

    pub async fn diagnostics(&self, limit: Option<usize>) -> RunDiagnostics {
        let sample_size = limit
            .unwrap_or(DIAGNOSTICS_SAMPLE_DEFAULT)
            .clamp(1, DIAGNOSTICS_SAMPLE_MAX);
        let now = now_ms();
        self.file
            .read(|file| {
                let mut sample: Vec<&RunEnvelope> = file.runs.iter().collect();
                sample.sort_by_key(|r| Reverse((r.sort_key(), r.updated_at, r.created_at)));
                sample.truncate(sample_size);

                let terminal: Vec<&&RunEnvelope> =
                    sample.iter().filter(|r| r.state.is_terminal()).collect();
                let done = terminal
                    .iter()
                    .filter(|r| r.state == RunState::Done)
                    .count();
                let completion_rate = if terminal.is_empty() {
                    0.0
                } else {
                    done as f64 / terminal.len() as f64
                };

                let mut durations: Vec<i64> =
                    terminal.iter().filter_map(|r| r.duration_ms()).collect();
                durations.sort_unstable();
                let avg_duration_ms = if durations.is_empty() {
                    0.0
                } else {
                    durations.iter().sum::<i64>() as f64 / durations.len() as f64
                };
                let p95_duration_ms = percentile(&durations, 0.95);

                let mut by_type = BTreeMap::new();
                for run in &sample {
                    let key = match run.run_type {
                        RunType::Exec => "exec",
                        RunType::Session => "session",
                        RunType::Cron => "cron",
                        RunType::Heartbeat => "heartbeat",
                    };
                    *by_type.entry(key.to_string()).or_insert(0) += 1;
                }

                let windows = DiagnosticWindows {
                    one_hour: count_since(&sample, now - 3_600_000),
                    six_hours: count_since(&sample, now - 6 * 3_600_000),
                    day: count_since(&sample, now - 24 * 3_600_000),
                };

                let recent: Vec<RunEnvelope> = sample
                    .iter()
                    .take(DIAGNOSTICS_RECENT_DETAIL)
                    .map(|r| (*r).clone())
                    .collect();
                let history: Vec<RunHistoryEntry> = sample
                    .iter()
                    .skip(DIAGNOSTICS_RECENT_DETAIL)
                    .map(|r| RunHistoryEntry {
                        run_id: r.run_id.clone(),
                        run_type: r.run_type,
                        state: r.state,
                        finished_at: r.finished_at,
                    })
                    .collect();

                RunDiagnostics {
                    sampled: sample.len(),
                    completion_rate,
                    avg_duration_ms,
                    p95_duration_ms,
                    by_type,
                    windows,
                    recent,
                    history,
                }
            })
            .await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.file.flush().await
    }
}

fn count_since(sample: &[&RunEnvelope], cutoff: i64) -> usize {
    sample.iter().filter(|r| r.created_at >= cutoff).count()
}

fn percentile(sorted: &[i64], q: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
