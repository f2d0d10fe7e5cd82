//! Approval records: pending → resolved lifecycle with overdue expiry,
//! 24 h retention of resolved records, and a hard cap.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use companion_core::approval::{ApprovalRecord, ApprovalStatus};
use companion_core::ids::new_id;
use companion_core::run::clip_text;
use companion_core::time::now_ms;

use crate::{DebouncedFile, StoreError};

const MAX_APPROVALS: usize = 500;
const RESOLVED_RETENTION_MS: i64 = 24 * 3_600_000;
const DEFAULT_TTL_MS: i64 = 15 * 60_000;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApprovalsFile {
    #[serde(default)]
    approvals: Vec<ApprovalRecord>,
}

#[derive(Debug, Default, Clone)]
pub struct NewApproval {
    pub request_id: Option<String>,
    pub conversation_id: String,
    pub tool_name: String,
    pub tool_preview: String,
    pub risk_level: String,
    pub channels: Vec<String>,
    pub expires_at: Option<i64>,
    pub meta: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Approved,
    Rejected,
}

impl Resolution {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" | "approve" => Some(Self::Approved),
            "rejected" | "reject" => Some(Self::Rejected),
            _ => None,
        }
    }

    fn status(self) -> ApprovalStatus {
        match self {
            Self::Approved => ApprovalStatus::Approved,
            Self::Rejected => ApprovalStatus::Rejected,
        }
    }
}

#[derive(Clone)]
pub struct ApprovalStore {
    file: DebouncedFile<ApprovalsFile>,
}

impl ApprovalStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: DebouncedFile::new(path, false),
        }
    }

    pub async fn create(&self, input: NewApproval) -> ApprovalRecord {
        let now = now_ms();
        let record = ApprovalRecord {
            request_id: input
                .request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(new_id),
            conversation_id: input.conversation_id,
            tool_name: input.tool_name,
            tool_preview: clip_text(&input.tool_preview),
            risk_level: input.risk_level,
            channels: input.channels,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: input.expires_at.unwrap_or(now + DEFAULT_TTL_MS),
            resolved_at: None,
            resolved_by: None,
            meta: input.meta.unwrap_or_default(),
        };
        self.file
            .mutate(|file| {
                file.approvals.push(record.clone());
                prune(&mut file.approvals, now);
            })
            .await;
        record
    }

    pub async fn get(&self, request_id: &str) -> Option<ApprovalRecord> {
        self.file
            .read(|file| {
                file.approvals
                    .iter()
                    .find(|a| a.request_id == request_id)
                    .cloned()
            })
            .await
    }

    /// Pending records, oldest first, after flipping overdue ones to expired.
    pub async fn list_pending(&self) -> Vec<ApprovalRecord> {
        let now = now_ms();
        self.file
            .mutate(|file| {
                expire_overdue(&mut file.approvals, now);
                file.approvals
                    .iter()
                    .filter(|a| a.status == ApprovalStatus::Pending)
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Resolve a pending record. Resolving an already-resolved record is an
    /// idempotent no-op returning the current state.
    pub async fn resolve(
        &self,
        request_id: &str,
        resolution: Resolution,
        resolved_by: Option<String>,
    ) -> Option<ApprovalRecord> {
        let now = now_ms();
        self.file
            .mutate(|file| {
                expire_overdue(&mut file.approvals, now);
                let record = file
                    .approvals
                    .iter_mut()
                    .find(|a| a.request_id == request_id)?;
                if record.status == ApprovalStatus::Pending {
                    record.status = resolution.status();
                    record.resolved_at = Some(now);
                    record.resolved_by = resolved_by;
                }
                Some(record.clone())
            })
            .await
    }

    /// Flip `pending` records whose deadline has passed. Returns how many
    /// were expired.
    pub async fn expire_overdue(&self) -> usize {
        let now = now_ms();
        self.file
            .mutate(|file| expire_overdue(&mut file.approvals, now))
            .await
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.file.flush().await
    }
}

fn expire_overdue(approvals: &mut [ApprovalRecord], now: i64) -> usize {
    let mut expired = 0;
    for record in approvals.iter_mut() {
        if record.status == ApprovalStatus::Pending && record.expires_at <= now {
            record.status = ApprovalStatus::Expired;
            record.resolved_at = Some(now);
            expired += 1;
        }
    }
    expired
}

fn prune(approvals: &mut Vec<ApprovalRecord>, now: i64) {
    approvals.retain(|a| {
        !a.status.is_resolved()
            || a.resolved_at
                .is_none_or(|at| now - at < RESOLVED_RETENTION_MS)
    });
    if approvals.len() > MAX_APPROVALS {
        let excess = approvals.len() - MAX_APPROVALS;
        approvals.drain(..excess);
    }
}
