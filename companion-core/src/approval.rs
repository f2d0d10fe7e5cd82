use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A request for human consent, routed out over one or more channels and
/// resolved (or expired) later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub request_id: String,
    pub conversation_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_preview: String,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub channels: Vec<String>,
    pub status: ApprovalStatus,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_resolution_predicate() {
        assert!(!ApprovalStatus::Pending.is_resolved());
        assert!(ApprovalStatus::Approved.is_resolved());
        assert!(ApprovalStatus::Rejected.is_resolved());
        assert!(ApprovalStatus::Expired.is_resolved());
    }

    #[test]
    fn record_round_trips_camel_case() {
        let record = ApprovalRecord {
            request_id: "req1".into(),
            conversation_id: "conv1".into(),
            tool_name: "shell".into(),
            tool_preview: "ls".into(),
            risk_level: "low".into(),
            channels: vec!["extension".into()],
            status: ApprovalStatus::Pending,
            created_at: 1,
            expires_at: 2,
            resolved_at: None,
            resolved_by: None,
            meta: Map::new(),
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["requestId"], "req1");
        assert_eq!(json["status"], "pending");
        let back: ApprovalRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.conversation_id, "conv1");
    }
}
