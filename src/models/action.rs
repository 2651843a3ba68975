use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::reminder::ReminderFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ActionKind::Create),
            "update" => Some(ActionKind::Update),
            "delete" => Some(ActionKind::Delete),
            _ => None,
        }
    }
}

/// One not-yet-confirmed operation. `id` is the AUTOINCREMENT rowid, so it
/// doubles as the enqueue-order sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: i64,
    pub kind: ActionKind,
    pub local_id: String,
    pub snapshot: Option<ReminderFields>,
    pub attempts: i64,
    pub failed: bool,
    pub last_error: Option<String>,
    pub enqueued_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ActionRow {
    pub id: i64,
    pub kind: String,
    pub local_id: String,
    pub snapshot: Option<String>,
    pub attempts: i64,
    pub failed: bool,
    pub last_error: Option<String>,
    pub enqueued_at: String,
}

impl ActionRow {
    pub fn into_action(self) -> Result<PendingAction, serde_json::Error> {
        let snapshot = match self.snapshot {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(PendingAction {
            id: self.id,
            // Unknown kinds cannot occur: the column has a CHECK constraint.
            kind: ActionKind::parse(&self.kind).unwrap_or(ActionKind::Update),
            local_id: self.local_id,
            snapshot,
            attempts: self.attempts,
            failed: self.failed,
            last_error: self.last_error,
            enqueued_at: self.enqueued_at,
        })
    }
}

/// Where the drain loop currently is. Exposed through `SyncStatus` so the UI
/// banner can say more than online/offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Draining,
    Backoff,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub pending_count: i64,
    pub failed_count: i64,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
    pub engine_state: EngineState,
}

/// Push-style change notifications for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    ListChanged,
    StatusChanged,
}
