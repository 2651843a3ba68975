use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Date components of a reminder. Year is optional so recurring birthdays can
/// omit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderDate {
    pub year: Option<i32>,
    pub month: u8,
    pub day: u8,
}

/// The user-visible payload of a reminder. The sync layer treats this as an
/// opaque blob; it is persisted as a single JSON column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderFields {
    pub title: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub date: ReminderDate,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub recurrence: Option<String>,
}

/// Derived from the pending-action log, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub local_id: String,
    pub server_id: Option<String>,
    pub fields: ReminderFields,
    pub sync_state: SyncState,
    pub version: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Raw row shape; `fields` is JSON text and `sync_state` is attached afterwards
/// from the action log.
#[derive(Debug, Clone, FromRow)]
pub struct ReminderRow {
    pub local_id: String,
    pub server_id: Option<String>,
    pub fields: String,
    pub version: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ReminderRow {
    pub fn into_reminder(self, sync_state: SyncState) -> Result<Reminder, serde_json::Error> {
        let fields: ReminderFields = serde_json::from_str(&self.fields)?;
        Ok(Reminder {
            local_id: self.local_id,
            server_id: self.server_id,
            fields,
            sync_state,
            version: self.version,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReminderRequest {
    #[serde(flatten)]
    pub fields: ReminderFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateReminderRequest {
    pub title: Option<String>,
    pub kind: Option<String>,
    pub date: Option<ReminderDate>,
    pub group: Option<String>,
    pub recurrence: Option<String>,
}

impl UpdateReminderRequest {
    /// Merge the patch into an existing payload, producing the full snapshot
    /// that gets queued.
    pub fn apply_to(&self, fields: &ReminderFields) -> ReminderFields {
        ReminderFields {
            title: self.title.clone().unwrap_or_else(|| fields.title.clone()),
            kind: self.kind.clone().or_else(|| fields.kind.clone()),
            date: self.date.clone().unwrap_or_else(|| fields.date.clone()),
            group: self.group.clone().or_else(|| fields.group.clone()),
            recurrence: self.recurrence.clone().or_else(|| fields.recurrence.clone()),
        }
    }
}
