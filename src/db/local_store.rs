use std::collections::HashMap;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::AppError;
use crate::models::{
    ActionKind, ActionRow, PendingAction, Reminder, ReminderFields, ReminderRow, SyncState,
};

pub const META_LAST_SYNC_AT: &str = "last_sync_at";
pub const META_SCHEMA_VERSION: &str = "schema_version";

const UPSERT_REMINDER_SQL: &str =
    "INSERT INTO reminders (local_id, server_id, fields, version, last_error, created_at, updated_at)
     VALUES (?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(local_id) DO UPDATE SET
        server_id = excluded.server_id,
        fields = excluded.fields,
        version = excluded.version,
        last_error = excluded.last_error,
        updated_at = excluded.updated_at";

async fn upsert_reminder<'e, E>(executor: E, reminder: &Reminder) -> Result<(), AppError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let fields = serde_json::to_string(&reminder.fields)?;
    sqlx::query(UPSERT_REMINDER_SQL)
        .bind(&reminder.local_id)
        .bind(&reminder.server_id)
        .bind(fields)
        .bind(reminder.version)
        .bind(&reminder.last_error)
        .bind(&reminder.created_at)
        .bind(&reminder.updated_at)
        .execute(executor)
        .await?;
    Ok(())
}

async fn insert_action<'e, E>(
    executor: E,
    kind: ActionKind,
    local_id: &str,
    snapshot_json: Option<String>,
) -> Result<PendingAction, AppError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let enqueued_at = Utc::now().to_rfc3339();
    let row = sqlx::query_as::<_, ActionRow>(
        "INSERT INTO pending_actions (kind, local_id, snapshot, attempts, failed, last_error, enqueued_at)
         VALUES (?, ?, ?, 0, 0, NULL, ?)
         RETURNING id, kind, local_id, snapshot, attempts, failed, last_error, enqueued_at",
    )
    .bind(kind.as_str())
    .bind(local_id)
    .bind(snapshot_json)
    .bind(enqueued_at)
    .fetch_one(executor)
    .await?;
    Ok(row.into_action()?)
}

/// Durable persistence for the reminder cache, the pending-action log and the
/// sync metadata. Every mutating call is awaited until SQLite has committed, so
/// a crash right after a call never loses that change. Multi-row mutations run
/// in one transaction.
#[derive(Clone)]
pub struct LocalStore {
    db: SqlitePool,
}

impl LocalStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Sync state is derived from the still-pending actions for a local id,
    /// nothing else. Delete wins over create wins over update.
    pub fn derive_state<I>(server_id: Option<&str>, kinds: I) -> SyncState
    where
        I: IntoIterator<Item = ActionKind>,
    {
        let mut state = match server_id {
            Some(_) => SyncState::Synced,
            None => SyncState::PendingCreate,
        };
        for kind in kinds {
            match kind {
                ActionKind::Delete => return SyncState::PendingDelete,
                ActionKind::Create => state = SyncState::PendingCreate,
                ActionKind::Update => {
                    if state == SyncState::Synced {
                        state = SyncState::PendingUpdate;
                    }
                }
            }
        }
        state
    }

    pub async fn get_all(&self) -> Result<Vec<Reminder>, AppError> {
        let rows = sqlx::query_as::<_, ReminderRow>(
            "SELECT local_id, server_id, fields, version, last_error, created_at, updated_at
             FROM reminders ORDER BY created_at DESC",
        )
        .fetch_all(&self.db)
        .await?;

        let actions = self.list_actions().await?;
        let mut by_local: HashMap<&str, Vec<ActionKind>> = HashMap::new();
        for action in &actions {
            by_local
                .entry(action.local_id.as_str())
                .or_default()
                .push(action.kind);
        }

        let mut reminders = Vec::with_capacity(rows.len());
        for row in rows {
            let kinds = by_local
                .get(row.local_id.as_str())
                .cloned()
                .unwrap_or_default();
            let state = Self::derive_state(row.server_id.as_deref(), kinds);
            reminders.push(row.into_reminder(state)?);
        }
        Ok(reminders)
    }

    pub async fn get(&self, local_id: &str) -> Result<Option<Reminder>, AppError> {
        let row = sqlx::query_as::<_, ReminderRow>(
            "SELECT local_id, server_id, fields, version, last_error, created_at, updated_at
             FROM reminders WHERE local_id = ?",
        )
        .bind(local_id)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => {
                let actions = self.actions_for(local_id).await?;
                let state = Self::derive_state(row.server_id.as_deref(), actions.iter().map(|a| a.kind));
                Ok(Some(row.into_reminder(state)?))
            }
            None => Ok(None),
        }
    }

    pub async fn find_by_server_id(&self, server_id: &str) -> Result<Option<Reminder>, AppError> {
        let row = sqlx::query_as::<_, ReminderRow>(
            "SELECT local_id, server_id, fields, version, last_error, created_at, updated_at
             FROM reminders WHERE server_id = ?",
        )
        .bind(server_id)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => {
                let actions = self.actions_for(&row.local_id).await?;
                let state = Self::derive_state(row.server_id.as_deref(), actions.iter().map(|a| a.kind));
                Ok(Some(row.into_reminder(state)?))
            }
            None => Ok(None),
        }
    }

    /// Upsert one reminder row. `sync_state` is not written anywhere; it is
    /// recomputed on read.
    pub async fn put(&self, reminder: &Reminder) -> Result<(), AppError> {
        upsert_reminder(&self.db, reminder).await
    }

    /// Upsert the reminder row and append an action for it in one transaction,
    /// so a cached write can never land without its queued action.
    pub async fn put_with_action(
        &self,
        reminder: &Reminder,
        kind: ActionKind,
        snapshot: Option<&ReminderFields>,
    ) -> Result<PendingAction, AppError> {
        let snapshot_json = match snapshot {
            Some(fields) => Some(serde_json::to_string(fields)?),
            None => None,
        };
        let mut tx = self.db.begin().await?;
        upsert_reminder(&mut *tx, reminder).await?;
        let action = insert_action(&mut *tx, kind, &reminder.local_id, snapshot_json).await?;
        tx.commit().await?;
        Ok(action)
    }

    /// Upsert the reminder row and fold its fields into a still-queued action
    /// (coalescing), in one transaction. Attempts and last_error are reset: the
    /// old payload's failures do not apply to the new one.
    pub async fn put_replacing_snapshot(
        &self,
        reminder: &Reminder,
        action_id: i64,
    ) -> Result<(), AppError> {
        let snapshot_json = serde_json::to_string(&reminder.fields)?;
        let mut tx = self.db.begin().await?;
        upsert_reminder(&mut *tx, reminder).await?;
        sqlx::query(
            "UPDATE pending_actions SET snapshot = ?, attempts = 0, failed = 0, last_error = NULL
             WHERE id = ?",
        )
        .bind(snapshot_json)
        .bind(action_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// local_id -> server_id for every cached reminder. Cheap enough to feed
    /// the dependency gating in one query.
    pub async fn server_ids(&self) -> Result<HashMap<String, Option<String>>, AppError> {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT local_id, server_id FROM reminders")
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn remove_by_local_id(&self, local_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM reminders WHERE local_id = ?")
            .bind(local_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_last_error(
        &self,
        local_id: &str,
        message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE reminders SET last_error = ? WHERE local_id = ?")
            .bind(message)
            .bind(local_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn append_action(
        &self,
        kind: ActionKind,
        local_id: &str,
        snapshot: Option<&ReminderFields>,
    ) -> Result<PendingAction, AppError> {
        let snapshot_json = match snapshot {
            Some(fields) => Some(serde_json::to_string(fields)?),
            None => None,
        };
        insert_action(&self.db, kind, local_id, snapshot_json).await
    }

    pub async fn list_actions(&self) -> Result<Vec<PendingAction>, AppError> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT id, kind, local_id, snapshot, attempts, failed, last_error, enqueued_at
             FROM pending_actions ORDER BY id ASC",
        )
        .fetch_all(&self.db)
        .await?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            actions.push(row.into_action()?);
        }
        Ok(actions)
    }

    pub async fn actions_for(&self, local_id: &str) -> Result<Vec<PendingAction>, AppError> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT id, kind, local_id, snapshot, attempts, failed, last_error, enqueued_at
             FROM pending_actions WHERE local_id = ? ORDER BY id ASC",
        )
        .bind(local_id)
        .fetch_all(&self.db)
        .await?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            actions.push(row.into_action()?);
        }
        Ok(actions)
    }

    pub async fn remove_action(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM pending_actions WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn remove_updates_for(&self, local_id: &str) -> Result<u64, AppError> {
        let result =
            sqlx::query("DELETE FROM pending_actions WHERE local_id = ? AND kind = 'update'")
                .bind(local_id)
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn record_attempt(&self, id: i64, message: &str) -> Result<i64, AppError> {
        sqlx::query("UPDATE pending_actions SET attempts = attempts + 1, last_error = ? WHERE id = ?")
            .bind(message)
            .bind(id)
            .execute(&self.db)
            .await?;

        let (attempts,): (i64,) =
            sqlx::query_as("SELECT attempts FROM pending_actions WHERE id = ?")
                .bind(id)
                .fetch_one(&self.db)
                .await?;
        Ok(attempts)
    }

    /// Permanently failed: kept in the log, skipped by batches, waits for an
    /// explicit retry or discard.
    pub async fn mark_action_failed(&self, id: i64, message: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE pending_actions SET failed = 1, last_error = ? WHERE id = ?")
            .bind(message)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn reset_failed_actions(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE pending_actions SET failed = 0, attempts = 0, last_error = NULL WHERE failed = 1",
        )
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_action(&self, id: i64) -> Result<Option<PendingAction>, AppError> {
        let row = sqlx::query_as::<_, ActionRow>(
            "SELECT id, kind, local_id, snapshot, attempts, failed, last_error, enqueued_at
             FROM pending_actions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(match row {
            Some(row) => Some(row.into_action()?),
            None => None,
        })
    }

    pub async fn pending_count(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_actions")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    pub async fn failed_count(&self) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_actions WHERE failed = 1")
                .fetch_one(&self.db)
                .await?;
        Ok(count)
    }

    /// Confirmation of a create: the server id lands and the action leaves the
    /// log in one transaction, so there is no window in which the response was
    /// applied but the action could be replayed.
    pub async fn confirm_create(
        &self,
        action_id: i64,
        local_id: &str,
        server_id: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "UPDATE reminders SET server_id = ?, last_error = NULL WHERE local_id = ?",
        )
        .bind(server_id)
        .bind(local_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM pending_actions WHERE id = ?")
            .bind(action_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Invariant 4: a reminder whose create never reached the server vanishes
    /// together with its whole action chain, atomically.
    pub async fn cancel_unconfirmed_create(&self, local_id: &str) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM pending_actions WHERE local_id = ?")
            .bind(local_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM reminders WHERE local_id = ?")
            .bind(local_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// A confirmed delete (or a 404/410 on update/delete) purges the reminder
    /// and any residual queue entries in one transaction.
    pub async fn purge_reminder(&self, local_id: &str) -> Result<(), AppError> {
        self.cancel_unconfirmed_create(local_id).await
    }

    pub async fn get_last_sync_at(&self) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM sync_meta WHERE key = ?")
                .bind(META_LAST_SYNC_AT)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_last_sync_at(&self, ts: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO sync_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(META_LAST_SYNC_AT)
        .bind(ts)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM sync_meta WHERE key = ?")
                .bind(META_SCHEMA_VERSION)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(v,)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReminderDate, SyncState};

    async fn setup_test_db() -> LocalStore {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create test db");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        LocalStore::new(pool)
    }

    fn sample_fields(title: &str) -> ReminderFields {
        ReminderFields {
            title: title.to_string(),
            kind: Some("birthday".to_string()),
            date: ReminderDate {
                year: None,
                month: 5,
                day: 12,
            },
            group: None,
            recurrence: Some("yearly".to_string()),
        }
    }

    fn sample_reminder(local_id: &str, title: &str) -> Reminder {
        let now = Utc::now().to_rfc3339();
        Reminder {
            local_id: local_id.to_string(),
            server_id: None,
            fields: sample_fields(title),
            sync_state: SyncState::PendingCreate,
            version: 1,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrips_fields() {
        let store = setup_test_db().await;
        store.put(&sample_reminder("l1", "Anna")).await.unwrap();

        let got = store.get("l1").await.unwrap().expect("reminder missing");
        assert_eq!(got.fields.title, "Anna");
        assert_eq!(got.version, 1);
        // No pending create queued yet, but no server id either.
        assert_eq!(got.sync_state, SyncState::PendingCreate);
    }

    #[tokio::test]
    async fn test_state_derived_from_action_log() {
        let store = setup_test_db().await;
        let mut reminder = sample_reminder("l1", "Anna");
        store.put(&reminder).await.unwrap();

        let action = store
            .append_action(ActionKind::Create, "l1", Some(&reminder.fields))
            .await
            .unwrap();
        assert_eq!(
            store.get("l1").await.unwrap().unwrap().sync_state,
            SyncState::PendingCreate
        );

        store.confirm_create(action.id, "l1", "srv-1").await.unwrap();
        let got = store.get("l1").await.unwrap().unwrap();
        assert_eq!(got.sync_state, SyncState::Synced);
        assert_eq!(got.server_id.as_deref(), Some("srv-1"));
        assert_eq!(store.pending_count().await.unwrap(), 0);

        reminder.server_id = Some("srv-1".to_string());
        store
            .append_action(ActionKind::Update, "l1", Some(&reminder.fields))
            .await
            .unwrap();
        assert_eq!(
            store.get("l1").await.unwrap().unwrap().sync_state,
            SyncState::PendingUpdate
        );

        store.append_action(ActionKind::Delete, "l1", None).await.unwrap();
        assert_eq!(
            store.get("l1").await.unwrap().unwrap().sync_state,
            SyncState::PendingDelete
        );
    }

    #[tokio::test]
    async fn test_actions_keep_enqueue_order() {
        let store = setup_test_db().await;
        let fields = sample_fields("a");
        store.append_action(ActionKind::Create, "l1", Some(&fields)).await.unwrap();
        store.append_action(ActionKind::Create, "l2", Some(&fields)).await.unwrap();
        store.append_action(ActionKind::Update, "l1", Some(&fields)).await.unwrap();

        let actions = store.list_actions().await.unwrap();
        let ids: Vec<i64> = actions.iter().map(|a| a.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(actions[0].local_id, "l1");
        assert_eq!(actions[1].local_id, "l2");
        assert_eq!(actions[2].kind, ActionKind::Update);
    }

    #[tokio::test]
    async fn test_put_with_action_writes_row_and_queue_together() {
        let store = setup_test_db().await;
        let reminder = sample_reminder("l1", "Anna");

        let action = store
            .put_with_action(&reminder, ActionKind::Create, Some(&reminder.fields))
            .await
            .unwrap();
        assert_eq!(action.kind, ActionKind::Create);
        assert_eq!(store.pending_count().await.unwrap(), 1);
        let got = store.get("l1").await.unwrap().unwrap();
        assert_eq!(got.sync_state, SyncState::PendingCreate);

        let mut edited = reminder.clone();
        edited.fields.title = "Anna Maria".to_string();
        store.put_replacing_snapshot(&edited, action.id).await.unwrap();

        let actions = store.actions_for("l1").await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].snapshot.as_ref().unwrap().title, "Anna Maria");
        assert_eq!(
            store.get("l1").await.unwrap().unwrap().fields.title,
            "Anna Maria"
        );
    }

    #[tokio::test]
    async fn test_cancel_unconfirmed_create_is_atomic() {
        let store = setup_test_db().await;
        let reminder = sample_reminder("l1", "Anna");
        store.put(&reminder).await.unwrap();
        store
            .append_action(ActionKind::Create, "l1", Some(&reminder.fields))
            .await
            .unwrap();

        store.cancel_unconfirmed_create("l1").await.unwrap();
        assert!(store.get("l1").await.unwrap().is_none());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attempts_and_permanent_failure() {
        let store = setup_test_db().await;
        let fields = sample_fields("a");
        let action = store
            .append_action(ActionKind::Create, "l1", Some(&fields))
            .await
            .unwrap();

        assert_eq!(store.record_attempt(action.id, "timeout").await.unwrap(), 1);
        assert_eq!(store.record_attempt(action.id, "timeout").await.unwrap(), 2);

        store.mark_action_failed(action.id, "gave up").await.unwrap();
        assert_eq!(store.failed_count().await.unwrap(), 1);

        assert_eq!(store.reset_failed_actions().await.unwrap(), 1);
        let reset = store.find_action(action.id).await.unwrap().unwrap();
        assert!(!reset.failed);
        assert_eq!(reset.attempts, 0);
    }

    #[tokio::test]
    async fn test_last_sync_meta() {
        let store = setup_test_db().await;
        assert!(store.get_last_sync_at().await.unwrap().is_none());
        store.set_last_sync_at("2026-02-01T00:00:00Z").await.unwrap();
        assert_eq!(
            store.get_last_sync_at().await.unwrap().as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
        assert_eq!(store.schema_version().await.unwrap().as_deref(), Some("1"));
    }
}
