use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::db::LocalStore;
use crate::error::AppError;
use crate::models::{ActionKind, PendingAction, Reminder, SyncState};

/// Id of the action the drain loop is currently sending, if any. Shared
/// between the queue and the engine: an in-flight action must never be edited
/// or cancelled in place, because its payload is already on the wire.
#[derive(Clone, Default)]
pub struct InFlight(Arc<Mutex<Option<i64>>>);

impl InFlight {
    pub fn set(&self, id: i64) {
        *self.0.lock().expect("in-flight marker poisoned") = Some(id);
    }

    pub fn clear(&self) {
        *self.0.lock().expect("in-flight marker poisoned") = None;
    }

    pub fn contains(&self, id: i64) -> bool {
        *self.0.lock().expect("in-flight marker poisoned") == Some(id)
    }
}

/// What `enqueue_delete` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The create was still unconfirmed: reminder and queue entries vanished
    /// locally, nothing will be sent.
    CancelledLocally,
    /// A delete action is queued (superseding any queued updates).
    Enqueued,
}

/// Ordering/coalescing layer over the pending-action log.
#[derive(Clone)]
pub struct MutationQueue {
    store: LocalStore,
    in_flight: InFlight,
}

impl MutationQueue {
    pub fn new(store: LocalStore, in_flight: InFlight) -> Self {
        Self { store, in_flight }
    }

    /// Writes the cached reminder and its create action in one transaction.
    pub async fn enqueue_create(&self, reminder: &Reminder) -> Result<SyncState, AppError> {
        self.store
            .put_with_action(reminder, ActionKind::Create, Some(&reminder.fields))
            .await?;
        Ok(SyncState::PendingCreate)
    }

    /// Applies the coalescing rules before touching the log: a queued delete
    /// makes the update a no-op; an earlier still-queued create or update for
    /// the same reminder absorbs the new snapshot; otherwise a fresh update is
    /// appended. The cache row and the queue write land in one transaction.
    pub async fn enqueue_update(&self, reminder: &Reminder) -> Result<SyncState, AppError> {
        let actions = self.store.actions_for(&reminder.local_id).await?;

        if actions.iter().any(|a| a.kind == ActionKind::Delete) {
            debug!(local_id = %reminder.local_id, "update after queued delete ignored");
            return Ok(SyncState::PendingDelete);
        }

        let coalesce_target = actions
            .iter()
            .rev()
            .find(|a| !self.in_flight.contains(a.id))
            .map(|a| (a.id, a.kind));

        match coalesce_target {
            Some((id, kind)) => {
                debug!(
                    local_id = %reminder.local_id,
                    action_id = id,
                    "coalesced update into queued {}",
                    kind.as_str()
                );
                self.store.put_replacing_snapshot(reminder, id).await?;
            }
            None => {
                self.store
                    .put_with_action(reminder, ActionKind::Update, Some(&reminder.fields))
                    .await?;
            }
        }

        let actions = self.store.actions_for(&reminder.local_id).await?;
        Ok(LocalStore::derive_state(
            reminder.server_id.as_deref(),
            actions.iter().map(|a| a.kind),
        ))
    }

    /// Applies the cancellation rules: an unconfirmed, not-in-flight create
    /// collapses to nothing; otherwise queued updates are superseded and a
    /// delete is appended (at most one per reminder).
    pub async fn enqueue_delete(
        &self,
        local_id: &str,
        server_id: Option<&str>,
    ) -> Result<DeleteOutcome, AppError> {
        let actions = self.store.actions_for(local_id).await?;

        if actions.iter().any(|a| a.kind == ActionKind::Delete) {
            return Ok(DeleteOutcome::Enqueued);
        }

        if server_id.is_none() {
            let create_in_flight = actions
                .iter()
                .any(|a| a.kind == ActionKind::Create && self.in_flight.contains(a.id));
            if !create_in_flight {
                self.store.cancel_unconfirmed_create(local_id).await?;
                debug!(local_id, "delete cancelled unconfirmed create locally");
                return Ok(DeleteOutcome::CancelledLocally);
            }
            // The create is on the wire and may land; the delete has to chase
            // it through the queue.
        }

        self.store.remove_updates_for(local_id).await?;
        self.store
            .append_action(ActionKind::Delete, local_id, None)
            .await?;
        Ok(DeleteOutcome::Enqueued)
    }

    /// Actions ready to send, in enqueue order. Ready means: earliest queued
    /// action of its reminder's chain, not permanently failed, and (for
    /// update/delete) the reminder's server id is already known.
    pub async fn next_batch(&self) -> Result<Vec<PendingAction>, AppError> {
        let actions = self.store.list_actions().await?;
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        let server_ids = self.store.server_ids().await?;

        let mut seen = std::collections::HashSet::new();
        let mut batch = Vec::new();
        for action in actions {
            if !seen.insert(action.local_id.clone()) {
                continue;
            }
            if action.failed {
                // A failed head blocks its whole chain until retried or
                // discarded.
                continue;
            }
            let server_id = server_ids
                .get(&action.local_id)
                .and_then(|s| s.as_deref());
            match action.kind {
                ActionKind::Create => batch.push(action),
                ActionKind::Update | ActionKind::Delete => {
                    if server_id.is_some() {
                        batch.push(action);
                    }
                    // No server id and no earlier create in the chain cannot
                    // happen through the facade; if it does, the action stays
                    // queued and harmless.
                }
            }
        }
        Ok(batch)
    }

    pub async fn pending_count(&self) -> Result<i64, AppError> {
        self.store.pending_count().await
    }

    pub async fn failed_count(&self) -> Result<i64, AppError> {
        self.store.failed_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::SqlitePool;

    use crate::models::{ReminderDate, ReminderFields};

    async fn setup() -> (LocalStore, MutationQueue, InFlight) {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create test db");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        let store = LocalStore::new(pool);
        let in_flight = InFlight::default();
        let queue = MutationQueue::new(store.clone(), in_flight.clone());
        (store, queue, in_flight)
    }

    fn fields(title: &str) -> ReminderFields {
        ReminderFields {
            title: title.to_string(),
            kind: None,
            date: ReminderDate {
                year: Some(1990),
                month: 3,
                day: 7,
            },
            group: None,
            recurrence: None,
        }
    }

    fn reminder(local_id: &str, server_id: Option<&str>, title: &str) -> Reminder {
        let now = Utc::now().to_rfc3339();
        Reminder {
            local_id: local_id.to_string(),
            server_id: server_id.map(str::to_string),
            fields: fields(title),
            sync_state: SyncState::Synced,
            version: 1,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_two_offline_updates_coalesce_to_one_action() {
        let (store, queue, _) = setup().await;

        queue.enqueue_update(&reminder("l1", Some("s1"), "first")).await.unwrap();
        let state = queue
            .enqueue_update(&reminder("l1", Some("s1"), "second"))
            .await
            .unwrap();

        assert_eq!(state, SyncState::PendingUpdate);
        let actions = store.actions_for("l1").await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].snapshot.as_ref().unwrap().title, "second");
    }

    #[tokio::test]
    async fn test_update_folds_into_queued_create() {
        let (store, queue, _) = setup().await;
        queue.enqueue_create(&reminder("l1", None, "v1")).await.unwrap();

        let state = queue.enqueue_update(&reminder("l1", None, "v2")).await.unwrap();
        assert_eq!(state, SyncState::PendingCreate);

        let actions = store.actions_for("l1").await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Create);
        assert_eq!(actions[0].snapshot.as_ref().unwrap().title, "v2");
    }

    #[tokio::test]
    async fn test_delete_cancels_unconfirmed_create() {
        let (store, queue, _) = setup().await;
        queue.enqueue_create(&reminder("l1", None, "v1")).await.unwrap();

        let outcome = queue.enqueue_delete("l1", None).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::CancelledLocally);
        assert!(store.get("l1").await.unwrap().is_none());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_supersedes_queued_updates() {
        let (store, queue, _) = setup().await;
        queue.enqueue_update(&reminder("l1", Some("s1"), "v2")).await.unwrap();

        let outcome = queue.enqueue_delete("l1", Some("s1")).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Enqueued);

        let actions = store.actions_for("l1").await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Delete);
    }

    #[tokio::test]
    async fn test_update_after_delete_is_noop() {
        let (store, queue, _) = setup().await;
        queue.enqueue_delete("l1", Some("s1")).await.unwrap();

        let state = queue
            .enqueue_update(&reminder("l1", Some("s1"), "zombie"))
            .await
            .unwrap();
        assert_eq!(state, SyncState::PendingDelete);

        let actions = store.actions_for("l1").await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Delete);
    }

    #[tokio::test]
    async fn test_in_flight_create_is_not_cancelled() {
        let (store, queue, in_flight) = setup().await;
        queue.enqueue_create(&reminder("l1", None, "v1")).await.unwrap();
        let create = store.actions_for("l1").await.unwrap().remove(0);
        in_flight.set(create.id);

        let outcome = queue.enqueue_delete("l1", None).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Enqueued);

        // Create stays (it is on the wire); a delete is queued behind it.
        let actions = store.actions_for("l1").await.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, ActionKind::Create);
        assert_eq!(actions[1].kind, ActionKind::Delete);
    }

    #[tokio::test]
    async fn test_batch_gates_update_on_unconfirmed_create() {
        let (_, queue, _) = setup().await;
        queue.enqueue_create(&reminder("l1", None, "a")).await.unwrap();
        queue.enqueue_update(&reminder("l2", Some("s2"), "b")).await.unwrap();

        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        // Only the chain head per reminder; the l1 create gates everything
        // later for l1.
        assert_eq!(batch[0].local_id, "l1");
        assert_eq!(batch[0].kind, ActionKind::Create);
        assert_eq!(batch[1].local_id, "l2");
    }

    #[tokio::test]
    async fn test_failed_head_blocks_its_chain() {
        let (store, queue, _) = setup().await;
        queue.enqueue_create(&reminder("l1", None, "a")).await.unwrap();
        let create = store.actions_for("l1").await.unwrap().remove(0);
        store.mark_action_failed(create.id, "rejected").await.unwrap();

        assert!(queue.next_batch().await.unwrap().is_empty());
        assert_eq!(queue.failed_count().await.unwrap(), 1);
    }
}
