use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connectivity::ConnectivityMonitor;
use crate::db::LocalStore;
use crate::error::AppError;
use crate::models::{
    Reminder, ReminderFields, StoreEvent, SyncState, SyncStatus, UpdateReminderRequest,
};
use crate::queue::{DeleteOutcome, InFlight, MutationQueue};
use crate::remote::RemoteApi;
use crate::services::{SyncConfig, SyncEngine, SyncReport};

/// The facade everything else talks to. Reads return immediately from the
/// local cache; writes land durably in the cache and the mutation queue before
/// returning, then nudge the engine. All mutations pass serially through one
/// lock, so two concurrent calls never race on the same reminder.
pub struct ReminderStore {
    store: LocalStore,
    queue: MutationQueue,
    engine: Arc<SyncEngine>,
    connectivity: ConnectivityMonitor,
    in_flight: InFlight,
    write_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

impl ReminderStore {
    pub fn new(
        db: SqlitePool,
        remote: Arc<dyn RemoteApi>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        let store = LocalStore::new(db);
        let in_flight = InFlight::default();
        let queue = MutationQueue::new(store.clone(), in_flight.clone());
        let (events, _) = broadcast::channel(64);
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue.clone(),
            remote,
            connectivity.clone(),
            config,
            in_flight.clone(),
            events.clone(),
        ));
        Self {
            store,
            queue,
            engine,
            connectivity,
            in_flight,
            write_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Starts the engine's background drain loop.
    pub fn spawn_engine(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        tokio::spawn(engine.run())
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    /// Push-style change notifications (list and status updates).
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn list_reminders(&self, include_pending_delete: bool) -> Result<Vec<Reminder>, AppError> {
        let all = self.store.get_all().await?;
        if include_pending_delete {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|r| r.sync_state != SyncState::PendingDelete)
            .collect())
    }

    pub async fn get_reminder(&self, local_id: &str) -> Result<Option<Reminder>, AppError> {
        self.store.get(local_id).await
    }

    pub async fn create_reminder(&self, fields: ReminderFields) -> Result<Reminder, AppError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let reminder = Reminder {
            local_id: Uuid::new_v4().to_string(),
            server_id: None,
            fields,
            sync_state: SyncState::PendingCreate,
            version: 1,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.queue.enqueue_create(&reminder).await?;
        drop(_guard);

        let _ = self.events.send(StoreEvent::ListChanged);
        self.engine.trigger();
        Ok(reminder)
    }

    pub async fn update_reminder(
        &self,
        local_id: &str,
        patch: UpdateReminderRequest,
    ) -> Result<Reminder, AppError> {
        let _guard = self.write_lock.lock().await;
        let mut reminder = self
            .store
            .get(local_id)
            .await?
            .ok_or(AppError::NotFound)?;

        // Never resurrect: an update after a queued delete is a no-op.
        if reminder.sync_state == SyncState::PendingDelete {
            return Ok(reminder);
        }

        reminder.fields = patch.apply_to(&reminder.fields);
        reminder.version += 1;
        reminder.updated_at = Utc::now().to_rfc3339();
        reminder.sync_state = self.queue.enqueue_update(&reminder).await?;
        drop(_guard);

        let _ = self.events.send(StoreEvent::ListChanged);
        self.engine.trigger();
        Ok(reminder)
    }

    pub async fn delete_reminder(&self, local_id: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let reminder = self
            .store
            .get(local_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let outcome = self
            .queue
            .enqueue_delete(local_id, reminder.server_id.as_deref())
            .await?;
        drop(_guard);

        let _ = self.events.send(StoreEvent::ListChanged);
        if outcome == DeleteOutcome::Enqueued {
            self.engine.trigger();
        }
        Ok(())
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, AppError> {
        Ok(SyncStatus {
            online: self.connectivity.is_online(),
            pending_count: self.queue.pending_count().await?,
            failed_count: self.queue.failed_count().await?,
            last_sync_at: self.store.get_last_sync_at().await?,
            last_error: self.engine.last_error(),
            engine_state: self.engine.state(),
        })
    }

    /// Immediate drain, bypassing the idle/backoff timer. Errors with
    /// `AppError::Offline` when unreachable.
    pub async fn sync_now(&self) -> Result<SyncReport, AppError> {
        self.engine.sync_now().await
    }

    /// Puts permanently failed actions back in rotation.
    pub async fn retry_failed(&self) -> Result<u64, AppError> {
        let reset = self.store.reset_failed_actions().await?;
        if reset > 0 {
            self.engine.trigger();
        }
        Ok(reset)
    }

    /// Drops a permanently failed action the user gave up on. Discarding the
    /// create of a never-confirmed reminder removes the reminder with it.
    /// Healthy or in-flight actions cannot be discarded.
    pub async fn discard_action(&self, action_id: i64) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let action = self
            .store
            .find_action(action_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if !action.failed || self.in_flight.contains(action.id) {
            return Err(AppError::BadRequest(
                "only permanently failed actions can be discarded".to_string(),
            ));
        }

        let reminder = self.store.get(&action.local_id).await?;
        let unconfirmed_create = reminder
            .as_ref()
            .map(|r| r.server_id.is_none())
            .unwrap_or(false);

        if unconfirmed_create {
            self.store.cancel_unconfirmed_create(&action.local_id).await?;
        } else {
            self.store.remove_action(action_id).await?;
        }
        drop(_guard);

        let _ = self.events.send(StoreEvent::ListChanged);
        Ok(())
    }
}
