use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::db::LocalStore;
use crate::error::AppError;
use crate::models::{
    ActionKind, EngineState, PendingAction, Reminder, StoreEvent, SyncState,
};
use crate::queue::{InFlight, MutationQueue};
use crate::remote::{RemoteApi, RemoteError, ReminderPayload};

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// First retry delay; doubled per attempt.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Retryable failures tolerated before an action is marked permanently
    /// failed.
    pub max_attempts: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// What one drain pass accomplished.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub pulled: usize,
    pub removed: usize,
}

impl SyncReport {
    fn changed_anything(&self) -> bool {
        self.created + self.updated + self.deleted + self.pulled + self.removed > 0
    }
}

enum ActionResult {
    Applied(ActionKind),
    /// 404/410 on update/delete: the remote object is gone, local state was
    /// reconciled to match.
    RemoteGone,
    Rejected(String),
    Retry(RemoteError),
}

/// Drains the mutation queue against the remote resource. One logical drain at
/// a time; triggers during a drain coalesce into a single extra pass.
pub struct SyncEngine {
    store: LocalStore,
    queue: MutationQueue,
    remote: Arc<dyn RemoteApi>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    in_flight: InFlight,
    state: Mutex<EngineState>,
    last_error: Mutex<Option<String>>,
    drain_lock: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    wakeup: Notify,
    events: broadcast::Sender<StoreEvent>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        queue: MutationQueue,
        remote: Arc<dyn RemoteApi>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
        in_flight: InFlight,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        let state = if connectivity.is_online() {
            EngineState::Idle
        } else {
            EngineState::Offline
        };
        Self {
            store,
            queue,
            remote,
            connectivity,
            config,
            in_flight,
            state: Mutex::new(state),
            last_error: Mutex::new(None),
            drain_lock: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            wakeup: Notify::new(),
            events,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().expect("engine state poisoned")
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("engine state poisoned").clone()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().expect("engine state poisoned") = state;
    }

    fn set_last_error(&self, message: Option<String>) {
        *self.last_error.lock().expect("engine state poisoned") = message;
    }

    /// Kick the background loop. Safe to call from anywhere; triggers while a
    /// drain is running fold into one extra pass.
    pub fn trigger(&self) {
        self.rerun.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    /// Background loop: waits for triggers or connectivity transitions and
    /// drains. Runs until the connectivity monitor is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut conn = self.connectivity.subscribe();
        loop {
            if !self.connectivity.is_online() {
                self.set_state(EngineState::Offline);
                if conn.changed().await.is_err() {
                    break;
                }
                if *conn.borrow() {
                    info!("connectivity restored, draining");
                    self.trigger();
                }
                continue;
            }

            tokio::select! {
                _ = self.wakeup.notified() => {}
                changed = conn.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            loop {
                self.rerun.store(false, Ordering::SeqCst);
                if let Err(e) = self.drain().await {
                    warn!("drain failed: {}", e);
                    self.set_last_error(Some(e.to_string()));
                }
                if !self.rerun.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    /// Immediate drain attempt, bypassing the idle loop. Rejects with a
    /// structured reason when unreachable.
    pub async fn sync_now(&self) -> Result<SyncReport, AppError> {
        if !self.connectivity.is_online() {
            return Err(AppError::Offline("cannot sync while offline".to_string()));
        }
        // Wake any drain parked in a backoff timer so we do not queue behind
        // the full delay.
        self.wakeup.notify_one();
        self.drain().await
    }

    fn backoff_delay(&self, attempts: i64) -> Duration {
        let exp = attempts.saturating_sub(1).min(16) as u32;
        let delay = self.config.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.config.backoff_cap)
    }

    async fn drain(&self) -> Result<SyncReport, AppError> {
        let _guard = self.drain_lock.lock().await;
        self.set_state(EngineState::Draining);
        let mut report = SyncReport::default();

        'outer: loop {
            if !self.connectivity.is_online() {
                self.set_state(EngineState::Offline);
                return Ok(report);
            }

            let batch = self.queue.next_batch().await?;
            if batch.is_empty() {
                break;
            }
            debug!("draining batch of {}", batch.len());

            for action in batch {
                if !self.connectivity.is_online() {
                    self.set_state(EngineState::Offline);
                    return Ok(report);
                }

                // The batch is a snapshot: the facade may have cancelled,
                // coalesced, or failed this action since it was computed.
                // Re-read under the in-flight marker before sending.
                self.in_flight.set(action.id);
                let action = match self.store.find_action(action.id).await {
                    Ok(Some(current)) if !current.failed => current,
                    Ok(_) => {
                        debug!(action_id = action.id, "action gone before dispatch, skipping");
                        self.in_flight.clear();
                        continue;
                    }
                    Err(e) => {
                        self.in_flight.clear();
                        return Err(e);
                    }
                };
                let result = self.dispatch(&action).await;
                self.in_flight.clear();

                match result? {
                    ActionResult::Applied(kind) => {
                        match kind {
                            ActionKind::Create => report.created += 1,
                            ActionKind::Update => report.updated += 1,
                            ActionKind::Delete => report.deleted += 1,
                        }
                        let _ = self.events.send(StoreEvent::ListChanged);
                    }
                    ActionResult::RemoteGone => {
                        report.deleted += 1;
                        let _ = self.events.send(StoreEvent::ListChanged);
                    }
                    ActionResult::Rejected(message) => {
                        report.rejected += 1;
                        self.set_last_error(Some(message));
                        let _ = self.events.send(StoreEvent::StatusChanged);
                    }
                    ActionResult::Retry(err) => {
                        let attempts =
                            self.store.record_attempt(action.id, &err.to_string()).await?;
                        self.set_last_error(Some(err.to_string()));

                        if attempts >= self.config.max_attempts {
                            warn!(
                                action_id = action.id,
                                attempts, "giving up on action: {}", err
                            );
                            self.store
                                .mark_action_failed(action.id, &err.to_string())
                                .await?;
                            report.failed += 1;
                            let _ = self.events.send(StoreEvent::StatusChanged);
                            continue;
                        }

                        let delay = self.backoff_delay(attempts);
                        debug!(
                            action_id = action.id,
                            attempts,
                            "retryable failure, backing off {:?}: {}",
                            delay,
                            err
                        );
                        self.set_state(EngineState::Backoff);
                        if !self.wait_backoff(delay).await {
                            self.set_state(EngineState::Offline);
                            return Ok(report);
                        }
                        self.set_state(EngineState::Draining);
                        continue 'outer;
                    }
                }
            }
        }

        // Queue drained clean: pull the authoritative list and merge.
        match self.reconcile().await {
            Ok((pulled, removed)) => {
                report.pulled = pulled;
                report.removed = removed;
                self.store
                    .set_last_sync_at(&chrono::Utc::now().to_rfc3339())
                    .await?;
                // Failed or rejected actions keep their error visible; only a
                // clean, empty queue resets the banner.
                if report.rejected == 0 && self.store.pending_count().await? == 0 {
                    self.set_last_error(None);
                }
            }
            Err(AppError::Remote(e)) if e.is_retryable() => {
                // The push half succeeded; a failed pull is not worth a
                // backoff cycle, the next drain will retry it.
                warn!("reconcile fetch failed: {}", e);
                self.set_last_error(Some(e.to_string()));
            }
            Err(e) => return Err(e),
        }

        self.set_state(EngineState::Idle);
        if report.changed_anything() {
            let _ = self.events.send(StoreEvent::ListChanged);
        }
        let _ = self.events.send(StoreEvent::StatusChanged);
        info!(
            "drain complete: {} created, {} updated, {} deleted, {} rejected, {} pulled, {} removed",
            report.created, report.updated, report.deleted, report.rejected, report.pulled,
            report.removed
        );
        Ok(report)
    }

    /// Sleep out the backoff, but abort early on a trigger and abandon the
    /// drain when connectivity goes away. Returns false when offline.
    async fn wait_backoff(&self, delay: Duration) -> bool {
        let mut conn = self.connectivity.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.wakeup.notified() => {}
            _ = async {
                loop {
                    if conn.changed().await.is_err() {
                        break;
                    }
                    if !*conn.borrow() {
                        break;
                    }
                }
            } => {}
        }
        self.connectivity.is_online()
    }

    async fn dispatch(&self, action: &PendingAction) -> Result<ActionResult, AppError> {
        match action.kind {
            ActionKind::Create => self.dispatch_create(action).await,
            ActionKind::Update => self.dispatch_update(action).await,
            ActionKind::Delete => self.dispatch_delete(action).await,
        }
    }

    async fn dispatch_create(&self, action: &PendingAction) -> Result<ActionResult, AppError> {
        let fields = action
            .snapshot
            .clone()
            .ok_or_else(|| AppError::BadRequest("create action without snapshot".to_string()))?;
        let payload = ReminderPayload {
            client_ref: Some(action.local_id.clone()),
            fields,
        };

        match self.remote.create_reminder(&payload).await {
            Ok(remote) => {
                // Server id assignment and action removal are one transaction,
                // so a crash cannot leave the response half-applied.
                self.store
                    .confirm_create(action.id, &action.local_id, &remote.id)
                    .await?;
                debug!(local_id = %action.local_id, server_id = %remote.id, "create confirmed");
                Ok(ActionResult::Applied(ActionKind::Create))
            }
            Err(e) if e.is_retryable() => Ok(ActionResult::Retry(e)),
            Err(e) => {
                // Removing a rejected create would leave a reminder without a
                // server id and without a pending create, so it is parked as
                // permanently failed instead.
                warn!(local_id = %action.local_id, "create rejected: {}", e);
                self.store.mark_action_failed(action.id, &e.to_string()).await?;
                self.store
                    .set_last_error(&action.local_id, Some(&e.to_string()))
                    .await?;
                Ok(ActionResult::Rejected(e.to_string()))
            }
        }
    }

    async fn dispatch_update(&self, action: &PendingAction) -> Result<ActionResult, AppError> {
        let server_id = self
            .server_id_of(&action.local_id)
            .await?
            .ok_or_else(|| AppError::BadRequest("update dispatched before create".to_string()))?;
        let fields = action
            .snapshot
            .clone()
            .ok_or_else(|| AppError::BadRequest("update action without snapshot".to_string()))?;
        let payload = ReminderPayload {
            client_ref: Some(action.local_id.clone()),
            fields,
        };

        match self.remote.update_reminder(&server_id, &payload).await {
            Ok(_) => {
                self.store.remove_action(action.id).await?;
                self.store.set_last_error(&action.local_id, None).await?;
                Ok(ActionResult::Applied(ActionKind::Update))
            }
            Err(RemoteError::Gone) => {
                // Already deleted on the server; reconcile local state to
                // "gone" without treating it as an error.
                info!(local_id = %action.local_id, "remote object gone, removing locally");
                self.store.purge_reminder(&action.local_id).await?;
                Ok(ActionResult::RemoteGone)
            }
            Err(e) if e.is_retryable() => Ok(ActionResult::Retry(e)),
            Err(e) => {
                warn!(local_id = %action.local_id, "update rejected: {}", e);
                self.store.remove_action(action.id).await?;
                self.store
                    .set_last_error(&action.local_id, Some(&e.to_string()))
                    .await?;
                Ok(ActionResult::Rejected(e.to_string()))
            }
        }
    }

    async fn dispatch_delete(&self, action: &PendingAction) -> Result<ActionResult, AppError> {
        let server_id = self
            .server_id_of(&action.local_id)
            .await?
            .ok_or_else(|| AppError::BadRequest("delete dispatched before create".to_string()))?;

        match self.remote.delete_reminder(&server_id).await {
            Ok(()) | Err(RemoteError::Gone) => {
                self.store.purge_reminder(&action.local_id).await?;
                Ok(ActionResult::Applied(ActionKind::Delete))
            }
            Err(e) if e.is_retryable() => Ok(ActionResult::Retry(e)),
            Err(e) => {
                warn!(local_id = %action.local_id, "delete rejected: {}", e);
                self.store.remove_action(action.id).await?;
                self.store
                    .set_last_error(&action.local_id, Some(&e.to_string()))
                    .await?;
                Ok(ActionResult::Rejected(e.to_string()))
            }
        }
    }

    async fn server_id_of(&self, local_id: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .store
            .get(local_id)
            .await?
            .and_then(|r| r.server_id))
    }

    /// Post-drain merge of the authoritative list: synced entries follow the
    /// server, entries with pending actions keep their local intent, synced
    /// entries the server no longer has are dropped, and unknown server
    /// entries are adopted.
    async fn reconcile(&self) -> Result<(usize, usize), AppError> {
        let remote_list = self.remote.list_reminders().await.map_err(AppError::Remote)?;
        let locals = self.store.get_all().await?;

        let mut pulled = 0;
        let mut removed = 0;

        for obj in &remote_list {
            let local = locals
                .iter()
                .find(|r| r.server_id.as_deref() == Some(obj.id.as_str()))
                .or_else(|| {
                    obj.client_ref
                        .as_ref()
                        .and_then(|cr| locals.iter().find(|r| &r.local_id == cr))
                });

            match local {
                Some(local) if local.sync_state == SyncState::Synced => {
                    if local.fields != obj.fields || local.server_id.as_deref() != Some(obj.id.as_str()) {
                        // last_error stays: a pull overwriting a rejected edit
                        // must not hide why the edit bounced.
                        let mut updated = local.clone();
                        updated.server_id = Some(obj.id.clone());
                        updated.fields = obj.fields.clone();
                        updated.updated_at = obj
                            .updated_at
                            .clone()
                            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
                        self.store.put(&updated).await?;
                        pulled += 1;
                    }
                }
                Some(_) => {
                    // Local intent pending; a stale read must not clobber it.
                    debug!(server_id = %obj.id, "skipping pull, local changes pending");
                }
                None => {
                    let now = chrono::Utc::now().to_rfc3339();
                    let reminder = Reminder {
                        local_id: uuid::Uuid::new_v4().to_string(),
                        server_id: Some(obj.id.clone()),
                        fields: obj.fields.clone(),
                        sync_state: SyncState::Synced,
                        version: 1,
                        last_error: None,
                        created_at: now.clone(),
                        updated_at: obj.updated_at.clone().unwrap_or(now),
                    };
                    self.store.put(&reminder).await?;
                    pulled += 1;
                }
            }
        }

        for local in &locals {
            if local.sync_state != SyncState::Synced {
                continue;
            }
            let Some(server_id) = local.server_id.as_deref() else {
                continue;
            };
            if !remote_list.iter().any(|o| o.id == server_id) {
                self.store.purge_reminder(&local.local_id).await?;
                removed += 1;
            }
        }

        Ok((pulled, removed))
    }
}
