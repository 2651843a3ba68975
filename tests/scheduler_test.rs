use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use reminderd::connectivity::ConnectivityMonitor;
use reminderd::models::{ReminderDate, ReminderFields, SyncState};
use reminderd::remote::InMemoryRemote;
use reminderd::services::{SyncConfig, SyncScheduler};
use reminderd::store::ReminderStore;

async fn setup_store(online: bool) -> (ReminderStore, ConnectivityMonitor) {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let connectivity = ConnectivityMonitor::new(online);
    let store = ReminderStore::new(
        pool,
        Arc::new(InMemoryRemote::new()),
        connectivity.clone(),
        SyncConfig::default(),
    );
    (store, connectivity)
}

fn sample_fields() -> ReminderFields {
    ReminderFields {
        title: "Dentist".to_string(),
        kind: Some("event".to_string()),
        date: ReminderDate {
            year: Some(2026),
            month: 9,
            day: 3,
        },
        group: None,
        recurrence: None,
    }
}

#[tokio::test]
async fn test_scheduler_initialization() {
    let (store, connectivity) = setup_store(true).await;
    let _scheduler = SyncScheduler::new(store.engine(), connectivity, 10);
}

#[tokio::test]
async fn test_scheduler_drains_queue_on_interval() {
    let (store, connectivity) = setup_store(true).await;

    let created = store.create_reminder(sample_fields()).await.unwrap();
    assert_eq!(store.sync_status().await.unwrap().pending_count, 1);

    let scheduler = SyncScheduler::new(store.engine(), connectivity, 1);
    let scheduler_task = tokio::spawn(scheduler.start());

    let mut synced = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reminder = store.get_reminder(&created.local_id).await.unwrap().unwrap();
        if reminder.sync_state == SyncState::Synced {
            synced = true;
            break;
        }
    }
    scheduler_task.abort();

    assert!(synced, "scheduler never drained the queue");
    assert_eq!(store.sync_status().await.unwrap().pending_count, 0);
}

#[tokio::test]
async fn test_scheduler_skips_while_offline() {
    let (store, connectivity) = setup_store(false).await;

    store.create_reminder(sample_fields()).await.unwrap();

    let scheduler = SyncScheduler::new(store.engine(), connectivity, 1);
    let scheduler_task = tokio::spawn(scheduler.start());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    scheduler_task.abort();

    assert_eq!(store.sync_status().await.unwrap().pending_count, 1);
}
