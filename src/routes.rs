use axum::Json;
use axum::extract::{Path, Query};
use axum::routing::{delete, post};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{NewReminderRequest, Reminder, SyncStatus, UpdateReminderRequest};
use crate::services::SyncReport;
use crate::state::AppState;

#[derive(Deserialize)]
struct ReminderQueryParams {
    #[serde(default)]
    include_deleted: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/reminders", get(list_reminders).post(create_reminder))
        .route(
            "/reminders/{id}",
            get(get_reminder).patch(update_reminder).delete(delete_reminder),
        )
        .route("/sync", post(sync_now))
        .route("/sync/status", get(sync_status))
        .route("/sync/retry", post(retry_failed))
        .route("/sync/actions/{id}", delete(discard_action))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.store.sync_status().await?;
    Ok(StatusCode::OK)
}

async fn list_reminders(
    State(state): State<AppState>,
    Query(params): Query<ReminderQueryParams>,
) -> Result<Json<Vec<Reminder>>, AppError> {
    let reminders = state.store.list_reminders(params.include_deleted).await?;
    Ok(Json(reminders))
}

async fn get_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Reminder>, AppError> {
    let reminder = state
        .store
        .get_reminder(&id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(reminder))
}

async fn create_reminder(
    State(state): State<AppState>,
    Json(req): Json<NewReminderRequest>,
) -> Result<Json<Reminder>, AppError> {
    let reminder = state.store.create_reminder(req.fields).await?;
    Ok(Json(reminder))
}

async fn update_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateReminderRequest>,
) -> Result<Json<Reminder>, AppError> {
    let reminder = state.store.update_reminder(&id, req).await?;
    Ok(Json(reminder))
}

async fn delete_reminder(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store.delete_reminder(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    let status = state.store.sync_status().await?;
    Ok(Json(status))
}

async fn sync_now(State(state): State<AppState>) -> Result<Json<SyncReport>, AppError> {
    let report = state.store.sync_now().await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct RetryResponse {
    retried: u64,
}

async fn retry_failed(State(state): State<AppState>) -> Result<Json<RetryResponse>, AppError> {
    let retried = state.store.retry_failed().await?;
    Ok(Json(RetryResponse { retried }))
}

async fn discard_action(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.store.discard_action(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
