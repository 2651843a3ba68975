use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;
use crate::models::ReminderFields;

/// Error taxonomy for the remote resource. `Network` and `Fault` are
/// retryable; everything else is not.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("remote object no longer exists")]
    Gone,

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("server fault ({status})")]
    Fault { status: u16 },

    #[error("failed to decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Fault { .. })
    }

    fn from_status(status: u16, body: String) -> Self {
        match status {
            404 | 410 => RemoteError::Gone,
            400..=499 => RemoteError::Rejected {
                status,
                message: body,
            },
            _ => RemoteError::Fault { status },
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        // Timeouts follow the retryable path, same as a dead link.
        RemoteError::Network(e.to_string())
    }
}

/// Wire shape of a reminder on the remote resource. `client_ref` mirrors the
/// local id so a replayed create can be matched instead of duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteReminder {
    pub id: String,
    #[serde(default)]
    pub client_ref: Option<String>,
    #[serde(flatten)]
    pub fields: ReminderFields,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Request body for create/update. No identifiers beyond the client ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderPayload {
    #[serde(default)]
    pub client_ref: Option<String>,
    #[serde(flatten)]
    pub fields: ReminderFields,
}

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_token: String,
    pub owner: String,
}

impl RemoteConfig {
    pub fn new_from_env() -> Result<Self, AppError> {
        let base_url = env::var("REMOTE_URL")
            .map_err(|_| AppError::BadRequest("REMOTE_URL is not set".to_string()))?;
        let api_token = env::var("REMOTE_TOKEN")
            .map_err(|_| AppError::BadRequest("REMOTE_TOKEN is not set".to_string()))?;
        let owner = env::var("REMOTE_OWNER")
            .map_err(|_| AppError::BadRequest("REMOTE_OWNER is not set".to_string()))?;

        Ok(Self {
            base_url,
            api_token,
            owner,
        })
    }
}

/// The four verbs the remote resource exposes, plus the list used by the
/// post-drain reconciling fetch.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create_reminder(&self, payload: &ReminderPayload) -> Result<RemoteReminder, RemoteError>;
    async fn update_reminder(
        &self,
        server_id: &str,
        payload: &ReminderPayload,
    ) -> Result<RemoteReminder, RemoteError>;
    async fn delete_reminder(&self, server_id: &str) -> Result<(), RemoteError>;
    async fn list_reminders(&self) -> Result<Vec<RemoteReminder>, RemoteError>;
}

pub struct HttpRemote {
    client: Client,
    config: RemoteConfig,
}

impl HttpRemote {
    pub fn new(config: RemoteConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::BadRequest(format!("Failed to build http client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(RemoteError::from_status(status, body));
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create_reminder(&self, payload: &ReminderPayload) -> Result<RemoteReminder, RemoteError> {
        let response = self
            .client
            .post(self.url("reminders"))
            .bearer_auth(&self.config.api_token)
            .json(payload)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn update_reminder(
        &self,
        server_id: &str,
        payload: &ReminderPayload,
    ) -> Result<RemoteReminder, RemoteError> {
        let response = self
            .client
            .put(self.url(&format!("reminders/{}", server_id)))
            .bearer_auth(&self.config.api_token)
            .json(payload)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn delete_reminder(&self, server_id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.url(&format!("reminders/{}", server_id)))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status, body))
    }

    async fn list_reminders(&self) -> Result<Vec<RemoteReminder>, RemoteError> {
        let response = self
            .client
            .get(self.url("reminders"))
            .query(&[("owner", self.config.owner.as_str())])
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        Self::decode(response).await
    }
}

/// Stateful in-process stand-in for the remote resource. Used when no remote
/// is configured and by the test suite, so convergence is observable without a
/// server.
#[derive(Default)]
pub struct InMemoryRemote {
    objects: Mutex<HashMap<String, RemoteReminder>>,
    next_id: AtomicU64,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<RemoteReminder> {
        let objects = self.objects.lock().expect("remote poisoned");
        let mut all: Vec<RemoteReminder> = objects.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn seed(&self, reminder: RemoteReminder) {
        let mut objects = self.objects.lock().expect("remote poisoned");
        objects.insert(reminder.id.clone(), reminder);
    }

    pub fn remove(&self, server_id: &str) -> bool {
        let mut objects = self.objects.lock().expect("remote poisoned");
        objects.remove(server_id).is_some()
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn create_reminder(&self, payload: &ReminderPayload) -> Result<RemoteReminder, RemoteError> {
        let mut objects = self.objects.lock().expect("remote poisoned");

        // A replayed create with a known client ref resolves to the existing
        // object instead of minting a duplicate.
        if let Some(client_ref) = &payload.client_ref {
            if let Some(existing) = objects
                .values()
                .find(|o| o.client_ref.as_deref() == Some(client_ref.as_str()))
            {
                return Ok(existing.clone());
            }
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let reminder = RemoteReminder {
            id: format!("s{}", n),
            client_ref: payload.client_ref.clone(),
            fields: payload.fields.clone(),
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        objects.insert(reminder.id.clone(), reminder.clone());
        Ok(reminder)
    }

    async fn update_reminder(
        &self,
        server_id: &str,
        payload: &ReminderPayload,
    ) -> Result<RemoteReminder, RemoteError> {
        let mut objects = self.objects.lock().expect("remote poisoned");
        let existing = objects.get_mut(server_id).ok_or(RemoteError::Gone)?;
        existing.fields = payload.fields.clone();
        existing.updated_at = Some(chrono::Utc::now().to_rfc3339());
        Ok(existing.clone())
    }

    async fn delete_reminder(&self, server_id: &str) -> Result<(), RemoteError> {
        let mut objects = self.objects.lock().expect("remote poisoned");
        match objects.remove(server_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::Gone),
        }
    }

    async fn list_reminders(&self) -> Result<Vec<RemoteReminder>, RemoteError> {
        Ok(self.snapshot())
    }
}
