//! External data store.
//!
//! Profiles, per-stage music settings, music tracks and stress entries live in
//! a hosted row store with a PostgREST interface. `RestDataStore` talks to it;
//! `InMemoryStore` is the local stand-in used by tests and offline runs.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::config::ServiceConfig;
use crate::error::StoreError;
use crate::types::{MusicSetting, MusicTrack, StressEntry, StressLevel};

/// Read/write access to the rows the session engine needs.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// First name of the user, if the profile has one.
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    /// All music settings for a stress level.
    async fn music_settings(&self, level: StressLevel) -> Result<Vec<MusicSetting>, StoreError>;

    /// Music setting for one `(stage_key, level)` pair.
    async fn music_setting(
        &self,
        stage_key: &str,
        level: StressLevel,
    ) -> Result<Option<MusicSetting>, StoreError> {
        Ok(self
            .music_settings(level)
            .await?
            .into_iter()
            .find(|s| s.stage_key == stage_key))
    }

    async fn music_track(&self, id: &str) -> Result<Option<MusicTrack>, StoreError>;

    async fn insert_stress_entry(&self, entry: &StressEntry) -> Result<(), StoreError>;

    /// Most recent entries first.
    async fn stress_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StressEntry>, StoreError>;
}

/// PostgREST client for the hosted store.
#[derive(Debug, Clone)]
pub struct RestDataStore {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    first_name: Option<String>,
}

impl RestDataStore {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StoreError::Request {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            access_token: config.access_token.clone(),
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        builder.header("apikey", &self.anon_key).bearer_auth(bearer)
    }

    fn require_token(&self) -> Result<(), StoreError> {
        match self.access_token {
            Some(_) => Ok(()),
            None => Err(StoreError::Unauthenticated),
        }
    }

    async fn select<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let url = self.table_url(table);
        debug!(table, "Store select");
        let response = self
            .authorized(self.client.get(&url).query(query))
            .send()
            .await
            .map_err(|e| StoreError::Request {
                message: e.to_string(),
            })?;
        let response = check_status(response).await?;
        response.json().await.map_err(|e| StoreError::Decode {
            message: format!("{table}: {e}"),
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message")?.as_str().map(str::to_string))
        .unwrap_or(body);
    if status.as_u16() == 401 {
        return Err(StoreError::Unauthenticated);
    }
    Err(StoreError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl DataStore for RestDataStore {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let rows: Vec<ProfileRow> = self
            .select(
                "profiles",
                &[
                    ("id", format!("eq.{user_id}")),
                    ("select", "first_name".to_string()),
                ],
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|r| r.first_name)
            .filter(|n| !n.trim().is_empty()))
    }

    async fn music_settings(&self, level: StressLevel) -> Result<Vec<MusicSetting>, StoreError> {
        self.select(
            "exercise_music_settings",
            &[
                ("stress_level", format!("eq.{level}")),
                (
                    "select",
                    "phase,stress_level,music_id,volume,fade_in_duration,fade_out_duration"
                        .to_string(),
                ),
            ],
        )
        .await
    }

    async fn music_track(&self, id: &str) -> Result<Option<MusicTrack>, StoreError> {
        let rows: Vec<MusicTrack> = self
            .select(
                "background_music",
                &[
                    ("id", format!("eq.{id}")),
                    ("select", "id,name,file_url,duration,is_active".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_stress_entry(&self, entry: &StressEntry) -> Result<(), StoreError> {
        self.require_token()?;
        let body = serde_json::json!({
            "user_id": entry.user_id,
            "stress_score": entry.stress_score,
            "notes": entry.notes,
        });
        let response = self
            .authorized(self.client.post(self.table_url("stress_entries")))
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Request {
                message: e.to_string(),
            })?;
        check_status(response).await?;
        Ok(())
    }

    async fn stress_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StressEntry>, StoreError> {
        self.require_token()?;
        self.select(
            "stress_entries",
            &[
                ("user_id", format!("eq.{user_id}")),
                ("select", "user_id,stress_score,notes,created_at".to_string()),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }
}

#[derive(Debug, Default)]
struct MemoryRows {
    profiles: HashMap<String, String>,
    settings: Vec<MusicSetting>,
    tracks: HashMap<String, MusicTrack>,
    entries: Vec<StressEntry>,
    failure: Option<StoreError>,
}

/// Row store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<MemoryRows>,
    inserts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, user_id: impl Into<String>, first_name: impl Into<String>) -> Self {
        self.lock().profiles.insert(user_id.into(), first_name.into());
        self
    }

    pub fn with_music_setting(self, setting: MusicSetting) -> Self {
        self.lock().settings.push(setting);
        self
    }

    pub fn with_track(self, track: MusicTrack) -> Self {
        self.lock().tracks.insert(track.id.clone(), track);
        self
    }

    /// Make every subsequent call fail with `error` (`None` restores).
    pub fn set_failure(&self, error: Option<StoreError>) {
        self.lock().failure = error;
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<StressEntry> {
        self.lock().entries.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRows> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<std::sync::MutexGuard<'_, MemoryRows>, StoreError> {
        let rows = self.lock();
        if let Some(err) = rows.failure.clone() {
            return Err(err);
        }
        Ok(rows)
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.check()?.profiles.get(user_id).cloned())
    }

    async fn music_settings(&self, level: StressLevel) -> Result<Vec<MusicSetting>, StoreError> {
        Ok(self
            .check()?
            .settings
            .iter()
            .filter(|s| s.stress_level == level.get())
            .cloned()
            .collect())
    }

    async fn music_track(&self, id: &str) -> Result<Option<MusicTrack>, StoreError> {
        Ok(self.check()?.tracks.get(id).cloned())
    }

    async fn insert_stress_entry(&self, entry: &StressEntry) -> Result<(), StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.check()?.entries.push(entry.clone());
        Ok(())
    }

    async fn stress_entries(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StressEntry>, StoreError> {
        let rows = self.check()?;
        let mut entries: Vec<StressEntry> = rows
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }
}
