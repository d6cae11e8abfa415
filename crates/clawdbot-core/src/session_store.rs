//! Session metadata store.
//!
//! One JSON file (`sessions.json`) maps session keys to session records.
//! All mutation goes through the store's lock so concurrent callers
//! observe the same session id; persistence uses the shared atomic-rename
//! discipline. Readers tolerate staleness.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use clawdbot_provider::Usage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastModel {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model: Option<LastModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Session {
    fn fresh() -> Self {
        Self {
            id: Uuid::new_v4(),
            updated_at: Utc::now().timestamp_millis(),
            thinking_level: None,
            verbose_level: None,
            model_override: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            last_model: None,
            context_tokens: None,
            compaction_count: None,
            display_name: None,
        }
    }
}

/// Field-wise patch; token counters are additive, everything else replaces.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub thinking_level: Option<String>,
    pub verbose_level: Option<String>,
    pub model_override: Option<Option<String>>,
    pub add_usage: Option<Usage>,
    pub last_model: Option<LastModel>,
    pub context_tokens: Option<u64>,
    pub compaction_count: Option<u32>,
    pub display_name: Option<String>,
}

pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Open the store backed by `<dir>/sessions.json`. A missing or
    /// unparsable file starts empty.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join("sessions.json");
        let map = clawdbot_schema::persist::load_json_or_default(&path);
        Self {
            path,
            inner: Mutex::new(map),
        }
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.inner.lock().expect("session store").get(key).cloned()
    }

    /// Fetch or create the session for a key. Creation persists
    /// immediately so a racing reader sees the same id.
    pub fn get_or_create(&self, key: &str) -> Result<Session> {
        let mut map = self.inner.lock().expect("session store");
        if let Some(session) = map.get(key) {
            return Ok(session.clone());
        }
        let session = Session::fresh();
        map.insert(key.to_string(), session.clone());
        self.persist_locked(&map)?;
        Ok(session)
    }

    pub fn update(&self, key: &str, patch: SessionPatch) -> Result<Session> {
        let mut map = self.inner.lock().expect("session store");
        let session = map.entry(key.to_string()).or_insert_with(Session::fresh);

        if let Some(level) = patch.thinking_level {
            session.thinking_level = Some(level);
        }
        if let Some(level) = patch.verbose_level {
            session.verbose_level = Some(level);
        }
        if let Some(model_override) = patch.model_override {
            session.model_override = model_override;
        }
        if let Some(usage) = patch.add_usage {
            session.input_tokens += usage.input_tokens;
            session.output_tokens += usage.output_tokens;
            session.total_tokens += usage.total();
        }
        if let Some(last_model) = patch.last_model {
            session.last_model = Some(last_model);
        }
        if let Some(tokens) = patch.context_tokens {
            session.context_tokens = Some(tokens);
        }
        if let Some(count) = patch.compaction_count {
            session.compaction_count = Some(count);
        }
        if let Some(name) = patch.display_name {
            session.display_name = Some(name);
        }
        session.updated_at = Utc::now().timestamp_millis();

        let updated = session.clone();
        self.persist_locked(&map)?;
        Ok(updated)
    }

    /// Allocate a new id and zero the counters for a key.
    pub fn reset(&self, key: &str) -> Result<Session> {
        let mut map = self.inner.lock().expect("session store");
        let session = Session::fresh();
        map.insert(key.to_string(), session.clone());
        self.persist_locked(&map)?;
        Ok(session)
    }

    pub fn list(&self) -> Vec<(String, Session)> {
        let map = self.inner.lock().expect("session store");
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn persist_locked(&self, map: &HashMap<String, Session>) -> Result<()> {
        if let Err(err) = clawdbot_schema::persist::save_json_atomic(&self.path, map) {
            // Keep in-memory state authoritative; the next mutation retries.
            tracing::warn!("session store persist failed: {err:#}");
        }
        Ok(())
    }
}
