//! Pairing: how an external principal becomes authorized to command the
//! agent.
//!
//! Pending codes and the per-provider allow-list live in one JSON file
//! (`pairing.json`) persisted with the shared atomic-rename discipline.
//! Bridge bearer tokens (`bridge-token/<nodeId>`) share the same store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CODE_TTL_MS: i64 = 10 * 60 * 1000;
const CODE_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    pub provider: String,
    pub principal: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PairingFile {
    pending: Vec<PairingCode>,
    /// provider -> approved principals.
    allow: BTreeMap<String, BTreeSet<String>>,
    /// Opaque secrets, e.g. `bridge-token/<nodeId>` -> bearer.
    tokens: BTreeMap<String, String>,
}

pub struct PairingStore {
    path: PathBuf,
    inner: Mutex<PairingFile>,
    code_ttl_ms: i64,
}

impl PairingStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = clawdbot_schema::persist::load_json_or_default(&path);
        Self {
            path,
            inner: Mutex::new(inner),
            code_ttl_ms: DEFAULT_CODE_TTL_MS,
        }
    }

    pub fn with_code_ttl(mut self, ttl_ms: i64) -> Self {
        self.code_ttl_ms = ttl_ms;
        self
    }

    /// Issue (or re-surface) a pairing code for a principal. An unexpired
    /// pending code for the same (provider, principal) is returned as-is;
    /// codes stay globally unique until they expire.
    pub fn issue_code(&self, provider: &str, principal: &str) -> Result<String> {
        self.issue_code_at(provider, principal, Utc::now().timestamp_millis())
    }

    pub fn issue_code_at(&self, provider: &str, principal: &str, now_ms: i64) -> Result<String> {
        let mut inner = self.inner.lock().expect("pairing store");
        inner.pending.retain(|p| p.expires_at_ms > now_ms);

        if let Some(existing) = inner
            .pending
            .iter()
            .find(|p| p.provider == provider && p.principal == principal)
        {
            return Ok(existing.code.clone());
        }

        let code = loop {
            let candidate = base36(rand::thread_rng().gen::<u32>(), CODE_LEN);
            if !inner.pending.iter().any(|p| p.code == candidate) {
                break candidate;
            }
        };

        inner.pending.push(PairingCode {
            code: code.clone(),
            provider: provider.to_string(),
            principal: principal.to_string(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms + self.code_ttl_ms,
            approved_by: None,
        });
        self.persist_locked(&inner);
        Ok(code)
    }

    /// Approve a pending code: the principal moves to the allow-list and
    /// the pending entry is removed. Returns the approved principal.
    pub fn approve(&self, provider: &str, code: &str, approved_by: &str) -> Result<String> {
        self.approve_at(provider, code, approved_by, Utc::now().timestamp_millis())
    }

    pub fn approve_at(
        &self,
        provider: &str,
        code: &str,
        approved_by: &str,
        now_ms: i64,
    ) -> Result<String> {
        let mut inner = self.inner.lock().expect("pairing store");
        inner.pending.retain(|p| p.expires_at_ms > now_ms);

        let idx = inner
            .pending
            .iter()
            .position(|p| p.provider == provider && p.code == code)
            .ok_or_else(|| anyhow!("no pending pairing code {code} for {provider}"))?;
        let mut entry = inner.pending.remove(idx);
        entry.approved_by = Some(approved_by.to_string());

        inner
            .allow
            .entry(provider.to_string())
            .or_default()
            .insert(entry.principal.clone());
        self.persist_locked(&inner);
        tracing::info!(provider, principal = %entry.principal, "pairing approved");
        Ok(entry.principal)
    }

    pub fn is_allowed(&self, provider: &str, principal: &str) -> bool {
        let inner = self.inner.lock().expect("pairing store");
        inner
            .allow
            .get(provider)
            .is_some_and(|set| set.contains(principal))
    }

    pub fn revoke(&self, provider: &str, principal: &str) -> bool {
        let mut inner = self.inner.lock().expect("pairing store");
        let removed = inner
            .allow
            .get_mut(provider)
            .map(|set| set.remove(principal))
            .unwrap_or(false);
        if removed {
            self.persist_locked(&inner);
        }
        removed
    }

    pub fn allowed(&self, provider: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("pairing store");
        inner
            .allow
            .get(provider)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<PairingCode> {
        let now = Utc::now().timestamp_millis();
        let inner = self.inner.lock().expect("pairing store");
        inner
            .pending
            .iter()
            .filter(|p| p.expires_at_ms > now)
            .cloned()
            .collect()
    }

    pub fn set_token(&self, key: &str, token: &str) {
        let mut inner = self.inner.lock().expect("pairing store");
        inner.tokens.insert(key.to_string(), token.to_string());
        self.persist_locked(&inner);
    }

    pub fn check_token(&self, key: &str, token: &str) -> bool {
        let inner = self.inner.lock().expect("pairing store");
        inner.tokens.get(key).is_some_and(|t| t == token)
    }

    fn persist_locked(&self, inner: &PairingFile) {
        if let Err(err) = clawdbot_schema::persist::save_json_atomic(&self.path, inner) {
            tracing::warn!("pairing store persist failed: {err:#}");
        }
    }
}

fn base36(mut n: u32, width: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::with_capacity(width);
    for _ in 0..width {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits")
}

/// The exact reply an unauthorized sender receives.
pub fn pairing_reply(id_line: &str, provider: &str, code: &str) -> String {
    format!(
        "Clawdbot: access not configured.\n\n{id_line}\n\nPairing code: {code}\n\n\
         Ask the bot owner to approve with:\nclawdbot pairing approve {provider} {code}"
    )
}
