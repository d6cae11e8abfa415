//! Persistent job store (`<state>/cron/jobs.json`) and per-job run
//! history (`<state>/cron/runs/<id>.jsonl`).

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use clawdbot_schema::persist::{load_json_or_default, save_json_atomic};
use clawdbot_schema::RunStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::CronJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsFile {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}

impl Default for JobsFile {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}

pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(cron_dir: &Path) -> Self {
        Self {
            path: cron_dir.join("jobs.json"),
        }
    }

    pub fn load(&self) -> Vec<CronJob> {
        let file: JobsFile = load_json_or_default(&self.path);
        if file.version != 1 {
            tracing::warn!("unknown jobs file version {}; starting empty", file.version);
            return Vec::new();
        }
        file.jobs
    }

    pub fn save(&self, jobs: Vec<CronJob>) -> Result<()> {
        save_json_atomic(&self.path, &JobsFile { version: 1, jobs })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(cron_dir: &Path) -> Self {
        Self {
            dir: cron_dir.join("runs"),
        }
    }

    pub fn append(&self, record: &RunRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.jsonl", record.job_id));
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn recent(&self, job_id: Uuid, limit: usize) -> Result<Vec<RunRecord>> {
        let path = self.dir.join(format!("{job_id}.jsonl"));
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .rev()
            .take(limit)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
