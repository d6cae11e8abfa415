//! Cron job model and input normalization.
//!
//! External input arrives loosely shaped (`kind` optional on schedule and
//! payload); normalization infers kinds from the fields present and
//! applies creation defaults. Normalizing already-normal input is a
//! no-op.

use anyhow::{anyhow, Result};
use chrono::Utc;
use clawdbot_schema::{CronPayload, RunStatus, SessionTarget, WakeMode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    #[serde(rename_all = "camelCase")]
    At { at_ms: i64 },
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Isolation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_to_main_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobState {
    pub next_run_at_ms: Option<i64>,
    pub running_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    pub wake_mode: WakeMode,
    pub payload: CronPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
    #[serde(default)]
    pub state: JobState,
}

/// Loose schedule input; `kind` is inferred from the populated fields
/// when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawSchedule {
    pub kind: Option<String>,
    pub at_ms: Option<i64>,
    pub every_ms: Option<i64>,
    pub anchor_ms: Option<i64>,
    pub expr: Option<String>,
    pub tz: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawPayload {
    pub kind: Option<String>,
    pub text: Option<String>,
    pub message: Option<String>,
    pub thinking: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub deliver: Option<bool>,
    pub provider: Option<String>,
    pub to: Option<String>,
    pub best_effort_deliver: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobInput {
    pub name: String,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: RawSchedule,
    pub session_target: Option<SessionTarget>,
    pub wake_mode: Option<WakeMode>,
    pub payload: RawPayload,
    pub isolation: Option<Isolation>,
}

/// Patch for `update`; absent fields keep their current values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: Option<RawSchedule>,
    pub session_target: Option<SessionTarget>,
    pub wake_mode: Option<WakeMode>,
    pub payload: Option<RawPayload>,
    pub isolation: Option<Isolation>,
}

pub fn normalize_schedule(raw: &RawSchedule) -> Result<Schedule> {
    let kind = match raw.kind.as_deref() {
        Some(kind) => kind.to_string(),
        None => {
            if raw.at_ms.is_some() {
                "at".into()
            } else if raw.every_ms.is_some() {
                "every".into()
            } else if raw.expr.is_some() {
                "cron".into()
            } else {
                return Err(anyhow!("schedule needs one of atMs, everyMs, expr"));
            }
        }
    };

    match kind.as_str() {
        "at" => Ok(Schedule::At {
            at_ms: raw.at_ms.ok_or_else(|| anyhow!("at schedule needs atMs"))?,
        }),
        "every" => {
            let every_ms = raw
                .every_ms
                .ok_or_else(|| anyhow!("every schedule needs everyMs"))?;
            if every_ms <= 0 {
                return Err(anyhow!("everyMs must be positive"));
            }
            Ok(Schedule::Every {
                every_ms,
                anchor_ms: raw.anchor_ms,
            })
        }
        "cron" => Ok(Schedule::Cron {
            expr: raw
                .expr
                .clone()
                .ok_or_else(|| anyhow!("cron schedule needs expr"))?,
            tz: raw.tz.clone(),
        }),
        other => Err(anyhow!("unknown schedule kind: {other}")),
    }
}

pub fn normalize_payload(raw: &RawPayload) -> Result<CronPayload> {
    let kind = match raw.kind.as_deref() {
        Some(kind) => kind.to_string(),
        None => {
            if raw.text.is_some() {
                "systemEvent".into()
            } else if raw.message.is_some() {
                "agentTurn".into()
            } else {
                return Err(anyhow!("payload needs text or message"));
            }
        }
    };

    match kind.as_str() {
        "systemEvent" => Ok(CronPayload::SystemEvent {
            text: raw
                .text
                .clone()
                .ok_or_else(|| anyhow!("systemEvent payload needs text"))?,
        }),
        "agentTurn" => Ok(CronPayload::AgentTurn {
            message: raw
                .message
                .clone()
                .ok_or_else(|| anyhow!("agentTurn payload needs message"))?,
            thinking: raw.thinking.clone(),
            timeout_seconds: raw.timeout_seconds,
            deliver: raw.deliver,
            provider: raw.provider.clone(),
            to: raw.to.clone(),
            best_effort_deliver: raw.best_effort_deliver,
        }),
        other => Err(anyhow!("unknown payload kind: {other}")),
    }
}

/// Build a normalized job from loose input, applying creation defaults:
/// `wakeMode=next-heartbeat`; `sessionTarget=main` for system events,
/// `isolated` for agent turns.
pub fn normalize_job(input: &JobInput) -> Result<CronJob> {
    if input.name.trim().is_empty() {
        return Err(anyhow!("job needs a name"));
    }
    let schedule = normalize_schedule(&input.schedule)?;
    let payload = normalize_payload(&input.payload)?;

    let session_target = input.session_target.unwrap_or(match payload {
        CronPayload::SystemEvent { .. } => SessionTarget::Main,
        CronPayload::AgentTurn { .. } => SessionTarget::Isolated,
    });
    let now = Utc::now().timestamp_millis();

    Ok(CronJob {
        id: Uuid::new_v4(),
        name: input.name.clone(),
        description: input.description.clone(),
        enabled: input.enabled.unwrap_or(true),
        created_at_ms: now,
        updated_at_ms: now,
        schedule,
        session_target,
        wake_mode: input.wake_mode.unwrap_or(WakeMode::NextHeartbeat),
        payload,
        isolation: input.isolation.clone(),
        state: JobState::default(),
    })
}

impl From<&CronJob> for JobInput {
    fn from(job: &CronJob) -> Self {
        let schedule = match &job.schedule {
            Schedule::At { at_ms } => RawSchedule {
                kind: Some("at".into()),
                at_ms: Some(*at_ms),
                ..Default::default()
            },
            Schedule::Every { every_ms, anchor_ms } => RawSchedule {
                kind: Some("every".into()),
                every_ms: Some(*every_ms),
                anchor_ms: *anchor_ms,
                ..Default::default()
            },
            Schedule::Cron { expr, tz } => RawSchedule {
                kind: Some("cron".into()),
                expr: Some(expr.clone()),
                tz: tz.clone(),
                ..Default::default()
            },
        };
        let payload = match &job.payload {
            CronPayload::SystemEvent { text } => RawPayload {
                kind: Some("systemEvent".into()),
                text: Some(text.clone()),
                ..Default::default()
            },
            CronPayload::AgentTurn {
                message,
                thinking,
                timeout_seconds,
                deliver,
                provider,
                to,
                best_effort_deliver,
            } => RawPayload {
                kind: Some("agentTurn".into()),
                message: Some(message.clone()),
                thinking: thinking.clone(),
                timeout_seconds: *timeout_seconds,
                deliver: *deliver,
                provider: provider.clone(),
                to: to.clone(),
                best_effort_deliver: *best_effort_deliver,
                ..Default::default()
            },
        };
        Self {
            name: job.name.clone(),
            description: job.description.clone(),
            enabled: Some(job.enabled),
            schedule,
            session_target: Some(job.session_target),
            wake_mode: Some(job.wake_mode),
            payload,
            isolation: job.isolation.clone(),
        }
    }
}
