pub mod persist;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reply consisting solely of this token (optionally followed by `--` and
/// private narration) is dropped before delivery.
pub const SILENT_REPLY_TOKEN: &str = "[silent]";

/// Token an agent emits to acknowledge a heartbeat with nothing to report.
pub const HEARTBEAT_TOKEN: &str = "[HEARTBEAT_OK]";

/// Canonical identity of a conversation: `agent:<agentId>:<scopeKey>`.
///
/// The scope key is either the literal `main`, `global`, or
/// `<provider>:<peer>`. Session single-flight is keyed on this string.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    pub fn global(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:global"))
    }

    pub fn for_peer(agent_id: &str, provider: &str, peer: &str) -> Self {
        Self(format!("agent:{agent_id}:{provider}:{peer}"))
    }

    pub fn is_main(&self) -> bool {
        self.0.ends_with(":main")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message admitted from a chat surface before any processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Surface the message arrived on (`whatsapp`, `telegram`, `bridge`, ...).
    pub provider: String,
    /// Originating principal on that surface.
    pub peer: String,
    /// Provider-assigned message id; absent ids bypass dedup.
    #[serde(default)]
    pub message_id: Option<String>,
    pub text: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub media_url: Option<String>,
}

/// Kind of an outbound reply; ordering is preserved across all kinds
/// within one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Tool,
    Block,
    Final,
}

/// Payload handed to a reply dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: String,
    #[serde(default)]
    pub media_url: Option<String>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media_url: None,
        }
    }
}

/// Which session a scheduled job runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTarget {
    Main,
    Isolated,
}

/// How a scheduled firing wakes the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    Now,
    NextHeartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

/// Payload a cron job delivers when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronPayload {
    #[serde(rename_all = "camelCase")]
    SystemEvent { text: String },
    #[serde(rename_all = "camelCase")]
    AgentTurn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deliver: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        best_effort_deliver: Option<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobChange {
    Added,
    Updated,
    Removed,
}

/// Messages flowing over the gateway event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    CronTriggered {
        job_id: Uuid,
        job_name: String,
        session_target: SessionTarget,
        wake_mode: WakeMode,
        payload: CronPayload,
        isolation_prefix: Option<String>,
        triggered_at_ms: i64,
    },
    CronCompleted {
        job_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        started_at_ms: i64,
        ended_at_ms: i64,
        response: Option<String>,
    },
    CronJobsChanged {
        change: JobChange,
        job_id: Uuid,
    },
    WakeRequested {
        mode: WakeMode,
        text: Option<String>,
        reason: Option<String>,
    },
    SystemEvent {
        session_key: SessionKey,
        text: String,
    },
}

impl BusMessage {
    pub fn topic(&self) -> Topic {
        match self {
            Self::CronTriggered { .. } => Topic::CronTriggered,
            Self::CronCompleted { .. } => Topic::CronCompleted,
            Self::CronJobsChanged { .. } => Topic::CronJobsChanged,
            Self::WakeRequested { .. } => Topic::WakeRequested,
            Self::SystemEvent { .. } => Topic::SystemEvent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    CronTriggered,
    CronCompleted,
    CronJobsChanged,
    WakeRequested,
    SystemEvent,
}
