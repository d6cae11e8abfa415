//! Timer-driven heartbeat turns.
//!
//! Every interval the driver runs the agent with the heartbeat prompt on
//! the main session. A response that is just the heartbeat token (plus a
//! short ack) is suppressed; anything substantial is delivered through
//! the reply dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clawdbot_schema::{ReplyKind, ReplyPayload, HEARTBEAT_TOKEN};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatSection;
use crate::dispatcher::ReplyDispatcher;
use crate::runner::{AgentRunner, RunParams};

pub const DEFAULT_HEARTBEAT_PROMPT: &str =
    "Read HEARTBEAT.md if it exists and follow it. If nothing needs attention, \
     reply with [HEARTBEAT_OK].";

/// Parse `"30m"`, `"1h"`, `"60s"` into a duration.
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return Err(anyhow!("invalid heartbeat interval: {raw}"));
    }
    let (num, unit) = raw.split_at(raw.len() - 1);
    let num: u64 = num
        .parse()
        .map_err(|_| anyhow!("invalid heartbeat interval: {raw}"))?;
    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        _ => return Err(anyhow!("invalid heartbeat interval unit: {raw}")),
    };
    Ok(Duration::from_secs(secs))
}

/// True when the response is nothing but the heartbeat token plus at most
/// `ack_max_chars` of surrounding text.
pub fn is_heartbeat_ack(response: &str, ack_max_chars: usize) -> bool {
    let trimmed = response.trim();
    let Some(idx) = trimmed.find(HEARTBEAT_TOKEN) else {
        return false;
    };
    let surrounding =
        trimmed[..idx].trim().len() + trimmed[idx + HEARTBEAT_TOKEN.len()..].trim().len();
    surrounding <= ack_max_chars
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Ran; Some(response) when it was delivered, None when suppressed.
    Ran(Option<String>),
    /// A heartbeat was already in flight.
    Skipped,
}

pub struct HeartbeatDriver {
    runner: Arc<AgentRunner>,
    dispatcher: ReplyDispatcher,
    interval: Duration,
    prompt: String,
    ack_max_chars: usize,
    gate: Mutex<()>,
    cancel: CancellationToken,
}

impl HeartbeatDriver {
    pub fn new(
        runner: Arc<AgentRunner>,
        dispatcher: ReplyDispatcher,
        section: &HeartbeatSection,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            runner,
            dispatcher,
            interval: parse_interval(&section.interval)?,
            prompt: section
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_HEARTBEAT_PROMPT.to_string()),
            ack_max_chars: section.ack_max_chars,
            gate: Mutex::new(()),
            cancel,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the periodic loop until the cancellation token fires.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick is not a heartbeat
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.trigger_now().await {
                Ok(HeartbeatOutcome::Skipped) => {
                    tracing::debug!("heartbeat tick skipped; previous still running")
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("heartbeat run failed: {err:#}"),
            }
        }
    }

    /// Run one heartbeat immediately. Re-entrant calls are skipped while
    /// one is in flight.
    pub async fn trigger_now(&self) -> Result<HeartbeatOutcome> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Ok(HeartbeatOutcome::Skipped);
        };

        let mut params = RunParams::message(self.prompt.clone());
        params.extract_directives = false;
        params.cancel = self.cancel.child_token();
        let outcome = self.runner.run(params).await?;

        if is_heartbeat_ack(&outcome.response, self.ack_max_chars) {
            tracing::debug!("heartbeat ack suppressed");
            return Ok(HeartbeatOutcome::Ran(None));
        }

        self.dispatcher
            .enqueue(ReplyKind::Final, ReplyPayload::text(outcome.response.clone()));
        Ok(HeartbeatOutcome::Ran(Some(outcome.response)))
    }
}
