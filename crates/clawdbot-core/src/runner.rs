//! The agent runner: single-flight per session, context assembly, model
//! fallback chain, and streaming event delivery.
//!
//! One `run` call is one agent turn. Turns on the same session key are
//! serialized in admission order; a turn aborted by cancellation never
//! touches the session's token counters.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, Utc};
use clawdbot_provider::{
    is_cancellation, BackendRegistry, BackendRequest, BackendStream, Cancelled, Usage,
};
use clawdbot_schema::SessionKey;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AgentSection, Config, Runtime};
use crate::directive::{extract_directives, Directives, ThinkLevel};
use crate::env_guard::apply_env_overrides;
use crate::flight::FlightCoordinator;
use crate::session_store::{LastModel, SessionPatch, SessionStore};
use crate::skill::SkillRegistry;
use crate::workspace::AgentWorkspace;

/// Canonical tool listing order for the system prompt suffix.
const BUILTIN_TOOLS: [&str; 8] = [
    "read", "write", "edit", "grep", "find", "ls", "bash", "process",
];

#[derive(Debug, Clone)]
pub enum AgentEvent {
    TextChunk(String),
    ToolUse { name: String, args: serde_json::Value },
    ToolResult { name: String, result: String },
}

pub struct RunParams {
    pub message: String,
    pub session_key: Option<SessionKey>,
    pub thinking_override: Option<ThinkLevel>,
    /// Cancel the active turn on this session before queueing.
    pub abort_previous: bool,
    pub extract_directives: bool,
    pub load_memory: bool,
    pub events: Option<mpsc::Sender<AgentEvent>>,
    pub cancel: CancellationToken,
    /// Per-candidate model call timeout; None = unlimited.
    pub timeout: Option<Duration>,
}

impl RunParams {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            session_key: None,
            thinking_override: None,
            abort_previous: false,
            extract_directives: true,
            load_memory: true,
            events: None,
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub response: String,
    pub session_id: Uuid,
    pub session_key: SessionKey,
    pub usage: Option<Usage>,
    /// `provider/model` that produced the response.
    pub model: Option<String>,
    pub directives: Option<Directives>,
    /// Failed candidates tried before this response.
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub provider: String,
    pub model: String,
    pub error: String,
}

/// Raised when every candidate in the model chain failed; carries one
/// record per attempt so callers can report them individually.
#[derive(Debug, thiserror::Error)]
#[error("{summary}")]
pub struct ModelChainError {
    pub attempts: Vec<Attempt>,
    summary: String,
}

impl ModelChainError {
    fn new(attempts: Vec<Attempt>) -> Self {
        let tried = attempts
            .iter()
            .map(|a| format!("{}/{}: {}", a.provider, a.model, a.error))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            summary: format!("all model candidates failed ({tried})"),
            attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

pub struct AgentRunner {
    agent_id: String,
    runtime: Runtime,
    config: Config,
    backends: BackendRegistry,
    sessions: SessionStore,
    flights: FlightCoordinator,
    workspace: AgentWorkspace,
    /// Installation-provided skills; first in discovery order.
    bundled_skills_dir: Option<PathBuf>,
}

impl AgentRunner {
    pub fn new(
        agent_id: impl Into<String>,
        runtime: Runtime,
        config: Config,
        backends: BackendRegistry,
    ) -> Self {
        let agent_id = agent_id.into();
        let sessions = SessionStore::open(&runtime.sessions_dir(&agent_id));
        let workspace =
            AgentWorkspace::resolve(config.agent.workspace.as_deref(), runtime.profile());
        Self {
            agent_id,
            runtime,
            config,
            backends,
            sessions,
            flights: FlightCoordinator::new(),
            workspace,
            bundled_skills_dir: None,
        }
    }

    pub fn with_bundled_skills(mut self, dir: PathBuf) -> Self {
        self.bundled_skills_dir = Some(dir);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn workspace(&self) -> &AgentWorkspace {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn main_session_key(&self) -> SessionKey {
        let scope = self.config.session.main_key.as_deref().unwrap_or("main");
        SessionKey(format!("agent:{}:{}", self.agent_id, scope))
    }

    /// Cancel the turn currently running on a session, if any.
    pub fn abort_session(&self, key: &SessionKey) -> bool {
        self.flights.cancel_active(key.as_str())
    }

    pub fn session_busy(&self, key: &SessionKey) -> bool {
        self.flights.is_active(key.as_str())
    }

    pub async fn run(&self, params: RunParams) -> Result<RunOutcome> {
        let session_key = params
            .session_key
            .clone()
            .unwrap_or_else(|| self.main_session_key());

        if params.abort_previous {
            self.flights.cancel_active(session_key.as_str());
        }
        let _flight = self
            .flights
            .acquire(session_key.as_str(), params.cancel.clone())
            .await;

        let directives = if params.extract_directives {
            Some(extract_directives(&params.message))
        } else {
            None
        };
        let message = directives
            .as_ref()
            .map(|d| d.cleaned.clone())
            .unwrap_or_else(|| params.message.clone());

        self.workspace.ensure_bootstrap()?;
        let mut context_files = self.workspace.load_context_files();
        if params.load_memory {
            if let Some(memory) = self
                .workspace
                .load_daily_memory(Local::now().date_naive())
            {
                context_files.push(memory);
            }
        }

        let skills = SkillRegistry::discover(&self.skill_dirs());
        let skills_prompt = skills.summary_prompt(&self.config.skills);
        let env_overrides = skills.env_overrides(&self.config.skills);

        // Holds the process-wide env gate for the whole invocation window
        // and restores the prior environment on every exit path.
        let _env = apply_env_overrides(env_overrides).await;

        let session = self.sessions.get_or_create(session_key.as_str())?;
        if let Some(d) = &directives {
            if d.has_directives {
                self.sessions.update(
                    session_key.as_str(),
                    SessionPatch {
                        thinking_level: d.think_level.map(|l| l.as_str().to_string()),
                        verbose_level: d.verbose_level.map(|l| l.as_str().to_string()),
                        ..Default::default()
                    },
                )?;
            }
        }

        let thinking = params
            .thinking_override
            .map(|l| l.as_str().to_string())
            .or_else(|| directives.as_ref().and_then(|d| d.think_level.map(|l| l.as_str().to_string())))
            .or_else(|| session.thinking_level.clone())
            .or_else(|| self.config.agent.thinking.clone());

        let chain = resolve_model_chain(&self.config.agent, session.model_override.as_deref());
        if chain.is_empty() {
            anyhow::bail!("no resolvable model candidates");
        }

        let system_prompt = self.build_system_suffix(thinking.as_deref());
        self.append_transcript(session.id, "user", &message, None);

        let mut attempts: Vec<Attempt> = Vec::new();
        for candidate in &chain {
            let backend = match self.backends.get(&candidate.provider) {
                Ok(backend) => backend,
                Err(err) => {
                    attempts.push(Attempt {
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let request = BackendRequest {
                model: candidate.model.clone(),
                system_prompt: system_prompt.clone(),
                context_files: context_files.clone(),
                skills_prompt: skills_prompt.clone(),
                thinking: thinking.clone(),
                message: message.clone(),
            };

            match run_candidate(
                backend.stream(request, params.cancel.clone()),
                params.events.as_ref(),
                &params.cancel,
                params.timeout,
            )
            .await
            {
                Ok((response, usage)) => {
                    self.append_transcript(
                        session.id,
                        "assistant",
                        &response,
                        Some(&candidate.to_string()),
                    );
                    self.sessions.update(
                        session_key.as_str(),
                        SessionPatch {
                            add_usage: usage,
                            last_model: Some(LastModel {
                                provider: candidate.provider.clone(),
                                model: candidate.model.clone(),
                            }),
                            ..Default::default()
                        },
                    )?;
                    return Ok(RunOutcome {
                        response,
                        session_id: session.id,
                        session_key,
                        usage,
                        model: Some(candidate.to_string()),
                        directives,
                        attempts,
                    });
                }
                Err(err) if is_cancellation(&err) => {
                    tracing::debug!(session = %session_key, "agent turn cancelled");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        candidate = %candidate,
                        "model candidate failed: {err:#}"
                    );
                    attempts.push(Attempt {
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Err(anyhow::Error::new(ModelChainError::new(attempts)))
    }

    fn skill_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(bundled) = &self.bundled_skills_dir {
            dirs.push(bundled.clone());
        }
        for extra in &self.config.skills.dirs {
            dirs.push(PathBuf::from(extra));
        }
        dirs.push(self.runtime.managed_skills_dir());
        dirs.push(self.workspace.skills_dir());
        dirs
    }

    fn build_system_suffix(&self, thinking: Option<&str>) -> String {
        let filter = &self.config.agent.tools;
        let denied: Vec<&str> = filter.deny.iter().map(String::as_str).collect();

        let mut tools: Vec<&str> = BUILTIN_TOOLS
            .iter()
            .copied()
            .filter(|t| !denied.contains(t))
            .filter(|t| filter.allow.is_empty() || filter.allow.iter().any(|a| a == t))
            .collect();
        let mut extras: Vec<&str> = filter
            .allow
            .iter()
            .map(String::as_str)
            .filter(|t| !BUILTIN_TOOLS.contains(t) && !denied.contains(t))
            .collect();
        extras.sort_unstable();
        tools.extend(extras);

        let tz = iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());

        let mut lines = vec![format!("Available tools: {}", tools.join(", "))];
        if !denied.is_empty() {
            lines.push(format!("Do not call: {}", denied.join(", ")));
        }
        lines.push(format!("Workspace: {}", self.workspace.root().display()));
        lines.push(format!(
            "Time zone: {tz}; local time: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        lines.push(format!(
            "Host: {host} ({}/{}), runtime clawdbot {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            env!("CARGO_PKG_VERSION"),
        ));
        lines.push(format!(
            "Default thinking level: {}",
            thinking.unwrap_or("off")
        ));
        lines.join("\n")
    }

    /// Best-effort append to the session transcript; failures are logged,
    /// never fatal to the turn.
    fn append_transcript(&self, session_id: Uuid, role: &str, text: &str, model: Option<&str>) {
        #[derive(Serialize)]
        struct Line<'a> {
            role: &'a str,
            text: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            model: Option<&'a str>,
            at: i64,
        }

        let dir = self.runtime.sessions_dir(&self.agent_id);
        let path = dir.join(format!("{session_id}.jsonl"));
        let result: Result<()> = (|| {
            std::fs::create_dir_all(&dir)?;
            let line = serde_json::to_string(&Line {
                role,
                text,
                model,
                at: Utc::now().timestamp_millis(),
            })?;
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            writeln!(file, "{line}")?;
            Ok(())
        })();
        if let Err(err) = result {
            tracing::warn!("transcript append failed: {err:#}");
        }
    }
}

/// Primary (or session override) plus fallbacks, alias-resolved and
/// deduplicated. When the alias map is non-empty it doubles as the
/// fallback allow-list; the primary is exempt.
pub fn resolve_model_chain(agent: &AgentSection, session_override: Option<&str>) -> Vec<ModelRef> {
    let primary = session_override
        .map(str::to_string)
        .unwrap_or_else(|| agent.model.primary());

    let mut raws = vec![primary];
    for fallback in &agent.model.fallbacks {
        if !agent.models.is_empty() && !agent.models.contains_key(fallback) {
            tracing::warn!("fallback {fallback} not in agent.models allow-list; dropped");
            continue;
        }
        raws.push(fallback.clone());
    }

    let mut seen = std::collections::HashSet::new();
    let mut chain = Vec::new();
    for raw in raws {
        let resolved = if raw.contains('/') {
            raw.clone()
        } else {
            match agent.models.get(&raw).and_then(|e| e.alias.clone()) {
                Some(alias) => alias,
                None => {
                    tracing::warn!("unknown model alias: {raw}");
                    continue;
                }
            }
        };
        let Some((provider, model)) = resolved.split_once('/') else {
            tracing::warn!("invalid model format: {resolved}");
            continue;
        };
        if seen.insert(resolved.clone()) {
            chain.push(ModelRef {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }
    }
    chain
}

async fn run_candidate(
    stream_fut: impl std::future::Future<Output = Result<BackendStream>>,
    events: Option<&mpsc::Sender<AgentEvent>>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(String, Option<Usage>)> {
    let turn = async {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow::Error::new(Cancelled)),
            stream = stream_fut => stream?,
        };
        consume_stream(stream, events, cancel).await
    };

    match timeout {
        Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, turn)
            .await
            .map_err(|_| anyhow!("model call timed out after {}s", limit.as_secs()))?,
        _ => turn.await,
    }
}

async fn consume_stream(
    mut stream: BackendStream,
    events: Option<&mpsc::Sender<AgentEvent>>,
    cancel: &CancellationToken,
) -> Result<(String, Option<Usage>)> {
    use clawdbot_provider::BackendEvent;

    let mut text = String::new();
    let mut usage = None;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow::Error::new(Cancelled)),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(BackendEvent::TextDelta { text: delta })) => {
                if let Some(events) = events {
                    let _ = events.send(AgentEvent::TextChunk(delta.clone())).await;
                }
                text.push_str(&delta);
            }
            Some(Ok(BackendEvent::ToolStart { name, args })) => {
                if let Some(events) = events {
                    let _ = events.send(AgentEvent::ToolUse { name, args }).await;
                }
            }
            Some(Ok(BackendEvent::ToolEnd { name, result })) => {
                if let Some(events) = events {
                    let _ = events.send(AgentEvent::ToolResult { name, result }).await;
                }
            }
            Some(Ok(BackendEvent::End { usage: end_usage })) => usage = end_usage,
            Some(Err(err)) => return Err(err),
            None => break,
        }
    }
    Ok((text, usage))
}
