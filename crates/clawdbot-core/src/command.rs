//! Chat command routing.
//!
//! Commands are matched against normalized text before anything reaches
//! the agent. Each command carries its own policy (group visibility, auth,
//! main-session requirement); the first alias match in registration order
//! wins.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clawdbot_schema::SessionKey;

#[derive(Debug, Clone, Copy)]
pub struct CommandPolicy {
    pub allow_in_group: bool,
    pub requires_auth: bool,
    pub require_main_session: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            allow_in_group: true,
            requires_auth: true,
            require_main_session: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandContext {
    pub provider: String,
    pub sender: String,
    pub is_group: bool,
    pub session_key: SessionKey,
    /// Remainder of the normalized text after the matched alias.
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Reply with this text and stop.
    Reply(String),
    /// Handled silently; stop.
    Handled,
    /// Not consumed; continue to the agent.
    PassThrough,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &CommandContext) -> Result<CommandOutcome>;
}

pub struct ChatCommand {
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub accepts_args: bool,
    pub policy: CommandPolicy,
    pub handler: Arc<dyn CommandHandler>,
}

/// Consulted read-only by the router; the pairing store implements it.
pub trait Authorizer: Send + Sync {
    fn is_allowed(&self, provider: &str, principal: &str) -> bool;
}

/// Everyone is allowed; used by local surfaces (CLI, heartbeat).
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_allowed(&self, _provider: &str, _principal: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    Reply(String),
    Handled,
    /// Matched a command requiring auth from an unauthorized sender.
    Unauthorized { command: String },
    PassThrough,
}

pub struct CommandRouter {
    commands: Vec<ChatCommand>,
    authorizer: Arc<dyn Authorizer>,
}

pub fn normalize_command_text(text: &str) -> String {
    let collapsed = text
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .strip_prefix('/')
        .map(str::to_string)
        .unwrap_or(collapsed)
}

impl CommandRouter {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            commands: Vec::new(),
            authorizer,
        }
    }

    pub fn register(&mut self, command: ChatCommand) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> impl Iterator<Item = &ChatCommand> {
        self.commands.iter()
    }

    /// Route one inbound text. Matching is on normalized text; policy is
    /// evaluated before the handler runs.
    pub async fn route(&self, text: &str, ctx_base: &CommandContext) -> Result<RouteResult> {
        let normalized = normalize_command_text(text);
        if normalized.is_empty() {
            return Ok(RouteResult::PassThrough);
        }

        for command in &self.commands {
            let Some(args) = match_alias(command, &normalized) else {
                continue;
            };

            if ctx_base.is_group && !command.policy.allow_in_group {
                return Ok(RouteResult::PassThrough);
            }
            if command.policy.require_main_session && !ctx_base.session_key.is_main() {
                return Ok(RouteResult::PassThrough);
            }
            if command.policy.requires_auth
                && !self
                    .authorizer
                    .is_allowed(&ctx_base.provider, &ctx_base.sender)
            {
                return Ok(RouteResult::Unauthorized {
                    command: command.canonical_name.clone(),
                });
            }

            let ctx = CommandContext {
                args,
                ..ctx_base.clone()
            };
            tracing::debug!(command = %command.canonical_name, "chat command matched");
            return Ok(match command.handler.handle(&ctx).await? {
                CommandOutcome::Reply(text) => RouteResult::Reply(text),
                CommandOutcome::Handled => RouteResult::Handled,
                CommandOutcome::PassThrough => RouteResult::PassThrough,
            });
        }

        Ok(RouteResult::PassThrough)
    }
}

/// Literal alias match against a normalized prefix. Commands that reject
/// arguments only match when nothing follows the alias.
fn match_alias(command: &ChatCommand, normalized: &str) -> Option<String> {
    for alias in &command.aliases {
        if normalized == alias.as_str() {
            return Some(String::new());
        }
        if let Some(rest) = normalized.strip_prefix(alias.as_str()) {
            if let Some(args) = rest.strip_prefix(' ') {
                if command.accepts_args {
                    return Some(args.to_string());
                }
                return None;
            }
        }
    }
    None
}
