//! Inbound admission pipeline.
//!
//! Provider adapters hand messages to [`Gateway::handle_inbound`]; the
//! gateway runs them through dedup, the command router, and fast-abort
//! before scheduling an agent turn. Cron firings and bridge messages
//! enter through the same admission path via bus listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clawdbot_auth::{pairing_reply, PairingStore};
use clawdbot_bridge::BridgeAdmission;
use clawdbot_bus::{BusPublisher, EventBus};
use clawdbot_core::{
    AgentRunner, Authorizer, ChatCommand, CommandContext, CommandHandler, CommandOutcome,
    CommandPolicy, CommandRouter, Config, DedupContext, DispatcherConfig, DispatcherHooks,
    HumanDelay, InboundDeduper, OutboundReply, ReplyDispatcher, ReplySink, RouteResult,
    RunParams,
};
use clawdbot_provider::is_cancellation;
use clawdbot_schema::{
    BusMessage, CronPayload, InboundMessage, ReplyKind, ReplyPayload, RunStatus, SessionKey,
    SessionTarget, Topic, WakeMode,
};
use clawdbot_scheduler::CronScheduler;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Keywords that cancel the in-flight turn for the session instead of
/// starting a new one.
const FAST_ABORT_KEYWORDS: [&str; 5] = ["stop", "abort", "esc", "cancel", "wait"];

/// Where the last interactive message came from; cron and heartbeat
/// deliveries follow the user there.
#[derive(Debug, Clone)]
pub struct LastActive {
    pub provider: String,
    pub peer: String,
    pub session_key: SessionKey,
}

struct NullSink;

#[async_trait]
impl ReplySink for NullSink {
    async fn deliver(&self, reply: OutboundReply) -> Result<()> {
        tracing::debug!(kind = ?reply.kind, "no sink registered; reply dropped");
        Ok(())
    }
}

struct PairingAuthorizer(Arc<PairingStore>);

impl Authorizer for PairingAuthorizer {
    fn is_allowed(&self, provider: &str, principal: &str) -> bool {
        // Local surfaces are implicitly trusted.
        if provider == "cli" || provider == "heartbeat" {
            return true;
        }
        self.0.is_allowed(provider, principal)
    }
}

pub struct Gateway {
    runner: Arc<AgentRunner>,
    config: Config,
    dedup: InboundDeduper,
    router: CommandRouter,
    pairing: Arc<PairingStore>,
    scheduler: Option<Arc<CronScheduler>>,
    bus: BusPublisher,
    sinks: Mutex<HashMap<String, Arc<dyn ReplySink>>>,
    dispatchers: Mutex<HashMap<String, ReplyDispatcher>>,
    last_active: Mutex<Option<LastActive>>,
    /// Agent-turn payloads parked until the next heartbeat wake.
    deferred: Mutex<Vec<String>>,
}

impl Gateway {
    pub fn new(
        runner: Arc<AgentRunner>,
        pairing: Arc<PairingStore>,
        scheduler: Option<Arc<CronScheduler>>,
        bus: BusPublisher,
    ) -> Arc<Self> {
        let config = runner.config().clone();
        let mut router = CommandRouter::new(Arc::new(PairingAuthorizer(pairing.clone())));
        register_builtin_commands(&mut router, runner.clone(), pairing.clone(), scheduler.clone());

        Arc::new(Self {
            runner,
            config,
            dedup: InboundDeduper::new(),
            router,
            pairing,
            scheduler,
            bus,
            sinks: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
            last_active: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
        })
    }

    /// Attach a provider adapter's send function.
    pub fn register_sink(&self, provider: &str, sink: Arc<dyn ReplySink>) {
        self.sinks
            .lock()
            .expect("gateway sinks")
            .insert(provider.to_string(), sink);
    }

    pub fn last_active(&self) -> Option<LastActive> {
        self.last_active.lock().expect("gateway last active").clone()
    }

    pub fn session_key_for(&self, msg: &InboundMessage) -> SessionKey {
        match self.config.session.scope {
            clawdbot_core::SessionScope::Global => SessionKey::global(self.runner.agent_id()),
            clawdbot_core::SessionScope::PerSender => {
                SessionKey::for_peer(self.runner.agent_id(), &msg.provider, &msg.peer)
            }
        }
    }

    fn dispatcher_for(&self, provider: &str, session_key: &SessionKey) -> ReplyDispatcher {
        let key = format!("{provider}|{session_key}");
        let mut dispatchers = self.dispatchers.lock().expect("gateway dispatchers");
        dispatchers
            .entry(key)
            .or_insert_with(|| {
                let sink = self
                    .sinks
                    .lock()
                    .expect("gateway sinks")
                    .get(provider)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(NullSink));
                ReplyDispatcher::spawn(
                    sink,
                    DispatcherConfig {
                        response_prefix: self.config.agent.response_prefix.clone(),
                        human_delay: HumanDelay::Off,
                    },
                    DispatcherHooks::default(),
                )
            })
            .clone()
    }

    /// Admit one inbound message. Returns after the reply (if any) has
    /// been enqueued; delivery is asynchronous.
    pub async fn handle_inbound(&self, msg: InboundMessage) -> Result<()> {
        let session_key = self.session_key_for(&msg);

        let ctx = DedupContext {
            provider: &msg.provider,
            peer: &msg.peer,
            message_id: msg.message_id.as_deref(),
            session_key: Some(session_key.as_str()),
        };
        if self.dedup.should_skip(&ctx) {
            tracing::debug!(provider = %msg.provider, "duplicate inbound suppressed");
            return Ok(());
        }

        {
            let mut last = self.last_active.lock().expect("gateway last active");
            *last = Some(LastActive {
                provider: msg.provider.clone(),
                peer: msg.peer.clone(),
                session_key: session_key.clone(),
            });
        }

        let dispatcher = self.dispatcher_for(&msg.provider, &session_key);

        // Fast-abort: a bare keyword cancels the in-flight turn.
        let lowered = msg.text.trim().to_lowercase();
        if FAST_ABORT_KEYWORDS.contains(&lowered.as_str())
            && self.runner.session_busy(&session_key)
        {
            self.runner.abort_session(&session_key);
            dispatcher.enqueue(ReplyKind::Final, ReplyPayload::text("Stopped."));
            return Ok(());
        }

        let ctx = CommandContext {
            provider: msg.provider.clone(),
            sender: msg.peer.clone(),
            is_group: msg.is_group,
            session_key: session_key.clone(),
            args: String::new(),
        };
        match self.router.route(&msg.text, &ctx).await? {
            RouteResult::Reply(text) => {
                dispatcher.enqueue(ReplyKind::Final, ReplyPayload::text(text));
                return Ok(());
            }
            RouteResult::Handled => return Ok(()),
            RouteResult::Unauthorized { command } => {
                tracing::info!(%command, peer = %msg.peer, "unauthorized command");
                let code = self.pairing.issue_code(&msg.provider, &msg.peer)?;
                let id_line = format!("{} {}", msg.provider, msg.peer);
                dispatcher.enqueue(
                    ReplyKind::Final,
                    ReplyPayload::text(pairing_reply(&id_line, &msg.provider, &code)),
                );
                return Ok(());
            }
            RouteResult::PassThrough => {}
        }

        self.run_turn(&msg.text, session_key, dispatcher, None, CancellationToken::new())
            .await
    }

    /// Run one agent turn and enqueue the outcome on the dispatcher.
    async fn run_turn(
        &self,
        message: &str,
        session_key: SessionKey,
        dispatcher: ReplyDispatcher,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.run_reporting(message, session_key, dispatcher, timeout, cancel)
            .await;
        Ok(())
    }

    /// Run a turn and report how it went; failures are surfaced to the
    /// user as a best-effort reason, never a stack trace.
    async fn run_reporting(
        &self,
        message: &str,
        session_key: SessionKey,
        dispatcher: ReplyDispatcher,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> (RunStatus, Option<String>, Option<String>) {
        let mut params = RunParams::message(message);
        params.session_key = Some(session_key.clone());
        params.timeout = timeout;
        params.cancel = cancel;

        match self.runner.run(params).await {
            Ok(outcome) => {
                dispatcher.enqueue(
                    ReplyKind::Final,
                    ReplyPayload::text(outcome.response.clone()),
                );
                (RunStatus::Ok, None, Some(outcome.response))
            }
            Err(err) if is_cancellation(&err) => {
                tracing::debug!(session = %session_key, "turn aborted");
                (RunStatus::Skipped, Some("cancelled".into()), None)
            }
            Err(err) => {
                tracing::warn!(session = %session_key, "agent turn failed: {err:#}");
                dispatcher.enqueue(
                    ReplyKind::Final,
                    ReplyPayload::text(format!("Agent error: {err}")),
                );
                (RunStatus::Error, Some(err.to_string()), None)
            }
        }
    }

    /// Dispatcher pointed at wherever the user last talked to us.
    fn main_dispatcher(&self) -> ReplyDispatcher {
        let main_key = self.runner.main_session_key();
        match self.last_active() {
            Some(last) => self.dispatcher_for(&last.provider, &last.session_key),
            None => self.dispatcher_for("cli", &main_key),
        }
    }

    /// Park an agent-turn payload for the next heartbeat wake.
    fn defer_for_heartbeat(&self, message: String) {
        self.deferred.lock().expect("gateway deferred").push(message);
    }

    fn take_deferred(&self) -> Vec<String> {
        std::mem::take(&mut *self.deferred.lock().expect("gateway deferred"))
    }

    async fn execute_cron(
        &self,
        job_id: Uuid,
        session_target: SessionTarget,
        wake_mode: WakeMode,
        payload: CronPayload,
        isolation_prefix: Option<String>,
        triggered_at_ms: i64,
    ) {
        let started = triggered_at_ms;
        let (status, error, response) = match (session_target, payload) {
            (SessionTarget::Main, CronPayload::SystemEvent { text }) => {
                let dispatcher = self.main_dispatcher();
                let key = self.runner.main_session_key();
                self.run_reporting(
                    &format!("System event: {text}"),
                    key,
                    dispatcher,
                    None,
                    CancellationToken::new(),
                )
                .await
            }
            (SessionTarget::Main, CronPayload::AgentTurn { message, .. }) => {
                match wake_mode {
                    WakeMode::NextHeartbeat => {
                        // Parked; the next heartbeat tick picks it up.
                        self.defer_for_heartbeat(message.clone());
                        (RunStatus::Ok, None, None)
                    }
                    WakeMode::Now => {
                        let dispatcher = self.main_dispatcher();
                        let key = self.runner.main_session_key();
                        self.run_reporting(
                            &message,
                            key,
                            dispatcher,
                            None,
                            CancellationToken::new(),
                        )
                        .await
                    }
                }
            }
            (SessionTarget::Isolated, payload) => {
                let (message, timeout) = match payload {
                    CronPayload::AgentTurn {
                        message,
                        timeout_seconds,
                        ..
                    } => (message, timeout_seconds.map(Duration::from_secs)),
                    CronPayload::SystemEvent { text } => (text, None),
                };
                let key = SessionKey(format!(
                    "agent:{}:cron:{}:{}",
                    self.runner.agent_id(),
                    job_id,
                    Uuid::new_v4()
                ));

                let mut params = RunParams::message(message.as_str());
                params.session_key = Some(key.clone());
                params.timeout = timeout;
                match self.runner.run(params).await {
                    Ok(outcome) => {
                        if let Some(prefix) = &isolation_prefix {
                            if !outcome.response.trim().is_empty() {
                                self.main_dispatcher().enqueue(
                                    ReplyKind::Block,
                                    ReplyPayload::text(format!("{prefix} {}", outcome.response)),
                                );
                            }
                        }
                        (RunStatus::Ok, None, Some(outcome.response))
                    }
                    Err(err) => (RunStatus::Error, Some(err.to_string()), None),
                }
            }
        };

        let _ = self
            .bus
            .publish(BusMessage::CronCompleted {
                job_id,
                status,
                error,
                started_at_ms: started,
                ended_at_ms: Utc::now().timestamp_millis(),
                response,
            })
            .await;
    }

    pub fn scheduler(&self) -> Option<&Arc<CronScheduler>> {
        self.scheduler.as_ref()
    }
}

/// Execute cron firings arriving on the bus.
pub fn spawn_cron_listener(
    gateway: Arc<Gateway>,
    bus: &EventBus,
) -> tokio::task::JoinHandle<()> {
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut rx = bus.subscribe(Topic::CronTriggered).await;
        while let Some(msg) = rx.recv().await {
            let BusMessage::CronTriggered {
                job_id,
                job_name: _,
                session_target,
                wake_mode,
                payload,
                isolation_prefix,
                triggered_at_ms,
            } = msg
            else {
                continue;
            };
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .execute_cron(
                        job_id,
                        session_target,
                        wake_mode,
                        payload,
                        isolation_prefix,
                        triggered_at_ms,
                    )
                    .await;
            });
        }
    })
}

/// Run wake requests: deferred payloads (and any wake text) become main-
/// session turns when the wake is immediate.
pub fn spawn_wake_listener(gateway: Arc<Gateway>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut rx = bus.subscribe(Topic::WakeRequested).await;
        while let Some(msg) = rx.recv().await {
            let BusMessage::WakeRequested { mode, text, reason } = msg else {
                continue;
            };
            tracing::debug!(?mode, ?reason, "wake requested");
            match mode {
                WakeMode::NextHeartbeat => {
                    if let Some(text) = text {
                        gateway.defer_for_heartbeat(text);
                    }
                }
                WakeMode::Now => {
                    let mut messages = gateway.take_deferred();
                    messages.extend(text);
                    for message in messages {
                        let dispatcher = gateway.main_dispatcher();
                        let key = gateway.runner.main_session_key();
                        let _ = gateway
                            .run_turn(&message, key, dispatcher, None, CancellationToken::new())
                            .await;
                    }
                }
            }
        }
    })
}

/// Admit bridge messages as inbound turns from the `bridge` provider.
pub fn spawn_bridge_listener(
    gateway: Arc<Gateway>,
    mut admissions: tokio::sync::mpsc::Receiver<BridgeAdmission>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(admission) = admissions.recv().await {
            let msg = InboundMessage {
                provider: "bridge".into(),
                peer: admission.node_id,
                message_id: None,
                text: admission.text,
                at: Utc::now(),
                is_group: false,
                media_url: None,
            };
            if let Err(err) = gateway.handle_inbound(msg).await {
                tracing::warn!("bridge admission failed: {err:#}");
            }
        }
    })
}

// ---- built-in chat commands ----

struct HelpCommand;

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn handle(&self, _ctx: &CommandContext) -> Result<CommandOutcome> {
        Ok(CommandOutcome::Reply(
            "Commands: /help, /status, /reset, /pairing approve <provider> <code>, /cron <status|list>"
                .to_string(),
        ))
    }
}

struct StatusCommand {
    runner: Arc<AgentRunner>,
}

#[async_trait]
impl CommandHandler for StatusCommand {
    async fn handle(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let session = self.runner.sessions().get(ctx.session_key.as_str());
        let model = session
            .as_ref()
            .and_then(|s| s.last_model.as_ref())
            .map(|m| format!("{}/{}", m.provider, m.model))
            .unwrap_or_else(|| self.runner.config().agent.model.primary());
        let tokens = session.map(|s| s.total_tokens).unwrap_or(0);
        Ok(CommandOutcome::Reply(format!(
            "Agent: {}\nModel: {model}\nSession: {}\nTokens: {tokens}",
            self.runner.agent_id(),
            ctx.session_key
        )))
    }
}

struct ResetCommand {
    runner: Arc<AgentRunner>,
}

#[async_trait]
impl CommandHandler for ResetCommand {
    async fn handle(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        self.runner.sessions().reset(ctx.session_key.as_str())?;
        Ok(CommandOutcome::Reply("Session reset.".to_string()))
    }
}

struct PairingCommand {
    pairing: Arc<PairingStore>,
}

#[async_trait]
impl CommandHandler for PairingCommand {
    async fn handle(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let parts: Vec<&str> = ctx.args.split_whitespace().collect();
        match parts.as_slice() {
            ["approve", provider, code] => match self.pairing.approve(provider, code, &ctx.sender)
            {
                Ok(principal) => Ok(CommandOutcome::Reply(format!(
                    "Approved {principal} on {provider}."
                ))),
                Err(err) => Ok(CommandOutcome::Reply(format!("Pairing error: {err}"))),
            },
            _ => Ok(CommandOutcome::Reply(
                "Usage: pairing approve <provider> <code>".to_string(),
            )),
        }
    }
}

struct CronCommand {
    scheduler: Option<Arc<CronScheduler>>,
}

#[async_trait]
impl CommandHandler for CronCommand {
    async fn handle(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let Some(scheduler) = &self.scheduler else {
            return Ok(CommandOutcome::Reply("Cron is disabled.".to_string()));
        };
        match ctx.args.split_whitespace().next() {
            Some("status") | None => {
                let status = scheduler.status();
                Ok(CommandOutcome::Reply(format!(
                    "Cron: {} jobs, {} enabled, {} running",
                    status.jobs, status.enabled, status.running
                )))
            }
            Some("list") => {
                let jobs = scheduler.list(true);
                if jobs.is_empty() {
                    return Ok(CommandOutcome::Reply("No cron jobs.".to_string()));
                }
                let lines: Vec<String> = jobs
                    .iter()
                    .map(|j| {
                        format!(
                            "{} {} ({})",
                            j.id,
                            j.name,
                            if j.enabled { "enabled" } else { "disabled" }
                        )
                    })
                    .collect();
                Ok(CommandOutcome::Reply(lines.join("\n")))
            }
            Some(other) => Ok(CommandOutcome::Reply(format!(
                "Unknown cron action: {other}"
            ))),
        }
    }
}

fn register_builtin_commands(
    router: &mut CommandRouter,
    runner: Arc<AgentRunner>,
    pairing: Arc<PairingStore>,
    scheduler: Option<Arc<CronScheduler>>,
) {
    router.register(ChatCommand {
        canonical_name: "help".into(),
        aliases: vec!["help".into()],
        accepts_args: false,
        policy: CommandPolicy {
            requires_auth: false,
            ..Default::default()
        },
        handler: Arc::new(HelpCommand),
    });
    router.register(ChatCommand {
        canonical_name: "status".into(),
        aliases: vec!["status".into()],
        accepts_args: false,
        policy: CommandPolicy::default(),
        handler: Arc::new(StatusCommand {
            runner: runner.clone(),
        }),
    });
    router.register(ChatCommand {
        canonical_name: "reset".into(),
        aliases: vec!["reset".into(), "new".into()],
        accepts_args: false,
        policy: CommandPolicy {
            allow_in_group: false,
            ..Default::default()
        },
        handler: Arc::new(ResetCommand { runner }),
    });
    router.register(ChatCommand {
        canonical_name: "pairing".into(),
        aliases: vec!["pairing".into()],
        accepts_args: true,
        policy: CommandPolicy::default(),
        handler: Arc::new(PairingCommand { pairing }),
    });
    router.register(ChatCommand {
        canonical_name: "cron".into(),
        aliases: vec!["cron".into()],
        accepts_args: true,
        policy: CommandPolicy {
            require_main_session: false,
            ..Default::default()
        },
        handler: Arc::new(CronCommand { scheduler }),
    });
}

#[cfg(test)]
mod tests {
    use clawdbot_core::Runtime;
    use clawdbot_provider::{
        BackendEvent, BackendRegistry, BackendRequest, BackendStream, ModelBackend, StubBackend,
    };
    use clawdbot_scheduler::{JobInput, RawPayload, RawSchedule};

    use super::*;

    struct CollectingSink {
        delivered: Mutex<Vec<OutboundReply>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn texts(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ReplySink for CollectingSink {
        async fn deliver(&self, reply: OutboundReply) -> Result<()> {
            self.delivered.lock().unwrap().push(reply);
            Ok(())
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl ModelBackend for SlowBackend {
        async fn stream(
            &self,
            _request: BackendRequest,
            _cancel: CancellationToken,
        ) -> Result<BackendStream> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Box::pin(tokio_stream::iter(vec![
                Ok(BackendEvent::TextDelta {
                    text: "slow reply".into(),
                }),
                Ok(BackendEvent::End { usage: None }),
            ])))
        }
    }

    struct TestHarness {
        gateway: Arc<Gateway>,
        sink: Arc<CollectingSink>,
        bus: EventBus,
        pairing: Arc<PairingStore>,
        _tmp: tempfile::TempDir,
    }

    fn harness_with_backend(backend: Option<Arc<dyn ModelBackend>>) -> TestHarness {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.agent.workspace = Some(tmp.path().join("ws").to_string_lossy().into_owned());

        let mut registry = BackendRegistry::new();
        match backend {
            Some(backend) => registry.register("anthropic", backend),
            None => registry.register("anthropic", Arc::new(StubBackend::new("anthropic"))),
        }

        let runner = Arc::new(AgentRunner::new(
            "clawd",
            Runtime::new(tmp.path().join("state")),
            config,
            registry,
        ));
        let pairing = Arc::new(PairingStore::open(tmp.path().join("pairing.json")));
        let bus = EventBus::new(16);
        let scheduler = Arc::new(CronScheduler::new(
            &tmp.path().join("cron"),
            bus.publisher(),
            CancellationToken::new(),
            4,
        ));
        let gateway = Gateway::new(runner, pairing.clone(), Some(scheduler), bus.publisher());

        let sink = CollectingSink::new();
        gateway.register_sink("test", sink.clone());
        gateway.register_sink("cli", sink.clone());

        TestHarness {
            gateway,
            sink,
            bus,
            pairing,
            _tmp: tmp,
        }
    }

    fn harness() -> TestHarness {
        harness_with_backend(None)
    }

    fn inbound(text: &str, message_id: Option<&str>) -> InboundMessage {
        InboundMessage {
            provider: "test".into(),
            peer: "+15555550123".into(),
            message_id: message_id.map(str::to_string),
            text: text.into(),
            at: Utc::now(),
            is_group: false,
            media_url: None,
        }
    }

    async fn wait_for_texts(sink: &CollectingSink, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let texts = sink.texts();
            if texts.len() >= count {
                return texts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sink.texts()
    }

    fn approve_peer(h: &TestHarness) {
        let code = h.pairing.issue_code("test", "+15555550123").unwrap();
        h.pairing.approve("test", &code, "owner").unwrap();
    }

    #[tokio::test]
    async fn e2e_inbound_to_delivery() {
        let h = harness();
        h.gateway
            .handle_inbound(inbound("hello clawdbot", Some("m1")))
            .await
            .unwrap();

        let texts = wait_for_texts(&h.sink, 1).await;
        assert_eq!(texts, vec!["stub:anthropic:claude-sonnet-4-20250514"]);
    }

    #[tokio::test]
    async fn duplicate_within_ttl_runs_once() {
        let h = harness();
        h.gateway
            .handle_inbound(inbound("hello", Some("msg-1")))
            .await
            .unwrap();
        h.gateway
            .handle_inbound(inbound("hello", Some("msg-1")))
            .await
            .unwrap();

        let texts = wait_for_texts(&h.sink, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.sink.texts().len(), 1);
        assert_eq!(texts.len(), 1);
    }

    #[tokio::test]
    async fn missing_message_id_is_not_deduped() {
        let h = harness();
        h.gateway
            .handle_inbound(inbound("hello", None))
            .await
            .unwrap();
        h.gateway
            .handle_inbound(inbound("hello", None))
            .await
            .unwrap();
        let texts = wait_for_texts(&h.sink, 2).await;
        assert_eq!(texts.len(), 2);
    }

    #[tokio::test]
    async fn status_command_replies_without_agent_turn() {
        let h = harness();
        approve_peer(&h);
        h.gateway
            .handle_inbound(inbound("/status", Some("m1")))
            .await
            .unwrap();

        let texts = wait_for_texts(&h.sink, 1).await;
        assert!(texts[0].contains("Agent: clawd"));
        assert!(texts[0].contains("Session: agent:clawd:test:+15555550123"));
        assert!(!texts[0].contains("stub:"));
    }

    #[tokio::test]
    async fn unauthorized_command_gets_pairing_reply() {
        let h = harness();
        h.gateway
            .handle_inbound(inbound("/reset", Some("m1")))
            .await
            .unwrap();

        let texts = wait_for_texts(&h.sink, 1).await;
        assert!(texts[0].starts_with("Clawdbot: access not configured."));
        assert!(texts[0].contains("clawdbot pairing approve test "));
        assert_eq!(h.pairing.pending().len(), 1);
    }

    #[tokio::test]
    async fn pairing_approve_flow_via_command() {
        let h = harness();
        approve_peer(&h);

        let code = h.pairing.issue_code("whatsapp", "+1999").unwrap();
        h.gateway
            .handle_inbound(inbound(
                &format!("/pairing approve whatsapp {code}"),
                Some("m1"),
            ))
            .await
            .unwrap();

        let texts = wait_for_texts(&h.sink, 1).await;
        assert!(texts[0].contains("Approved +1999 on whatsapp."));
        assert!(h.pairing.is_allowed("whatsapp", "+1999"));
    }

    #[tokio::test]
    async fn fast_abort_cancels_inflight_turn() {
        let h = harness_with_backend(Some(Arc::new(SlowBackend)));
        let gateway = h.gateway.clone();

        let first = tokio::spawn({
            let gateway = gateway.clone();
            async move {
                gateway
                    .handle_inbound(inbound("write a long story", Some("m1")))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        gateway
            .handle_inbound(inbound("stop", Some("m2")))
            .await
            .unwrap();
        first.await.unwrap().unwrap();

        let texts = wait_for_texts(&h.sink, 1).await;
        assert_eq!(texts, vec!["Stopped."]);
    }

    #[tokio::test]
    async fn abort_keyword_without_active_run_is_a_turn() {
        let h = harness();
        h.gateway
            .handle_inbound(inbound("stop", Some("m1")))
            .await
            .unwrap();
        let texts = wait_for_texts(&h.sink, 1).await;
        assert!(texts[0].starts_with("stub:"));
    }

    #[tokio::test]
    async fn cron_isolated_turn_completes_and_posts_summary() {
        let h = harness();
        // Seed last-active so the summary has somewhere to go.
        h.gateway
            .handle_inbound(inbound("hi", Some("seed")))
            .await
            .unwrap();
        wait_for_texts(&h.sink, 1).await;

        let _cron_listener = spawn_cron_listener(h.gateway.clone(), &h.bus);
        let mut completed_rx = h.bus.subscribe(Topic::CronCompleted).await;
        // Give the listener a beat to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job_id = Uuid::new_v4();
        h.bus
            .publish(BusMessage::CronTriggered {
                job_id,
                job_name: "digest".into(),
                session_target: SessionTarget::Isolated,
                wake_mode: WakeMode::Now,
                payload: CronPayload::AgentTurn {
                    message: "summarize the day".into(),
                    thinking: None,
                    timeout_seconds: Some(30),
                    deliver: None,
                    provider: None,
                    to: None,
                    best_effort_deliver: None,
                },
                isolation_prefix: Some("[digest]".into()),
                triggered_at_ms: Utc::now().timestamp_millis(),
            })
            .await
            .unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(2), completed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match completed {
            BusMessage::CronCompleted {
                job_id: done_id,
                status,
                response,
                ..
            } => {
                assert_eq!(done_id, job_id);
                assert_eq!(status, RunStatus::Ok);
                assert!(response.unwrap().starts_with("stub:"));
            }
            other => panic!("unexpected message {other:?}"),
        }

        let texts = wait_for_texts(&h.sink, 2).await;
        assert!(texts.iter().any(|t| t.starts_with("[digest] stub:")));
    }

    #[tokio::test]
    async fn cron_main_system_event_runs_on_main_session() {
        let h = harness();
        h.gateway
            .handle_inbound(inbound("hi", Some("seed")))
            .await
            .unwrap();
        wait_for_texts(&h.sink, 1).await;

        let _cron_listener = spawn_cron_listener(h.gateway.clone(), &h.bus);
        let mut completed_rx = h.bus.subscribe(Topic::CronCompleted).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.bus
            .publish(BusMessage::CronTriggered {
                job_id: Uuid::new_v4(),
                job_name: "note".into(),
                session_target: SessionTarget::Main,
                wake_mode: WakeMode::Now,
                payload: CronPayload::SystemEvent {
                    text: "backup finished".into(),
                },
                isolation_prefix: None,
                triggered_at_ms: Utc::now().timestamp_millis(),
            })
            .await
            .unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(2), completed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            completed,
            BusMessage::CronCompleted {
                status: RunStatus::Ok,
                ..
            }
        ));
        // The main session saw a turn.
        let main_key = h.gateway.runner.main_session_key();
        assert!(h.gateway.runner.sessions().get(main_key.as_str()).is_some());
    }

    #[tokio::test]
    async fn next_heartbeat_turn_is_deferred_until_wake() {
        let h = harness();
        h.gateway
            .handle_inbound(inbound("hi", Some("seed")))
            .await
            .unwrap();
        wait_for_texts(&h.sink, 1).await;

        let _cron_listener = spawn_cron_listener(h.gateway.clone(), &h.bus);
        let _wake_listener = spawn_wake_listener(h.gateway.clone(), &h.bus);
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.bus
            .publish(BusMessage::CronTriggered {
                job_id: Uuid::new_v4(),
                job_name: "later".into(),
                session_target: SessionTarget::Main,
                wake_mode: WakeMode::NextHeartbeat,
                payload: CronPayload::AgentTurn {
                    message: "morning review".into(),
                    thinking: None,
                    timeout_seconds: None,
                    deliver: None,
                    provider: None,
                    to: None,
                    best_effort_deliver: None,
                },
                isolation_prefix: None,
                triggered_at_ms: Utc::now().timestamp_millis(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Nothing delivered yet beyond the seed reply.
        assert_eq!(h.sink.texts().len(), 1);

        h.bus
            .publish(BusMessage::WakeRequested {
                mode: WakeMode::Now,
                text: None,
                reason: Some("heartbeat".into()),
            })
            .await
            .unwrap();

        let texts = wait_for_texts(&h.sink, 2).await;
        assert_eq!(texts.len(), 2);
        assert!(texts[1].starts_with("stub:"));
    }

    #[tokio::test]
    async fn bridge_admissions_enter_the_pipeline() {
        let h = harness();
        h.gateway.register_sink("bridge", h.sink.clone());

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let _bridge_listener = spawn_bridge_listener(h.gateway.clone(), rx);
        tx.send(BridgeAdmission {
            node_id: "mac-studio".into(),
            text: "what's on today?".into(),
        })
        .await
        .unwrap();

        let texts = wait_for_texts(&h.sink, 1).await;
        assert!(texts[0].starts_with("stub:"));
    }

    #[tokio::test]
    async fn cron_command_lists_jobs() {
        let h = harness();
        approve_peer(&h);
        let scheduler = h.gateway.scheduler().unwrap().clone();
        scheduler
            .add(&JobInput {
                name: "daily".into(),
                schedule: RawSchedule {
                    every_ms: Some(86_400_000),
                    ..Default::default()
                },
                payload: RawPayload {
                    text: Some("ping".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        h.gateway
            .handle_inbound(inbound("/cron list", Some("m1")))
            .await
            .unwrap();
        let texts = wait_for_texts(&h.sink, 1).await;
        assert!(texts[0].contains("daily (enabled)"));
    }

    #[tokio::test]
    async fn agent_error_surfaces_reason_not_stack() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.agent.workspace = Some(tmp.path().join("ws").to_string_lossy().into_owned());

        // No backend registered for the default provider.
        let runner = Arc::new(AgentRunner::new(
            "clawd",
            Runtime::new(tmp.path().join("state")),
            config,
            BackendRegistry::new(),
        ));
        let pairing = Arc::new(PairingStore::open(tmp.path().join("pairing.json")));
        let bus = EventBus::new(16);
        let gateway = Gateway::new(runner, pairing, None, bus.publisher());
        let sink = CollectingSink::new();
        gateway.register_sink("test", sink.clone());

        gateway
            .handle_inbound(inbound("hello", Some("m1")))
            .await
            .unwrap();
        let texts = wait_for_texts(&sink, 1).await;
        assert!(texts[0].starts_with("Agent error:"));
        assert!(texts[0].contains("anthropic"));
    }
}
