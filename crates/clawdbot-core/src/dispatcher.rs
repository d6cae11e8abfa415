//! Ordered reply delivery.
//!
//! One dispatcher per surface/session pair. A single FIFO holds `tool`,
//! `block`, and `final` replies; delivery is strictly serial, so a final
//! never overtakes a queued tool note. Payloads are token-filtered and
//! optionally human-paced before the sink's `deliver` runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clawdbot_schema::{ReplyKind, ReplyPayload, HEARTBEAT_TOKEN, SILENT_REPLY_TOKEN};
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReply {
    pub kind: ReplyKind,
    pub text: String,
    pub media_url: Option<String>,
}

/// Delivery callback into the owning provider adapter.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, reply: OutboundReply) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanDelay {
    Off,
    /// Uniform in [800, 1600] ms.
    Natural,
    Custom { min_ms: u64, max_ms: u64 },
}

impl HumanDelay {
    pub fn sample(&self) -> Duration {
        let (min, max) = match *self {
            Self::Off => return Duration::ZERO,
            Self::Natural => (800, 1600),
            Self::Custom { min_ms, max_ms } => {
                // A hollow range pins the delay to min.
                (min_ms, max_ms.max(min_ms))
            }
        };
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Clone)]
pub struct DispatcherConfig {
    pub response_prefix: Option<String>,
    pub human_delay: HumanDelay,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            response_prefix: None,
            human_delay: HumanDelay::Off,
        }
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&anyhow::Error, ReplyKind) + Send + Sync>;

#[derive(Clone, Default)]
pub struct DispatcherHooks {
    /// Typing indicator; fired once before each deliver.
    pub on_reply_start: Option<Hook>,
    pub on_heartbeat_strip: Option<Hook>,
    /// Deliver failures are reported here and the queue continues.
    pub on_error: Option<ErrorHook>,
    /// Fired once per transition to an empty queue.
    pub on_idle: Option<Hook>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyCounts {
    pub tool: usize,
    pub block: usize,
    pub final_: usize,
}

struct QueueState {
    queue: VecDeque<(ReplyKind, ReplyPayload)>,
    delivering: bool,
    delivered_any: bool,
    prefix_consumed: bool,
    high_water: usize,
    idle_announced: bool,
}

struct Inner {
    sink: Arc<dyn ReplySink>,
    config: DispatcherConfig,
    hooks: DispatcherHooks,
    state: Mutex<QueueState>,
    notify: Notify,
    idle_notify: Notify,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ReplyDispatcher {
    inner: Arc<Inner>,
}

impl ReplyDispatcher {
    pub fn spawn(
        sink: Arc<dyn ReplySink>,
        config: DispatcherConfig,
        hooks: DispatcherHooks,
    ) -> Self {
        let inner = Arc::new(Inner {
            sink,
            config,
            hooks,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                delivering: false,
                delivered_any: false,
                prefix_consumed: false,
                high_water: 0,
                idle_announced: false,
            }),
            notify: Notify::new(),
            idle_notify: Notify::new(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_queue(inner.clone()));
        Self { inner }
    }

    pub fn enqueue(&self, kind: ReplyKind, payload: ReplyPayload) {
        {
            let mut state = self.inner.state.lock().expect("dispatcher state");
            state.queue.push_back((kind, payload));
            state.high_water = state.high_water.max(state.queue.len());
            state.idle_announced = false;
        }
        self.inner.notify.notify_one();
    }

    pub fn queued_counts(&self) -> ReplyCounts {
        let state = self.inner.state.lock().expect("dispatcher state");
        let mut counts = ReplyCounts::default();
        for (kind, _) in &state.queue {
            match kind {
                ReplyKind::Tool => counts.tool += 1,
                ReplyKind::Block => counts.block += 1,
                ReplyKind::Final => counts.final_ += 1,
            }
        }
        counts
    }

    pub fn queued_high_water(&self) -> usize {
        self.inner.state.lock().expect("dispatcher state").high_water
    }

    /// Resolves once the queue is drained and nothing is in flight.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle_notify.notified();
            {
                let state = self.inner.state.lock().expect("dispatcher state");
                if state.queue.is_empty() && !state.delivering {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Drop pending items and stop the worker; an in-flight deliver
    /// completes first.
    pub fn abort(&self) {
        self.inner.cancel.cancel();
        self.inner.notify.notify_one();
    }
}

async fn run_queue(inner: Arc<Inner>) {
    loop {
        if inner.cancel.is_cancelled() {
            let mut state = inner.state.lock().expect("dispatcher state");
            state.queue.clear();
            state.delivering = false;
            drop(state);
            inner.idle_notify.notify_waiters();
            return;
        }

        let item = {
            let mut state = inner.state.lock().expect("dispatcher state");
            let item = state.queue.pop_front();
            if item.is_some() {
                state.delivering = true;
            }
            item
        };

        let Some((kind, payload)) = item else {
            let announce = {
                let mut state = inner.state.lock().expect("dispatcher state");
                let first = !state.idle_announced;
                state.idle_announced = true;
                first
            };
            if announce {
                if let Some(on_idle) = &inner.hooks.on_idle {
                    on_idle();
                }
            }
            inner.idle_notify.notify_waiters();

            tokio::select! {
                _ = inner.notify.notified() => continue,
                _ = inner.cancel.cancelled() => continue,
            }
        };

        let prepared = {
            let state = inner.state.lock().expect("dispatcher state");
            prepare_reply(&inner.config, &state, kind, payload)
        };

        if prepared.stripped_heartbeat {
            if let Some(hook) = &inner.hooks.on_heartbeat_strip {
                hook();
            }
        }

        let Some(reply) = prepared.reply else {
            finish_item(&inner, false, prepared.consumed_prefix);
            continue;
        };

        // Human pacing applies to block replies once something was sent.
        let delay = {
            let state = inner.state.lock().expect("dispatcher state");
            if kind == ReplyKind::Block && state.delivered_any {
                inner.config.human_delay.sample()
            } else {
                Duration::ZERO
            }
        };
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.cancel.cancelled() => {
                    finish_item(&inner, false, prepared.consumed_prefix);
                    continue;
                }
            }
        }

        if let Some(on_reply_start) = &inner.hooks.on_reply_start {
            on_reply_start();
        }

        let kind_for_error = reply.kind;
        if let Err(err) = inner.sink.deliver(reply).await {
            tracing::warn!("reply deliver failed: {err:#}");
            if let Some(on_error) = &inner.hooks.on_error {
                on_error(&err, kind_for_error);
            }
        }
        finish_item(&inner, true, prepared.consumed_prefix);
    }
}

fn finish_item(inner: &Inner, delivered: bool, consumed_prefix: bool) {
    let mut state = inner.state.lock().expect("dispatcher state");
    state.delivering = false;
    if delivered {
        state.delivered_any = true;
    }
    if consumed_prefix {
        state.prefix_consumed = true;
    }
    drop(state);
    inner.idle_notify.notify_waiters();
}

struct PreparedReply {
    reply: Option<OutboundReply>,
    stripped_heartbeat: bool,
    consumed_prefix: bool,
}

fn prepare_reply(
    config: &DispatcherConfig,
    state: &QueueState,
    kind: ReplyKind,
    payload: ReplyPayload,
) -> PreparedReply {
    let dropped = PreparedReply {
        reply: None,
        stripped_heartbeat: false,
        consumed_prefix: false,
    };

    let trimmed = payload.text.trim();
    let has_media = payload.media_url.is_some();

    // Silent token, optionally followed by `--` narration.
    if !has_media {
        if let Some(rest) = trimmed.strip_prefix(SILENT_REPLY_TOKEN) {
            let rest = rest.trim_start();
            if rest.is_empty() || rest.starts_with("--") {
                return dropped;
            }
        }
        if trimmed.is_empty() {
            return dropped;
        }
    }

    let (stripped, removed_heartbeat) = strip_heartbeat_edges(trimmed);
    let mut text = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.is_empty() && !has_media {
        return PreparedReply {
            reply: None,
            stripped_heartbeat: removed_heartbeat,
            consumed_prefix: false,
        };
    }

    let mut consumed_prefix = false;
    if let Some(prefix) = &config.response_prefix {
        if !state.prefix_consumed && !text.is_empty() {
            if !text.starts_with(prefix.as_str()) {
                text = format!("{prefix} {text}");
            }
            consumed_prefix = true;
        }
    }

    PreparedReply {
        reply: Some(OutboundReply {
            kind,
            text,
            media_url: payload.media_url,
        }),
        stripped_heartbeat: removed_heartbeat,
        consumed_prefix,
    }
}

fn strip_heartbeat_edges(text: &str) -> (&str, bool) {
    let mut out = text;
    let mut removed = false;
    loop {
        let trimmed = out.trim();
        if let Some(rest) = trimmed.strip_prefix(HEARTBEAT_TOKEN) {
            out = rest;
            removed = true;
            continue;
        }
        if let Some(rest) = trimmed.strip_suffix(HEARTBEAT_TOKEN) {
            out = rest;
            removed = true;
            continue;
        }
        return (trimmed, removed);
    }
}
