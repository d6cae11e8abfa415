//! The bridge server: authenticated duplex sessions with peer nodes.
//!
//! Nodes attach over TCP with length-prefixed JSON frames. The handshake
//! validates a bearer against the pairing store; unknown nodes receive a
//! pairing code and may retry Hello on the same connection once approved.
//! One attachment per node id; a newer attach displaces the older one
//! after a graceful Goodbye.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clawdbot_auth::PairingStore;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::frames::{decode_frame, encode_frame, BridgeFrame, NodeCap, SeqTracker};

pub const PAIRING_PROVIDER: &str = "bridge";

#[derive(Debug, Clone)]
pub struct BridgeServerConfig {
    pub bind: String,
    pub port: u16,
    pub server_name: String,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for BridgeServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 18_790,
            server_name: "clawdbot".into(),
            handshake_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
        }
    }
}

/// Metadata for one attached node.
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub endpoint: String,
    pub node_id: String,
    pub display_name: String,
    pub token: String,
    pub caps: Vec<NodeCap>,
    pub commands: Vec<String>,
    pub platform: String,
    pub version: String,
    pub last_activity_ms: i64,
    pub attached_at_ms: i64,
}

/// An inbound text admitted from a node, forwarded to the gateway.
#[derive(Debug, Clone)]
pub struct BridgeAdmission {
    pub node_id: String,
    pub text: String,
}

struct LiveSession {
    conn_id: u64,
    info: NodeSession,
    cancel: CancellationToken,
    outbound: mpsc::Sender<BridgeFrame>,
}

pub struct BridgeServer {
    config: BridgeServerConfig,
    pairing: Arc<PairingStore>,
    sessions: Mutex<HashMap<String, LiveSession>>,
    admissions: mpsc::Sender<BridgeAdmission>,
    conn_counter: AtomicU64,
    cancel: CancellationToken,
}

impl BridgeServer {
    pub fn new(
        config: BridgeServerConfig,
        pairing: Arc<PairingStore>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<BridgeAdmission>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                config,
                pairing,
                sessions: Mutex::new(HashMap::new()),
                admissions: tx,
                conn_counter: AtomicU64::new(1),
                cancel,
            }),
            rx,
        )
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding bridge listener on {addr}"))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_conn(stream, peer).await {
                            tracing::debug!(%peer, "bridge connection ended: {err:#}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("bridge accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub fn attached(&self) -> Vec<NodeSession> {
        let sessions = self.sessions.lock().expect("bridge sessions");
        let mut out: Vec<_> = sessions.values().map(|s| s.info.clone()).collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let mut tracker = SeqTracker::new();
        let mut server_seq: u64 = 0;

        // Handshake: accept-to-Welcome is bounded by the configured timeout.
        let handshake = tokio::time::timeout(self.config.handshake_timeout, async {
            loop {
                let bytes = match framed.next().await {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => return Err(anyhow!("frame read failed: {err}")),
                    None => return Err(anyhow!("connection closed before handshake")),
                };
                let frame = decode_frame(&bytes)?;
                let BridgeFrame::Hello {
                    seq,
                    node_id,
                    display_name,
                    token,
                    platform,
                    version,
                    caps,
                    commands,
                    ..
                } = frame
                else {
                    return Err(anyhow!("expected hello, got another frame"));
                };
                if !tracker.accept(seq) {
                    continue;
                }

                let token_key = format!("bridge-token/{node_id}");
                let valid = token
                    .as_deref()
                    .map(|t| self.pairing.check_token(&token_key, t))
                    .unwrap_or(false);

                let bearer = if valid {
                    token.expect("checked above")
                } else if self.pairing.is_allowed(PAIRING_PROVIDER, &node_id) {
                    let bearer = issue_bearer();
                    self.pairing.set_token(&token_key, &bearer);
                    bearer
                } else {
                    let code = self.pairing.issue_code(PAIRING_PROVIDER, &node_id)?;
                    server_seq += 1;
                    framed
                        .send(encode_frame(&BridgeFrame::Pair {
                            seq: server_seq,
                            status: "pair".into(),
                            code,
                        })?)
                        .await?;
                    continue; // wait for the next Hello after approval
                };

                let now = Utc::now().timestamp_millis();
                return Ok(NodeSession {
                    endpoint: peer.to_string(),
                    node_id,
                    display_name,
                    token: bearer,
                    caps,
                    commands,
                    platform,
                    version,
                    last_activity_ms: now,
                    attached_at_ms: now,
                });
            }
        })
        .await
        .map_err(|_| anyhow!("handshake timed out"))??;

        let node_id = handshake.node_id.clone();
        let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst);
        let conn_cancel = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::channel::<BridgeFrame>(32);

        // Exclusive per node id: displace any prior attachment gracefully.
        let displaced = {
            let mut sessions = self.sessions.lock().expect("bridge sessions");
            sessions.insert(
                node_id.clone(),
                LiveSession {
                    conn_id,
                    info: handshake.clone(),
                    cancel: conn_cancel.clone(),
                    outbound: out_tx.clone(),
                },
            )
        };
        if let Some(prior) = displaced {
            tracing::info!(%node_id, "displacing prior bridge session");
            let _ = prior
                .outbound
                .send(BridgeFrame::Goodbye {
                    seq: u64::MAX,
                    reason: "displaced".into(),
                })
                .await;
            prior.cancel.cancel();
        }

        server_seq += 1;
        framed
            .send(encode_frame(&BridgeFrame::Welcome {
                seq: server_seq,
                server_name: self.config.server_name.clone(),
                capabilities: vec!["message".into(), "event".into()],
                token: Some(handshake.token.clone()),
            })?)
            .await?;

        let result = self
            .duplex(
                &mut framed,
                &node_id,
                &mut tracker,
                &mut server_seq,
                &conn_cancel,
                &mut out_rx,
            )
            .await;

        // Only remove the registry entry if it is still this connection.
        {
            let mut sessions = self.sessions.lock().expect("bridge sessions");
            if sessions.get(&node_id).is_some_and(|s| s.conn_id == conn_id) {
                sessions.remove(&node_id);
            }
        }
        result
    }

    async fn duplex(
        &self,
        framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
        node_id: &str,
        tracker: &mut SeqTracker,
        server_seq: &mut u64,
        conn_cancel: &CancellationToken,
        out_rx: &mut mpsc::Receiver<BridgeFrame>,
    ) -> Result<()> {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // first tick fires immediately
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => {
                    *server_seq += 1;
                    let _ = framed
                        .send(encode_frame(&BridgeFrame::Goodbye {
                            seq: *server_seq,
                            reason: "displaced".into(),
                        })?)
                        .await;
                    return Ok(());
                }
                _ = self.cancel.cancelled() => {
                    *server_seq += 1;
                    let _ = framed
                        .send(encode_frame(&BridgeFrame::Goodbye {
                            seq: *server_seq,
                            reason: "shutdown".into(),
                        })?)
                        .await;
                    return Ok(());
                }
                outbound = out_rx.recv() => {
                    if let Some(mut frame) = outbound {
                        *server_seq += 1;
                        set_seq(&mut frame, *server_seq);
                        framed.send(encode_frame(&frame)?).await?;
                    }
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() > self.config.ping_interval * 2 {
                        tracing::info!(%node_id, "bridge peer missed two pings; closing");
                        return Err(anyhow!("peer unresponsive"));
                    }
                    *server_seq += 1;
                    framed
                        .send(encode_frame(&BridgeFrame::Ping {
                            seq: *server_seq,
                            ts: Utc::now().timestamp_millis(),
                        })?)
                        .await?;
                }
                inbound = framed.next() => {
                    let bytes = match inbound {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(err)) => return Err(anyhow!("frame read failed: {err}")),
                        None => return Ok(()),
                    };
                    let frame = match decode_frame(&bytes) {
                        Ok(frame) => frame,
                        Err(err) => return Err(anyhow!("bad frame from {node_id}: {err}")),
                    };
                    if !tracker.accept(frame.seq()) {
                        tracing::debug!(%node_id, seq = frame.seq(), "out-of-order frame dropped");
                        continue;
                    }
                    last_seen = Instant::now();
                    self.touch(node_id);
                    match frame {
                        BridgeFrame::Ping { .. } => {}
                        BridgeFrame::Goodbye { reason, .. } => {
                            tracing::info!(%node_id, %reason, "bridge peer said goodbye");
                            return Ok(());
                        }
                        BridgeFrame::Message { text, .. } => {
                            let _ = self
                                .admissions
                                .send(BridgeAdmission {
                                    node_id: node_id.to_string(),
                                    text,
                                })
                                .await;
                        }
                        BridgeFrame::Event { name, .. } => {
                            tracing::debug!(%node_id, %name, "bridge event");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn touch(&self, node_id: &str) {
        let mut sessions = self.sessions.lock().expect("bridge sessions");
        if let Some(session) = sessions.get_mut(node_id) {
            session.info.last_activity_ms = Utc::now().timestamp_millis();
        }
    }

    /// Push a frame to an attached node. The per-connection sequence is
    /// assigned at send time.
    pub async fn send_to(&self, node_id: &str, frame: BridgeFrame) -> Result<()> {
        let outbound = {
            let sessions = self.sessions.lock().expect("bridge sessions");
            sessions
                .get(node_id)
                .map(|s| s.outbound.clone())
                .ok_or_else(|| anyhow!("node not attached: {node_id}"))?
        };
        outbound
            .send(frame)
            .await
            .map_err(|_| anyhow!("node connection closing: {node_id}"))
    }
}

fn set_seq(frame: &mut BridgeFrame, new_seq: u64) {
    match frame {
        BridgeFrame::Hello { seq, .. }
        | BridgeFrame::Welcome { seq, .. }
        | BridgeFrame::Pair { seq, .. }
        | BridgeFrame::Ping { seq, .. }
        | BridgeFrame::Goodbye { seq, .. }
        | BridgeFrame::Event { seq, .. }
        | BridgeFrame::Message { seq, .. } => *seq = new_seq,
    }
}

fn issue_bearer() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
