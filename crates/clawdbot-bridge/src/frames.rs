//! Bridge wire protocol: length-prefixed JSON frames.
//!
//! Every frame carries an increasing `seq`; receivers drop regressions so
//! a delayed duplicate cannot reorder the stream.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeCap {
    Canvas,
    Screen,
    Camera,
    VoiceWake,
    Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    #[serde(rename_all = "camelCase")]
    Hello {
        seq: u64,
        node_id: String,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        platform: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_family: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_identifier: Option<String>,
        #[serde(default)]
        caps: Vec<NodeCap>,
        #[serde(default)]
        commands: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Welcome {
        seq: u64,
        server_name: String,
        capabilities: Vec<String>,
        /// Server-issued bearer for subsequent attaches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Pair { seq: u64, status: String, code: String },
    #[serde(rename_all = "camelCase")]
    Ping { seq: u64, ts: i64 },
    #[serde(rename_all = "camelCase")]
    Goodbye { seq: u64, reason: String },
    #[serde(rename_all = "camelCase")]
    Event {
        seq: u64,
        name: String,
        payload: serde_json::Value,
    },
    /// An inbound admission forwarded from the node to the gateway.
    #[serde(rename_all = "camelCase")]
    Message { seq: u64, text: String },
}

impl BridgeFrame {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Hello { seq, .. }
            | Self::Welcome { seq, .. }
            | Self::Pair { seq, .. }
            | Self::Ping { seq, .. }
            | Self::Goodbye { seq, .. }
            | Self::Event { seq, .. }
            | Self::Message { seq, .. } => *seq,
        }
    }
}

pub fn encode_frame(frame: &BridgeFrame) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

pub fn decode_frame(bytes: &[u8]) -> Result<BridgeFrame> {
    serde_json::from_slice(bytes).context("decoding bridge frame")
}

/// Accepts only strictly increasing sequence numbers.
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: Option<u64>,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, seq: u64) -> bool {
        match self.last {
            Some(last) if seq <= last => false,
            _ => {
                self.last = Some(seq);
                true
            }
        }
    }
}

/// Credentials a dashboard websocket may present at `connect`.
#[derive(Debug, Clone, Default)]
pub struct ConnectExpectations {
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    /// Close with a policy-violation code.
    PolicyViolation,
}

/// Validate `connect.params.auth` against the configured credentials.
/// With no credentials configured, local connections are accepted.
pub fn check_connect_auth(params: &serde_json::Value, expected: &ConnectExpectations) -> AuthDecision {
    if expected.token.is_none() && expected.password.is_none() {
        return AuthDecision::Accept;
    }
    let presented = params.get("auth").and_then(|v| v.as_str());
    let Some(presented) = presented else {
        return AuthDecision::PolicyViolation;
    };
    let token_ok = expected.token.as_deref() == Some(presented);
    let password_ok = expected.password.as_deref() == Some(presented);
    if token_ok || password_ok {
        AuthDecision::Accept
    } else {
        AuthDecision::PolicyViolation
    }
}
