//! Beacon records and DNS-SD text encoding.
//!
//! Instance names travel with `\DDD` decimal escapes on the wire. The
//! decoder treats escapes as a byte stream and UTF-8-decodes the whole
//! result, so multi-byte characters split across consecutive escapes
//! survive.

use serde::{Deserialize, Serialize};

pub const SERVICE_TYPE: &str = "_clawdbot-bridge._tcp";
pub const LOCAL_DOMAIN: &str = "local.";
pub const WIDE_AREA_DOMAIN: &str = "clawdbot.internal.";

/// One advertisement describing a reachable gateway instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    pub role: String,
    pub instance_name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailnet_dns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    pub transport: String,
}

impl Beacon {
    pub fn gateway(instance_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            role: "gateway".into(),
            instance_name: instance_name.into(),
            display_name: display_name.into(),
            lan_host: None,
            bridge_port: None,
            gateway_port: None,
            canvas_port: None,
            ssh_port: None,
            tailnet_dns: None,
            cli_path: None,
            transport: "bridge".into(),
        }
    }

    /// TXT key/value pairs in wire order. Absent fields are omitted.
    pub fn to_txt(&self) -> Vec<(String, String)> {
        let mut txt = vec![
            ("role".to_string(), self.role.clone()),
            ("displayName".to_string(), self.display_name.clone()),
        ];
        let mut push_opt = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                txt.push((key.to_string(), value));
            }
        };
        push_opt("lanHost", self.lan_host.clone());
        push_opt("gatewayPort", self.gateway_port.map(|p| p.to_string()));
        push_opt("bridgePort", self.bridge_port.map(|p| p.to_string()));
        push_opt("canvasPort", self.canvas_port.map(|p| p.to_string()));
        push_opt("sshPort", self.ssh_port.map(|p| p.to_string()));
        push_opt("transport", Some(self.transport.clone()));
        push_opt("cliPath", self.cli_path.clone());
        push_opt("tailnetDns", self.tailnet_dns.clone());
        txt
    }

    /// Rebuild a beacon from a (possibly escaped) instance name and TXT
    /// pairs.
    pub fn from_txt(raw_instance_name: &str, txt: &[(String, String)]) -> Self {
        let get = |key: &str| {
            txt.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let port = |key: &str| get(key).and_then(|v| v.parse().ok());
        Self {
            role: get("role").unwrap_or_else(|| "gateway".into()),
            instance_name: decode_dns_escapes(raw_instance_name),
            display_name: get("displayName").unwrap_or_default(),
            lan_host: get("lanHost"),
            bridge_port: port("bridgePort"),
            gateway_port: port("gatewayPort"),
            canvas_port: port("canvasPort"),
            ssh_port: port("sshPort"),
            tailnet_dns: get("tailnetDns"),
            cli_path: get("cliPath"),
            transport: get("transport").unwrap_or_else(|| "bridge".into()),
        }
    }
}

/// Decode `\DDD` and `\X` escapes into the original bytes, then UTF-8
/// decode the whole result.
pub fn decode_dns_escapes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if i + 3 < bytes.len() && bytes[i + 1..=i + 3].iter().all(u8::is_ascii_digit) {
                let value = (bytes[i + 1] - b'0') as u16 * 100
                    + (bytes[i + 2] - b'0') as u16 * 10
                    + (bytes[i + 3] - b'0') as u16;
                if value <= 255 {
                    out.push(value as u8);
                    i += 4;
                    continue;
                }
            }
            if i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Escape an instance name for the wire: backslash and dot get a
/// backslash prefix; spaces and non-printable bytes become `\DDD`.
pub fn encode_dns_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'.' => out.push_str("\\."),
            0x21..=0x7e => out.push(byte as char),
            other => out.push_str(&format!("\\{other:03}")),
        }
    }
    out
}
