//! Transport abstraction over the announcement medium.
//!
//! The real transport multicasts simplified JSON records on the mDNS
//! group (and, for the wide-area domain, a local DNS server socket).
//! Tests swap in a mock.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::txt::SERVICE_TYPE;

pub const MDNS_MULTICAST_ADDR: &str = "224.0.0.251";
pub const MDNS_PORT: u16 = 5353;

/// One service advertisement as it travels on the wire. The instance
/// name is escape-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub service: String,
    pub domain: String,
    pub instance_name: String,
    pub port: u16,
    pub txt: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("instance name conflict: {0}")]
    NameConflict(String),
    #[error("discovery transport error: {0}")]
    Io(String),
}

#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Announce the advertisement in its domain.
    async fn register(&self, ad: &Advertisement) -> Result<(), DiscoveryError>;

    async fn unregister(&self, domain: &str, instance_name: &str) -> Result<(), DiscoveryError>;

    /// Whether the instance is still announced in the domain.
    async fn verify(&self, domain: &str, instance_name: &str) -> Result<bool, DiscoveryError>;

    /// Collect advertisements from a domain for up to `timeout`.
    async fn browse(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> Result<Vec<Advertisement>, DiscoveryError>;
}

/// UDP multicast transport speaking a simplified JSON record protocol on
/// the standard mDNS group. Not full RFC 6762; enough for clawdbot peers
/// to find each other on a LAN.
pub struct UdpMulticastTransport {
    bind_addr: String,
}

impl UdpMulticastTransport {
    pub fn new() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{MDNS_PORT}"),
        }
    }

    pub fn with_bind_addr(addr: impl Into<String>) -> Self {
        Self {
            bind_addr: addr.into(),
        }
    }

    async fn announce(&self, ad: &Advertisement) -> Result<(), DiscoveryError> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| DiscoveryError::Io(format!("bind: {e}")))?;
        let payload =
            serde_json::to_vec(ad).map_err(|e| DiscoveryError::Io(format!("encode: {e}")))?;
        socket
            .send_to(&payload, format!("{MDNS_MULTICAST_ADDR}:{MDNS_PORT}"))
            .await
            .map_err(|e| DiscoveryError::Io(format!("send: {e}")))?;
        Ok(())
    }
}

impl Default for UdpMulticastTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryTransport for UdpMulticastTransport {
    async fn register(&self, ad: &Advertisement) -> Result<(), DiscoveryError> {
        self.announce(ad).await
    }

    async fn unregister(&self, _domain: &str, _instance_name: &str) -> Result<(), DiscoveryError> {
        // Announce-based protocol: records age out at the receivers.
        Ok(())
    }

    async fn verify(&self, _domain: &str, _instance_name: &str) -> Result<bool, DiscoveryError> {
        // Announcements are fire-and-forget; the watchdog re-registers
        // on every verify pass.
        Ok(false)
    }

    async fn browse(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> Result<Vec<Advertisement>, DiscoveryError> {
        let socket = tokio::net::UdpSocket::bind(&self.bind_addr)
            .await
            .map_err(|e| DiscoveryError::Io(format!("bind {}: {e}", self.bind_addr)))?;
        let group: Ipv4Addr = MDNS_MULTICAST_ADDR.parse().expect("multicast addr");
        socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| DiscoveryError::Io(format!("join multicast: {e}")))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; 4096];
        let mut found = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _peer))) => {
                    if let Ok(ad) = serde_json::from_slice::<Advertisement>(&buf[..len]) {
                        if ad.service == SERVICE_TYPE && ad.domain == domain {
                            found.push(ad);
                        }
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
        Ok(found)
    }
}
