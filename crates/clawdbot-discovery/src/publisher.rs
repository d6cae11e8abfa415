//! Beacon publisher: advertise the gateway on `local.` (and, when
//! enabled, `clawdbot.internal.`), resolve instance-name conflicts, and
//! re-register from a watchdog.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::transport::{Advertisement, DiscoveryError, DiscoveryTransport};
use crate::txt::{encode_dns_escapes, Beacon, LOCAL_DOMAIN, SERVICE_TYPE, WIDE_AREA_DOMAIN};

const MAX_NAME_ATTEMPTS: u32 = 10;

pub struct BeaconPublisher {
    transport: Arc<dyn DiscoveryTransport>,
    beacon: Beacon,
    domains: Vec<String>,
    port: u16,
    watchdog_interval: Duration,
    conflict_backoff: Duration,
    cancel: CancellationToken,
    current_name: Mutex<String>,
}

impl BeaconPublisher {
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        beacon: Beacon,
        port: u16,
        wide_area: bool,
        cancel: CancellationToken,
    ) -> Self {
        let mut domains = vec![LOCAL_DOMAIN.to_string()];
        if wide_area {
            domains.push(WIDE_AREA_DOMAIN.to_string());
        }
        let current_name = Mutex::new(beacon.instance_name.clone());
        Self {
            transport,
            beacon,
            domains,
            port,
            watchdog_interval: Duration::from_secs(30),
            conflict_backoff: Duration::from_millis(500),
            cancel,
            current_name,
        }
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    /// The instance name currently announced (post conflict resolution).
    pub fn instance_name(&self) -> String {
        self.current_name.lock().expect("publisher name").clone()
    }

    fn advertisement(&self, domain: &str, name: &str) -> Advertisement {
        let mut beacon = self.beacon.clone();
        beacon.instance_name = name.to_string();
        Advertisement {
            service: SERVICE_TYPE.into(),
            domain: domain.to_string(),
            instance_name: encode_dns_escapes(name),
            port: self.port,
            txt: beacon.to_txt(),
        }
    }

    /// Register in every configured domain. A name conflict backs off
    /// softly, then retries with `(N)` appended.
    pub async fn register_all(&self) -> Result<()> {
        let base = self.beacon.instance_name.clone();
        let mut name = self.instance_name();

        for attempt in 1..=MAX_NAME_ATTEMPTS {
            match self.register_domains(&name).await {
                Ok(()) => {
                    *self.current_name.lock().expect("publisher name") = name;
                    return Ok(());
                }
                Err(DiscoveryError::NameConflict(taken)) => {
                    tracing::info!("instance name {taken} taken; retrying with suffix");
                    tokio::time::sleep(self.conflict_backoff).await;
                    name = format!("{base} ({})", attempt + 1);
                }
                Err(err) => return Err(anyhow!(err)),
            }
        }
        Err(anyhow!(
            "could not claim an instance name after {MAX_NAME_ATTEMPTS} attempts"
        ))
    }

    async fn register_domains(&self, name: &str) -> Result<(), DiscoveryError> {
        for domain in &self.domains {
            self.transport
                .register(&self.advertisement(domain, name))
                .await?;
        }
        Ok(())
    }

    /// Register, then re-verify every watchdog interval and re-register
    /// on failure, until cancelled.
    pub async fn run(self: Arc<Self>) {
        if let Err(err) = self.register_all().await {
            tracing::warn!("initial discovery registration failed: {err:#}");
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let name = self.instance_name();
                    for domain in &self.domains {
                        let _ = self.transport.unregister(domain, &name).await;
                    }
                    return;
                }
                _ = tokio::time::sleep(self.watchdog_interval) => {}
            }

            let name = self.instance_name();
            for domain in &self.domains {
                let announced = self
                    .transport
                    .verify(domain, &name)
                    .await
                    .unwrap_or(false);
                if !announced {
                    tracing::debug!(%domain, "beacon missing; re-registering");
                    if let Err(err) = self
                        .transport
                        .register(&self.advertisement(domain, &name))
                        .await
                    {
                        tracing::warn!(%domain, "re-register failed: {err}");
                    }
                }
            }
        }
    }
}
