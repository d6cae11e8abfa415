//! Beacon browser: concurrent browse across `local.` and the wide-area
//! domain, deduplicated by instance name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::transport::DiscoveryTransport;
use crate::txt::{Beacon, LOCAL_DOMAIN, WIDE_AREA_DOMAIN};

pub struct BeaconBrowser {
    transport: Arc<dyn DiscoveryTransport>,
    domains: Vec<String>,
}

impl BeaconBrowser {
    pub fn new(transport: Arc<dyn DiscoveryTransport>, wide_area: bool) -> Self {
        let mut domains = vec![LOCAL_DOMAIN.to_string()];
        if wide_area {
            domains.push(WIDE_AREA_DOMAIN.to_string());
        }
        Self { transport, domains }
    }

    /// One browse pass over every domain. Duplicate instance names keep
    /// the freshest advertisement (later arrival wins).
    pub async fn browse_once(&self, timeout: Duration) -> Vec<Beacon> {
        let browses = self
            .domains
            .iter()
            .map(|domain| {
                let transport = self.transport.clone();
                let domain = domain.clone();
                async move {
                    match transport.browse(&domain, timeout).await {
                        Ok(ads) => ads,
                        Err(err) => {
                            tracing::warn!(%domain, "browse failed: {err}");
                            Vec::new()
                        }
                    }
                }
            })
            .collect::<Vec<_>>();

        let mut by_name: HashMap<String, Beacon> = HashMap::new();
        for ads in join_all(browses).await {
            for ad in ads {
                let beacon = Beacon::from_txt(&ad.instance_name, &ad.txt);
                by_name.insert(beacon.instance_name.clone(), beacon);
            }
        }

        let mut beacons: Vec<_> = by_name.into_values().collect();
        beacons.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        beacons
    }
}
