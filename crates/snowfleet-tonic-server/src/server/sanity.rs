//! Startup check of the fleet this node is about to join.

use std::{sync::Arc, time::Duration};

use snowfleet_coord::{CoordinationRegistry, PeerRecord};
use snowfleet_tonic_client::Connector;
use snowfleet_tonic_core::snowfleet::unix_seconds;
use tracing::{debug, info};

use crate::server::error::{Error, Result};

/// Largest tolerated distance between the local clock and the peer mean.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(10);

/// Asks every registered peer for its datacenter and clock before the node
/// registers itself.
pub struct ClusterSanityChecker<'a> {
    registry: &'a CoordinationRegistry,
    connector: Arc<dyn Connector>,
    root_path: &'a str,
    datacenter_id: u64,
    max_skew: Duration,
}

struct PeerReport {
    addr: String,
    datacenter_id: u64,
    timestamp: u64,
}

impl<'a> ClusterSanityChecker<'a> {
    pub fn new(
        registry: &'a CoordinationRegistry,
        connector: Arc<dyn Connector>,
        root_path: &'a str,
        datacenter_id: u64,
    ) -> Self {
        Self {
            registry,
            connector,
            root_path,
            datacenter_id,
            max_skew: MAX_CLOCK_SKEW,
        }
    }

    /// Dials the primary endpoint of every live peer and compares its
    /// datacenter id and wall clock with ours. An empty fleet passes.
    ///
    /// # Errors
    ///
    /// - [`Error::PeerUnreachable`] on the first peer that cannot be dialed or
    ///   queried, or that advertises no endpoint.
    /// - [`Error::DatacenterMismatch`] if a peer serves another datacenter.
    /// - [`Error::ClockSkew`] if the local clock is more than
    ///   [`MAX_CLOCK_SKEW`] away from the mean of the peer clocks.
    pub async fn check_peers(&self) -> Result<()> {
        let peers = self.registry.peers(self.root_path).await?;

        let mut reports = Vec::new();
        for (worker_id, records) in &peers {
            for (child, record) in records {
                reports.push(self.probe(*worker_id, child, record).await?);
            }
        }
        if reports.is_empty() {
            info!("no peers registered, skipping sanity check");
            return Ok(());
        }

        for report in &reports {
            if report.datacenter_id != self.datacenter_id {
                return Err(Error::DatacenterMismatch {
                    addr: report.addr.clone(),
                    local: self.datacenter_id,
                    remote: report.datacenter_id,
                });
            }
        }

        let sum: u128 = reports.iter().map(|r| u128::from(r.timestamp)).sum();
        let mean = (sum / reports.len() as u128) as u64;
        let local = unix_seconds();
        if local.abs_diff(mean) > self.max_skew.as_secs() {
            return Err(Error::ClockSkew {
                local,
                mean,
                max_skew_secs: self.max_skew.as_secs(),
            });
        }

        info!(peers = reports.len(), mean, local, "fleet sanity check passed");
        Ok(())
    }

    async fn probe(&self, worker_id: u64, child: &str, record: &PeerRecord) -> Result<PeerReport> {
        let Some(addr) = record.primary_endpoint() else {
            return Err(Error::PeerUnreachable {
                worker_id,
                addr: child.to_string(),
                reason: "peer advertises no rpc endpoint".to_string(),
            });
        };
        let unreachable = |e: snowfleet_tonic_core::Error| Error::PeerUnreachable {
            worker_id,
            addr: addr.to_string(),
            reason: e.to_string(),
        };

        let client = self.connector.connect(addr).await.map_err(unreachable)?;
        let datacenter_id = client.datacenter_id().await.map_err(unreachable)?;
        let timestamp = client.timestamp().await.map_err(unreachable)?;
        debug!(worker_id, %addr, datacenter_id, timestamp, "probed peer");

        Ok(PeerReport {
            addr: addr.to_string(),
            datacenter_id,
            timestamp,
        })
    }
}
