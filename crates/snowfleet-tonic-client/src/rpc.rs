//! The RPC surface the router and the startup sanity check talk to.
//!
//! [`IdRpc`] and [`Connector`] abstract one connected server and the act of
//! dialing it, so both can be replaced by in-process doubles.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snowfleet_tonic_core::{
    Error as WireError, Result as WireResult, endpoint_uri,
    proto::{
        DatacenterIdRequest, NextIdRequest, NextIdsRequest, PingRequest, TimestampRequest,
        snowflake_client::SnowflakeClient,
    },
};
use tonic::transport::{Channel, Endpoint};

use crate::error::{Error, Result};

/// A connected ID server.
#[async_trait]
pub trait IdRpc: Send + Sync {
    async fn next_id(&self, worker_id: u64) -> WireResult<i64>;

    async fn next_ids(&self, worker_id: u64, count: usize) -> WireResult<Vec<i64>>;

    async fn datacenter_id(&self) -> WireResult<u64>;

    /// The server's wall clock in seconds since the Unix epoch.
    async fn timestamp(&self) -> WireResult<u64>;

    async fn ping(&self) -> WireResult<()>;
}

/// Dials ID servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `addr` (`host:port` or a full URI).
    async fn connect(&self, addr: &str) -> WireResult<Arc<dyn IdRpc>>;
}

/// [`Connector`] over tonic channels.
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl GrpcConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Opens a channel to `addr`.
    pub async fn dial(&self, addr: &str) -> Result<GrpcIdClient> {
        let connect_err = |reason: String| Error::Connect {
            addr: addr.to_string(),
            reason,
        };
        let channel = Endpoint::from_shared(endpoint_uri(addr))
            .map_err(|e| connect_err(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .connect()
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        Ok(GrpcIdClient::new(channel))
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, addr: &str) -> WireResult<Arc<dyn IdRpc>> {
        match self.dial(addr).await {
            Ok(client) => Ok(Arc::new(client)),
            Err(e) => Err(WireError::Transport {
                reason: e.to_string(),
            }),
        }
    }
}

/// [`IdRpc`] over a tonic channel.
#[derive(Clone, Debug)]
pub struct GrpcIdClient {
    inner: SnowflakeClient<Channel>,
}

impl GrpcIdClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: SnowflakeClient::new(channel),
        }
    }
}

fn wire_worker_id(worker_id: u64) -> WireResult<i64> {
    i64::try_from(worker_id).map_err(|_| WireError::InvalidRequest {
        reason: format!("worker id {worker_id} out of range"),
    })
}

fn non_negative(value: i64, what: &str) -> WireResult<u64> {
    u64::try_from(value).map_err(|_| WireError::Internal {
        reason: format!("server returned negative {what}: {value}"),
    })
}

#[async_trait]
impl IdRpc for GrpcIdClient {
    async fn next_id(&self, worker_id: u64) -> WireResult<i64> {
        let request = NextIdRequest {
            worker_id: wire_worker_id(worker_id)?,
        };
        Ok(self.inner.clone().next_id(request).await?.into_inner().id)
    }

    async fn next_ids(&self, worker_id: u64, count: usize) -> WireResult<Vec<i64>> {
        let count = i32::try_from(count).map_err(|_| WireError::InvalidRequest {
            reason: format!("batch size {count} out of range"),
        })?;
        let request = NextIdsRequest {
            worker_id: wire_worker_id(worker_id)?,
            count,
        };
        Ok(self.inner.clone().next_ids(request).await?.into_inner().ids)
    }

    async fn datacenter_id(&self) -> WireResult<u64> {
        let resp = self
            .inner
            .clone()
            .datacenter_id(DatacenterIdRequest {})
            .await?
            .into_inner();
        non_negative(resp.datacenter_id, "datacenter id")
    }

    async fn timestamp(&self) -> WireResult<u64> {
        let resp = self
            .inner
            .clone()
            .timestamp(TimestampRequest {})
            .await?
            .into_inner();
        non_negative(resp.timestamp, "timestamp")
    }

    async fn ping(&self) -> WireResult<()> {
        self.inner.clone().ping(PingRequest {}).await?;
        Ok(())
    }
}
