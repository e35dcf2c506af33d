use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::{Connector, IdRpc};

/// Health of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Ok,
    /// The last dial, ping or call failed; the health task keeps redialing.
    Suspect,
}

/// One endpoint of the slot leader, kept alive by a background health task.
///
/// While [`Health::Ok`] the task pings every `ping_interval`; a failed ping
/// (or a failed call reported through [`Connection::mark_suspect`]) makes the
/// connection [`Health::Suspect`] and the task redials every
/// `retry_interval` until it succeeds or the connection is closed.
pub struct Connection {
    addr: String,
    client: RwLock<Option<Arc<dyn IdRpc>>>,
    healthy: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    /// Dials `addr` and starts the health task. A failed dial still yields a
    /// connection, starting out [`Health::Suspect`].
    pub(crate) async fn open(
        addr: String,
        connector: Arc<dyn Connector>,
        ping_interval: Duration,
        retry_interval: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let client = match connector.connect(&addr).await {
            Ok(client) => {
                debug!(%addr, "connected");
                Some(client)
            }
            Err(e) => {
                warn!(%addr, error = %e, "initial dial failed, will retry");
                None
            }
        };
        let conn = Arc::new(Self {
            addr,
            healthy: AtomicBool::new(client.is_some()),
            client: RwLock::new(client),
            shutdown,
        });
        tokio::spawn(health_check(
            Arc::clone(&conn),
            connector,
            ping_interval,
            retry_interval,
        ));
        conn
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn health(&self) -> Health {
        if self.healthy.load(Ordering::Acquire) {
            Health::Ok
        } else {
            Health::Suspect
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Ok
    }

    /// The client, if the connection is healthy.
    pub fn client(&self) -> Option<Arc<dyn IdRpc>> {
        if !self.is_healthy() {
            return None;
        }
        self.client.read().clone()
    }

    pub fn mark_suspect(&self) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!(addr = %self.addr, "endpoint marked suspect");
        }
    }

    /// Stops the health task and drops the client.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.healthy.store(false, Ordering::Release);
        self.client.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("health", &self.health())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Sleeps for `period` unless `shutdown` fires first. Returns `false` on
/// shutdown.
async fn pause(shutdown: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}

async fn health_check(
    conn: Arc<Connection>,
    connector: Arc<dyn Connector>,
    ping_interval: Duration,
    retry_interval: Duration,
) {
    let shutdown = conn.shutdown.clone();
    loop {
        if conn.is_healthy() {
            if !pause(&shutdown, ping_interval).await {
                break;
            }
            let Some(client) = conn.client() else {
                continue;
            };
            let result = tokio::select! {
                () = shutdown.cancelled() => break,
                result = client.ping() => result,
            };
            if let Err(e) = result {
                warn!(addr = %conn.addr, error = %e, "ping failed");
                conn.mark_suspect();
            }
        } else {
            if !pause(&shutdown, retry_interval).await {
                break;
            }
            let result = tokio::select! {
                () = shutdown.cancelled() => break,
                result = connector.connect(&conn.addr) => result,
            };
            match result {
                Ok(_) if shutdown.is_cancelled() => break,
                Ok(client) => {
                    *conn.client.write() = Some(client);
                    conn.healthy.store(true, Ordering::Release);
                    info!(addr = %conn.addr, "endpoint recovered");
                }
                Err(e) => debug!(addr = %conn.addr, error = %e, "redial failed"),
            }
        }
    }
    debug!(addr = %conn.addr, "health task stopped");
}
