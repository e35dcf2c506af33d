//! Leader-following request router for one worker slot.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;
use snowfleet_coord::{CoordinationRegistry, Error as CoordError, WatchEvent};
use snowfleet_tonic_core::{Result as WireResult, SnowflakeId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    error::{Error, Result},
    registry::RouterMap,
    rpc::{Connector, IdRpc},
};

/// Tunables of a [`FailoverRouter`].
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Root of the slot directories in the coordination service.
    pub root_path: String,
    /// Interval between pings of a healthy endpoint.
    pub ping_interval: Duration,
    /// Interval between redials of a suspect endpoint.
    pub retry_interval: Duration,
    /// Back-off after a failed coordination read.
    pub node_retry_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            root_path: "/snowfleet-servers".to_string(),
            ping_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            node_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of a router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterPhase {
    /// Created, watch task not started.
    Unbound,
    /// Watching the slot, no leader resolved yet.
    Watching,
    /// Routing to the leader's endpoints.
    Ready,
    /// The slot has no registrations; calls fail with [`Error::NoRoute`].
    Degraded,
    Closed,
}

/// An immutable snapshot of where calls go.
#[derive(Debug)]
pub struct RouteTable {
    phase: RouterPhase,
    leader: Option<String>,
    connections: Vec<Arc<Connection>>,
    fallback: Vec<Arc<Connection>>,
}

impl RouteTable {
    fn empty(phase: RouterPhase) -> Self {
        Self {
            phase,
            leader: None,
            connections: Vec::new(),
            fallback: Vec::new(),
        }
    }

    pub fn phase(&self) -> RouterPhase {
        self.phase
    }

    /// Name of the leader's registration node.
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    /// Connections of a previous leader, used only while none of
    /// [`RouteTable::connections`] is healthy. Empty once the new leader is
    /// reachable.
    pub fn fallback(&self) -> &[Arc<Connection>] {
        &self.fallback
    }

    /// The set calls are currently served from, if any of it is healthy.
    fn live_set(&self) -> Option<&[Arc<Connection>]> {
        [&self.connections, &self.fallback]
            .into_iter()
            .find(|set| set.iter().any(|conn| conn.is_healthy()))
            .map(Vec::as_slice)
    }

    fn close_connections(&self) {
        self.close_connections_except(&[]);
    }

    fn close_connections_except(&self, keep: &[Arc<Connection>]) {
        for conn in self.connections.iter().chain(&self.fallback) {
            if !keep.iter().any(|k| Arc::ptr_eq(k, conn)) {
                conn.close();
            }
        }
    }
}

struct Shared {
    worker_id: u64,
    config: RouterConfig,
    registry: Arc<CoordinationRegistry>,
    connector: Arc<dyn Connector>,
    routes: watch::Sender<Arc<RouteTable>>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Publishes `table` unless the router was closed meanwhile. Returns the
    /// table it replaced.
    fn publish(&self, table: RouteTable) -> Option<Arc<RouteTable>> {
        let table = Arc::new(table);
        let mut previous = None;
        let published = self.routes.send_if_modified(|current| {
            if current.phase == RouterPhase::Closed {
                return false;
            }
            previous = Some(std::mem::replace(current, Arc::clone(&table)));
            true
        });
        if !published {
            table.close_connections();
        }
        previous
    }

    fn current(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes.borrow())
    }
}

/// Routes ID requests for one worker slot to its current leader.
///
/// A background task watches `<root>/<worker_id>`: whenever the leader
/// changes it opens connections to the new leader's RPC endpoints, publishes
/// them, and only then closes the previous set. If none of the new endpoints
/// could be dialed, the previous set stays routable as a fallback until one of
/// them comes up, so a hand-over never leaves the router without a route.
/// Each call picks a random healthy endpoint and moves on to another one on
/// transport failure.
pub struct FailoverRouter {
    shared: Arc<Shared>,
    owner: Option<Weak<RouterMap>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FailoverRouter {
    /// Creates an unbound router. Call [`FailoverRouter::bind`] to start it.
    pub fn new(
        registry: Arc<CoordinationRegistry>,
        connector: Arc<dyn Connector>,
        worker_id: u64,
        config: RouterConfig,
    ) -> Self {
        Self::with_owner(registry, connector, worker_id, config, None)
    }

    pub(crate) fn with_owner(
        registry: Arc<CoordinationRegistry>,
        connector: Arc<dyn Connector>,
        worker_id: u64,
        config: RouterConfig,
        owner: Option<Weak<RouterMap>>,
    ) -> Self {
        let (routes, _) = watch::channel(Arc::new(RouteTable::empty(RouterPhase::Unbound)));
        Self {
            shared: Arc::new(Shared {
                worker_id,
                config,
                registry,
                connector,
                routes,
                shutdown: CancellationToken::new(),
            }),
            owner,
            task: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.shared.worker_id
    }

    /// Starts following the slot. Binding an already bound router is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`Error::RouterClosed`] if the router was closed.
    pub fn bind(&self) -> Result<()> {
        let mut task = self.task.lock();
        let started = self.shared.routes.send_if_modified(|current| {
            if current.phase != RouterPhase::Unbound {
                return false;
            }
            *current = Arc::new(RouteTable::empty(RouterPhase::Watching));
            true
        });
        if !started {
            return match self.phase() {
                RouterPhase::Closed => Err(Error::RouterClosed {
                    worker_id: self.worker_id(),
                }),
                _ => Ok(()),
            };
        }
        info!(worker_id = self.worker_id(), "router bound");
        *task = Some(tokio::spawn(follow_slot(Arc::clone(&self.shared))));
        Ok(())
    }

    pub fn phase(&self) -> RouterPhase {
        self.shared.current().phase
    }

    /// The current route snapshot.
    pub fn routes(&self) -> Arc<RouteTable> {
        self.shared.current()
    }

    /// Subscribes to route changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.shared.routes.subscribe()
    }

    /// Waits until the router is [`RouterPhase::Ready`].
    ///
    /// # Errors
    ///
    /// [`Error::RouterClosed`] if the router is closed while waiting,
    /// [`Error::NoRoute`] if it is not ready within `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut routes = self.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            routes.wait_for(|t| matches!(t.phase, RouterPhase::Ready | RouterPhase::Closed)),
        )
        .await;
        let phase = match waited {
            Ok(Ok(table)) => table.phase,
            Ok(Err(_)) => RouterPhase::Closed,
            Err(_) => {
                return Err(Error::NoRoute {
                    worker_id: self.worker_id(),
                });
            }
        };
        match phase {
            RouterPhase::Ready => Ok(()),
            _ => Err(Error::RouterClosed {
                worker_id: self.worker_id(),
            }),
        }
    }

    /// Fetches one ID from the slot leader.
    pub async fn next_id(&self) -> Result<SnowflakeId> {
        let worker_id = self.worker_id();
        let id = self
            .call(move |client| async move { client.next_id(worker_id).await })
            .await?;
        Ok(SnowflakeId::from_raw(id as u64))
    }

    /// Fetches `count` IDs from the slot leader in one call.
    pub async fn next_ids(&self, count: usize) -> Result<Vec<SnowflakeId>> {
        let worker_id = self.worker_id();
        let ids = self
            .call(move |client| async move { client.next_ids(worker_id, count).await })
            .await?;
        Ok(ids
            .into_iter()
            .map(|id| SnowflakeId::from_raw(id as u64))
            .collect())
    }

    async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn IdRpc>) -> Fut,
        Fut: Future<Output = WireResult<T>>,
    {
        let table = self.shared.current();
        if table.phase == RouterPhase::Closed {
            return Err(Error::RouterClosed {
                worker_id: self.worker_id(),
            });
        }

        for tier in [&table.connections, &table.fallback] {
            let mut candidates: Vec<Arc<Connection>> = tier
                .iter()
                .filter(|conn| conn.is_healthy())
                .cloned()
                .collect();
            while !candidates.is_empty() {
                let pick = match candidates.len() {
                    1 => 0,
                    len => rand::rng().random_range(0..len),
                };
                let conn = candidates.swap_remove(pick);
                let Some(client) = conn.client() else {
                    continue;
                };
                match f(client).await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_transport() => {
                        warn!(addr = %conn.addr(), error = %e, "call failed, trying another endpoint");
                        conn.mark_suspect();
                    }
                    Err(e) => return Err(Error::Remote(e)),
                }
            }
        }
        Err(Error::NoRoute {
            worker_id: self.worker_id(),
        })
    }

    /// Stops the watch and health tasks, drops all connections and removes
    /// the router from its [`RouterRegistry`](crate::RouterRegistry). Later
    /// calls fail with [`Error::RouterClosed`].
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        let previous = self
            .shared
            .routes
            .send_replace(Arc::new(RouteTable::empty(RouterPhase::Closed)));
        previous.close_connections();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if let Some(map) = self.owner.as_ref().and_then(Weak::upgrade) {
            let mut routers = map.lock();
            if routers
                .get(&self.worker_id())
                .is_some_and(|r| Arc::ptr_eq(&r.shared, &self.shared))
            {
                routers.remove(&self.worker_id());
            }
        }
        if previous.phase != RouterPhase::Closed {
            info!(worker_id = self.worker_id(), "router closed");
        }
    }
}

impl Drop for FailoverRouter {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.current().close_connections();
    }
}

impl fmt::Debug for FailoverRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.shared.current();
        f.debug_struct("FailoverRouter")
            .field("worker_id", &self.shared.worker_id)
            .field("phase", &table.phase)
            .field("leader", &table.leader)
            .finish()
    }
}

/// Sleeps unless shut down first. Returns `false` on shutdown.
async fn pause(shutdown: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}

/// The watch task: keeps the published route table in line with the slot's
/// registrations until shutdown.
async fn follow_slot(shared: Arc<Shared>) {
    let worker_id = shared.worker_id;
    let root = shared.config.root_path.clone();
    let shutdown = shared.shutdown.clone();

    while !shutdown.is_cancelled() {
        let (children, mut watch) = match shared.registry.watch_slot(&root, worker_id).await {
            Ok(found) => found,
            Err(CoordError::NoNode { .. }) => {
                // The slot directory does not exist yet: nobody ever served it.
                degrade(&shared);
                if !pause(&shutdown, shared.config.node_retry_delay).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(worker_id, error = %e, "failed to watch slot, retrying");
                if !pause(&shutdown, shared.config.node_retry_delay).await {
                    break;
                }
                continue;
            }
        };

        let current = shared.current();
        match children.first() {
            None => degrade(&shared),
            Some(leader) if current.leader.as_deref() == Some(leader.as_str()) => {
                debug!(worker_id, standbys = children.len() - 1, "standby set changed");
            }
            Some(leader) => match shared.registry.peer_record(&root, worker_id, leader).await {
                Ok(record) => {
                    let mut connections = Vec::with_capacity(record.rpc_endpoints.len());
                    for addr in record.rpc_endpoints {
                        connections.push(
                            Connection::open(
                                addr,
                                Arc::clone(&shared.connector),
                                shared.config.ping_interval,
                                shared.config.retry_interval,
                                shutdown.child_token(),
                            )
                            .await,
                        );
                    }
                    if connections.is_empty() {
                        warn!(worker_id, %leader, "leader advertises no rpc endpoints");
                    }
                    let fallback = match current.live_set() {
                        Some(live) if !connections.iter().any(|c| c.is_healthy()) => {
                            warn!(
                                worker_id,
                                %leader,
                                "new leader unreachable, keeping previous endpoints as fallback"
                            );
                            live.to_vec()
                        }
                        _ => Vec::new(),
                    };
                    info!(worker_id, %leader, "routing to new slot leader");
                    let table = RouteTable {
                        phase: RouterPhase::Ready,
                        leader: Some(leader.clone()),
                        connections,
                        fallback,
                    };
                    let kept = table.fallback.clone();
                    if let Some(previous) = shared.publish(table) {
                        previous.close_connections_except(&kept);
                    }
                }
                Err(CoordError::NoNode { .. }) => {
                    // The leader left between listing and reading; re-list.
                    continue;
                }
                Err(e) => {
                    warn!(worker_id, %leader, error = %e, "failed to read leader record, retrying");
                    if !pause(&shutdown, shared.config.node_retry_delay).await {
                        break;
                    }
                    continue;
                }
            },
        }

        let event = loop {
            let pending = shared.current();
            if pending.fallback.is_empty() {
                tokio::select! {
                    () = shutdown.cancelled() => break None,
                    event = &mut watch => break Some(event),
                }
            } else {
                tokio::select! {
                    () = shutdown.cancelled() => break None,
                    event = &mut watch => break Some(event),
                    () = wait_live(&pending, shared.config.retry_interval) => {
                        retire_fallback(&shared, &pending);
                    }
                }
            }
        };
        let Some(event) = event else {
            break;
        };
        if event == WatchEvent::SessionClosed
            && !pause(&shutdown, shared.config.node_retry_delay).await
        {
            break;
        }
    }
    debug!(worker_id, "slot watch stopped");
}

/// Resolves once one of the leader's own connections is healthy.
async fn wait_live(table: &RouteTable, interval: Duration) {
    while !table.connections.iter().any(|conn| conn.is_healthy()) {
        tokio::time::sleep(interval).await;
    }
}

/// Drops the fallback of `pending` if it is still the published table.
fn retire_fallback(shared: &Shared, pending: &Arc<RouteTable>) {
    let retired = shared.routes.send_if_modified(|current| {
        if !Arc::ptr_eq(current, pending) {
            return false;
        }
        *current = Arc::new(RouteTable {
            phase: pending.phase,
            leader: pending.leader.clone(),
            connections: pending.connections.clone(),
            fallback: Vec::new(),
        });
        true
    });
    if retired {
        info!(
            worker_id = shared.worker_id,
            leader = ?pending.leader,
            "slot leader reachable, closing fallback endpoints"
        );
        pending.close_connections_except(&pending.connections);
    }
}

fn degrade(shared: &Shared) {
    let current = shared.current();
    if current.phase == RouterPhase::Degraded {
        return;
    }
    warn!(worker_id = shared.worker_id, "slot has no registrations, router degraded");
    if let Some(previous) = shared.publish(RouteTable::empty(RouterPhase::Degraded)) {
        previous.close_connections();
    }
}

#[cfg(test)]
mod tests;
