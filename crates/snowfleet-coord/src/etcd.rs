//! etcd coordination backend.
//!
//! etcd has a flat key space, so the node tree is mapped onto keys:
//!
//! - a node at `/a/b` is the key `/a/b`; directories are keys with an empty
//!   value,
//! - the session is a lease kept alive by a background task, and ephemeral
//!   nodes are keys attached to that lease,
//! - sequential suffixes come from a counter key per parent, bumped with a
//!   compare-and-swap transaction together with the node itself,
//! - child watches are prefix watches on `<path>/`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    coordinator::{
        CreateMode, Coordinator, SEQUENCE_WIDTH, SessionEvent, Watch, WatchEvent, is_valid_path,
        parent_path,
    },
    error::{Error, Result},
};

/// Prefix of the per-parent sequence counters. Kept outside every node path
/// so counters never show up as children.
const SEQUENCE_PREFIX: &str = "\u{0}snowfleet-seq";
const SESSION_EVENTS_CAPACITY: usize = 16;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for [`EtcdCoordinator`].
#[derive(Clone, Debug)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Lease TTL. Ephemeral nodes vanish at most this long after the
    /// process dies.
    pub session_ttl: Duration,
    pub connect_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            session_ttl: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

struct Session {
    lease: AtomicI64,
    connected: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    fn new(lease: i64) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENTS_CAPACITY);
        Self {
            lease: AtomicI64::new(lease),
            connected: AtomicBool::new(true),
            events,
        }
    }

    fn lease(&self) -> i64 {
        self.lease.load(Ordering::SeqCst)
    }

    /// The lease was refreshed. Reports a reconnect after a failed refresh.
    fn refreshed(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!(lease = self.lease(), "etcd keep-alive recovered");
            let _ = self.events.send(SessionEvent::Connected);
        }
    }

    fn refresh_failed(&self, err: &etcd_client::Error) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(lease = self.lease(), error = %err, "etcd keep-alive failed");
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    fn expired(&self) {
        self.connected.store(false, Ordering::SeqCst);
        tracing::warn!(lease = self.lease(), "etcd lease expired");
        let _ = self.events.send(SessionEvent::Expired);
    }

    fn renewed(&self, lease: i64) {
        self.lease.store(lease, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(lease, "etcd session renewed");
        let _ = self.events.send(SessionEvent::Connected);
    }
}

/// A [`Coordinator`] backed by an etcd cluster.
pub struct EtcdCoordinator {
    client: Client,
    session: Arc<Session>,
    shutdown: CancellationToken,
}

impl EtcdCoordinator {
    /// Connects, grants the session lease and starts keeping it alive.
    pub async fn connect(config: EtcdConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout)
            .with_timeout(config.connect_timeout);
        let mut client = Client::connect(&config.endpoints, Some(options)).await?;

        let ttl = config.session_ttl.as_secs().max(1) as i64;
        let lease = client.lease_grant(ttl, None).await?.id();
        tracing::info!(lease, ttl, endpoints = ?config.endpoints, "etcd session established");

        let session = Arc::new(Session::new(lease));
        let shutdown = CancellationToken::new();
        tokio::spawn(keep_alive(
            client.clone(),
            Arc::clone(&session),
            ttl,
            shutdown.child_token(),
        ));

        Ok(Self {
            client,
            session,
            shutdown,
        })
    }

    fn lease(&self) -> i64 {
        self.session.lease()
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if key == "/" {
            return Ok(true);
        }
        let resp = self
            .client
            .clone()
            .get(key, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    /// Creates `path` only if absent.
    async fn put_if_absent(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let options = mode
            .is_ephemeral()
            .then(|| PutOptions::new().with_lease(self.lease()));
        let txn = Txn::new()
            .when([Compare::version(path, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(path, data, options)]);
        let resp = self.client.clone().txn(txn).await?;
        if resp.succeeded() {
            Ok(path.to_string())
        } else {
            Err(Error::NodeExists {
                path: path.to_string(),
            })
        }
    }

    /// Bumps the parent's counter and creates the node in one transaction,
    /// retrying when another client raced us.
    async fn put_sequential(&self, prefix: &str, parent: &str, data: &[u8]) -> Result<String> {
        let counter_key = format!("{SEQUENCE_PREFIX}{parent}");
        loop {
            let resp = self.client.clone().get(counter_key.as_str(), None).await?;
            let (version, next) = match resp.kvs().first() {
                Some(kv) => {
                    let value = kv.value_str().map_err(|e| Error::Backend(e.to_string()))?;
                    let next = value
                        .parse::<u64>()
                        .map_err(|e| Error::Backend(format!("bad counter {counter_key}: {e}")))?;
                    (kv.version(), next)
                }
                None => (0, 0),
            };

            let path = format!("{prefix}{next:0width$}", width = SEQUENCE_WIDTH);
            if !is_valid_path(&path) {
                return Err(Error::MalformedPath { path });
            }
            let txn = Txn::new()
                .when([
                    Compare::version(counter_key.as_str(), CompareOp::Equal, version),
                    Compare::version(path.as_str(), CompareOp::Equal, 0),
                ])
                .and_then([
                    TxnOp::put(counter_key.as_str(), (next + 1).to_string(), None),
                    TxnOp::put(
                        path.as_str(),
                        data,
                        Some(PutOptions::new().with_lease(self.lease())),
                    ),
                ]);
            if self.client.clone().txn(txn).await?.succeeded() {
                return Ok(path);
            }
            tracing::debug!(parent, "sequence counter raced, retrying");
        }
    }

    async fn child_names(&self, path: &str) -> Result<(Vec<String>, i64)> {
        let prefix = child_prefix(path);
        let resp = self
            .client
            .clone()
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let mut names = Vec::new();
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(|e| Error::Backend(e.to_string()))?;
            if let Some(name) = direct_child(&prefix, key) {
                names.push(name.to_string());
            }
        }
        Ok((names, revision))
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let parent = parent_path(path);
        if !self.exists(parent).await? {
            return Err(Error::NoNode {
                path: parent.to_string(),
            });
        }
        match mode {
            CreateMode::EphemeralSequential => self.put_sequential(path, parent, data).await,
            CreateMode::Persistent | CreateMode::Ephemeral => {
                if !is_valid_path(path) || path == "/" {
                    return Err(Error::MalformedPath {
                        path: path.to_string(),
                    });
                }
                self.put_if_absent(path, data, mode).await
            }
        }
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self.client.clone().get(path, None).await?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| Error::NoNode {
                path: path.to_string(),
            })
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        if !self.exists(path).await? {
            return Err(Error::NoNode {
                path: path.to_string(),
            });
        }
        Ok(self.child_names(path).await?.0)
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        if !self.exists(path).await? {
            return Err(Error::NoNode {
                path: path.to_string(),
            });
        }
        let (children, revision) = self.child_names(path).await?;
        let prefix = child_prefix(path);
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (watcher, mut stream) = self
            .client
            .clone()
            .watch(prefix.as_str(), Some(options))
            .await?;

        let watch = Watch::new(async move {
            // Dropping the watcher cancels the server-side watch.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            return WatchEvent::SessionClosed;
                        }
                        let changed = resp.events().iter().any(|event| {
                            matches!(event.event_type(), EventType::Put | EventType::Delete)
                                && event
                                    .kv()
                                    .and_then(|kv| kv.key_str().ok())
                                    .is_some_and(|key| direct_child(&prefix, key).is_some())
                        });
                        if changed {
                            return WatchEvent::ChildrenChanged;
                        }
                    }
                    Ok(None) | Err(_) => return WatchEvent::SessionClosed,
                }
            }
        });
        Ok((children, watch))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let (children, _) = self.child_names(path).await?;
        if !children.is_empty() {
            return Err(Error::Backend(format!("node {path} has children")));
        }
        let resp = self.client.clone().delete(path, None).await?;
        if resp.deleted() == 0 {
            return Err(Error::NoNode {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled() && self.session.connected.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> u64 {
        self.lease() as u64
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.session.connected.store(false, Ordering::SeqCst);
        self.client.clone().lease_revoke(self.lease()).await?;
        tracing::info!(lease = self.lease(), "etcd session closed");
        Ok(())
    }
}

impl Drop for EtcdCoordinator {
    fn drop(&mut self) {
        // The lease then expires on its own after its TTL.
        self.shutdown.cancel();
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn direct_child<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// Refreshes the session lease every third of its TTL. A failed refresh is
/// reported as `Disconnected` and the next acknowledged one as `Connected`. A
/// lease that expired anyway is replaced by a new one and reported as
/// `Expired` + `Connected`.
async fn keep_alive(client: Client, session: Arc<Session>, ttl: i64, shutdown: CancellationToken) {
    let interval = Duration::from_secs((ttl as u64 / 3).max(1));
    loop {
        let outcome = tokio::select! {
            () = shutdown.cancelled() => return,
            outcome = refresh(client.clone(), &session, interval, &shutdown) => outcome,
        };

        match outcome {
            Refresh::Cancelled => return,
            Refresh::Expired => {
                session.expired();
                match client.clone().lease_grant(ttl, None).await {
                    Ok(resp) => session.renewed(resp.id()),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to grant etcd lease");
                        tokio::select! {
                            () = shutdown.cancelled() => return,
                            () = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                }
            }
            Refresh::Failed(e) => {
                session.refresh_failed(&e);
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
}

enum Refresh {
    Cancelled,
    Expired,
    Failed(etcd_client::Error),
}

/// Runs one keep-alive stream until it breaks.
async fn refresh(
    mut client: Client,
    session: &Session,
    interval: Duration,
    shutdown: &CancellationToken,
) -> Refresh {
    let (mut keeper, mut stream) = match client.lease_keep_alive(session.lease()).await {
        Ok(pair) => pair,
        Err(e) => return Refresh::Failed(e),
    };
    loop {
        if let Err(e) = keeper.keep_alive().await {
            return Refresh::Failed(e);
        }
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() <= 0 => return Refresh::Expired,
            Ok(Some(_)) => session.refreshed(),
            Ok(None) => {
                return Refresh::Failed(etcd_client::Error::LeaseKeepAliveError(
                    "keep-alive stream closed".to_string(),
                ));
            }
            Err(e) => return Refresh::Failed(e),
        }
        tokio::select! {
            () = shutdown.cancelled() => return Refresh::Cancelled,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
