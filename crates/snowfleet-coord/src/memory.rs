//! In-process coordination backend.
//!
//! A [`MemoryTree`] is a shared node tree; every [`MemoryCoordinator`]
//! obtained from [`MemoryTree::connect`] is one client session against it.
//! Session expiry and service outages can be simulated with
//! [`MemoryTree::expire_session`] and [`MemoryTree::set_available`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use crate::{
    coordinator::{
        CreateMode, Coordinator, SEQUENCE_WIDTH, SessionEvent, Watch, WatchEvent, is_valid_path,
        parent_path,
    },
    error::{Error, Result},
};

const SESSION_EVENTS_CAPACITY: usize = 16;

struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
}

#[derive(Clone)]
struct SessionHandle {
    current: Arc<AtomicU64>,
    events: broadcast::Sender<SessionEvent>,
}

struct TreeState {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    watches: HashMap<String, Vec<(u64, oneshot::Sender<()>)>>,
    sessions: HashMap<u64, SessionHandle>,
    next_session: u64,
    available: bool,
}

impl Default for TreeState {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            sequences: HashMap::new(),
            watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
            available: true,
        }
    }
}

impl TreeState {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::CoordinationUnavailable {
                reason: "memory tree marked unavailable".to_string(),
            })
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .map(|key| &key[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn fire(&mut self, path: &str) {
        if let Some(watches) = self.watches.remove(path) {
            for (_, tx) in watches {
                let _ = tx.send(());
            }
        }
    }

    fn create(&mut self, session: u64, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check_available()?;
        let parent = parent_path(path).to_string();
        if !self.exists(&parent) {
            return Err(Error::NoNode { path: parent });
        }

        let path = match mode {
            CreateMode::EphemeralSequential => {
                let counter = self.sequences.entry(parent.clone()).or_insert(0);
                let seq = *counter;
                *counter += 1;
                format!("{path}{seq:0width$}", width = SEQUENCE_WIDTH)
            }
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
        };
        if !is_valid_path(&path) || path == "/" {
            return Err(Error::MalformedPath { path });
        }
        if self.nodes.contains_key(&path) {
            return Err(Error::NodeExists { path });
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(
            path.clone(),
            Node {
                data: data.to_vec(),
                owner,
            },
        );
        self.fire(&parent);
        Ok(path)
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        self.check_available()?;
        if !self.nodes.contains_key(path) {
            return Err(Error::NoNode {
                path: path.to_string(),
            });
        }
        if !self.child_names(path).is_empty() {
            return Err(Error::Backend(format!("node {path} has children")));
        }
        self.nodes.remove(path);
        self.fire(path);
        self.fire(parent_path(path));
        Ok(())
    }

    /// Removes everything a session owns: ephemeral nodes and armed watches.
    fn purge(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire(&path);
            self.fire(parent_path(&path));
        }
        // Dropping the senders resolves the watches with `SessionClosed`.
        for watches in self.watches.values_mut() {
            watches.retain(|(owner, _)| *owner != session);
        }
        self.watches.retain(|_, watches| !watches.is_empty());
    }
}

/// A shared in-memory node tree.
#[derive(Clone, Default)]
pub struct MemoryTree {
    inner: Arc<Mutex<TreeState>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session against the tree.
    pub fn connect(&self) -> MemoryCoordinator {
        let mut state = self.inner.lock();
        let id = state.next_session;
        state.next_session += 1;
        let (events, _) = broadcast::channel(SESSION_EVENTS_CAPACITY);
        let handle = SessionHandle {
            current: Arc::new(AtomicU64::new(id)),
            events,
        };
        state.sessions.insert(id, handle.clone());
        tracing::debug!(session_id = id, "memory session opened");

        MemoryCoordinator {
            tree: self.clone(),
            session: handle.current,
            events: handle.events,
            closed: AtomicBool::new(false),
        }
    }

    /// Expires a session the way a coordination server would: its ephemeral
    /// nodes are deleted, then the client is handed a fresh session and sees
    /// [`SessionEvent::Expired`] followed by [`SessionEvent::Connected`].
    ///
    /// Returns `false` if no such session is open.
    pub fn expire_session(&self, session_id: u64) -> bool {
        let handle = {
            let mut state = self.inner.lock();
            let Some(handle) = state.sessions.remove(&session_id) else {
                return false;
            };
            state.purge(session_id);
            let next = state.next_session;
            state.next_session += 1;
            handle.current.store(next, Ordering::SeqCst);
            state.sessions.insert(next, handle.clone());
            handle
        };
        tracing::info!(session_id, "memory session expired");
        let _ = handle.events.send(SessionEvent::Expired);
        let _ = handle.events.send(SessionEvent::Connected);
        true
    }

    /// Simulates an outage (`false`) or recovery (`true`). While unavailable
    /// every operation fails with [`Error::CoordinationUnavailable`]; sessions
    /// survive.
    pub fn set_available(&self, available: bool) {
        let handles: Vec<SessionHandle> = {
            let mut state = self.inner.lock();
            if state.available == available {
                return;
            }
            state.available = available;
            state.sessions.values().cloned().collect()
        };
        let event = if available {
            SessionEvent::Connected
        } else {
            SessionEvent::Disconnected
        };
        for handle in handles {
            let _ = handle.events.send(event);
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.lock().exists(path)
    }

    /// Number of ephemeral nodes currently owned by `session_id`.
    pub fn ephemeral_count(&self, session_id: u64) -> usize {
        self.inner
            .lock()
            .nodes
            .values()
            .filter(|node| node.owner == Some(session_id))
            .count()
    }
}

/// One session against a [`MemoryTree`]. Dropping it closes the session.
pub struct MemoryCoordinator {
    tree: MemoryTree,
    session: Arc<AtomicU64>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
}

impl MemoryCoordinator {
    fn session(&self) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CoordinationUnavailable {
                reason: "session closed".to_string(),
            });
        }
        Ok(self.session.load(Ordering::SeqCst))
    }

    fn close_session(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.session.load(Ordering::SeqCst);
        let mut state = self.tree.inner.lock();
        state.sessions.remove(&id);
        state.purge(id);
        tracing::debug!(session_id = id, "memory session closed");
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let session = self.session()?;
        self.tree.inner.lock().create(session, path, data, mode)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.session()?;
        let state = self.tree.inner.lock();
        state.check_available()?;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode {
                path: path.to_string(),
            })
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.session()?;
        let state = self.tree.inner.lock();
        state.check_available()?;
        if !state.exists(path) {
            return Err(Error::NoNode {
                path: path.to_string(),
            });
        }
        Ok(state.child_names(path))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let session = self.session()?;
        let mut state = self.tree.inner.lock();
        state.check_available()?;
        if !state.exists(path) {
            return Err(Error::NoNode {
                path: path.to_string(),
            });
        }
        let children = state.child_names(path);
        let (tx, rx) = oneshot::channel();
        state
            .watches
            .entry(path.to_string())
            .or_default()
            .push((session, tx));

        let watch = Watch::new(async move {
            match rx.await {
                Ok(()) => WatchEvent::ChildrenChanged,
                Err(_) => WatchEvent::SessionClosed,
            }
        });
        Ok((children, watch))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.session()?;
        self.tree.inner.lock().delete(path)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.tree.inner.lock().available
    }

    fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.close_session();
        Ok(())
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        self.close_session();
    }
}
