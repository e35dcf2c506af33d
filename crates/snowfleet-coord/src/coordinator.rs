use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::Result;

/// Width of the zero-padded counter appended to sequential nodes.
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a per-parent monotonic counter appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    pub const fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }
}

/// Session state changes reported by a coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// The session ended on the server side and its ephemeral nodes are gone.
    /// A new session follows with [`SessionEvent::Connected`].
    Expired,
}

/// What ended a [`Watch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched child set changed.
    ChildrenChanged,
    /// The session that set the watch went away before any change.
    SessionClosed,
}

/// A one-shot notification for the next change of a node's children.
pub struct Watch {
    inner: BoxFuture<'static, WatchEvent>,
}

impl Watch {
    pub fn new(fut: impl Future<Output = WatchEvent> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(fut),
        }
    }
}

impl Future for Watch {
    type Output = WatchEvent;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").finish_non_exhaustive()
    }
}

/// A client of a hierarchical coordination service with sessions, ephemeral
/// and sequential nodes, and child watches.
///
/// Paths are absolute and `/`-separated. Sequential nodes are named
/// `<path><counter>` where the counter is [`SEQUENCE_WIDTH`] digits wide and
/// strictly increasing per parent, so creating `/svc/3/` yields
/// `/svc/3/0000000000`, `/svc/3/0000000001`, and so on.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Creates a node and returns its actual path.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Returns the payload of a node.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Returns the names (not full paths) of a node's children, unordered.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Like [`Coordinator::children`], also arming a one-shot watch that
    /// resolves on the next change of the child set.
    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Deletes a node.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Subscribes to session state changes.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Whether the session is currently connected.
    fn is_connected(&self) -> bool;

    /// Identifier of the current session.
    fn session_id(&self) -> u64;

    /// Ends the session, removing every ephemeral node it owns.
    async fn close(&self) -> Result<()>;
}

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{child}")
}

/// Returns the parent of an absolute path (`/` for top-level nodes).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Returns the last component of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Checks that `path` is absolute, has no empty components and does not end
/// with `/` (the root itself excepted).
pub fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && path[1..].split('/').all(|c| !c.is_empty())
}
