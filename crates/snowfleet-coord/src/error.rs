//! Error types for the coordination layer.
//!
//! Low-level coordinator calls report [`Error::NodeExists`], [`Error::NoNode`],
//! [`Error::CoordinationUnavailable`], [`Error::SessionExpired`] and
//! [`Error::Backend`]. The registry wraps failed writes into
//! [`Error::CoordinationWrite`] and decoding problems into
//! [`Error::MalformedPath`] / [`Error::MalformedPeerRecord`].

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The node already exists.
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// The node (or its parent) does not exist.
    #[error("no such node: {path}")]
    NoNode { path: String },

    /// The coordination service could not be reached in time.
    #[error("coordination service unavailable: {reason}")]
    CoordinationUnavailable { reason: String },

    /// A write to the coordination service failed.
    #[error("coordination write to {path} failed: {reason}")]
    CoordinationWrite { path: String, reason: String },

    /// The session owning the ephemeral nodes has expired.
    #[error("coordination session {session_id} expired")]
    SessionExpired { session_id: u64 },

    /// A path (or slot directory name) is not in the expected shape.
    #[error("malformed coordination path: {path}")]
    MalformedPath { path: String },

    /// A peer record payload could not be decoded.
    #[error("malformed peer record at {path}: {reason}")]
    MalformedPeerRecord { path: String, reason: String },

    /// Any other backend failure.
    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Wraps a low-level failure, unavailability included, as a failed write
    /// to `path`.
    pub fn write(path: impl Into<String>, err: Self) -> Self {
        match err {
            Self::CoordinationWrite { .. } => err,
            other => Self::CoordinationWrite {
                path: path.into(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::TransportError(e) => Self::CoordinationUnavailable {
                reason: e.to_string(),
            },
            other => Self::Backend(other.to_string()),
        }
    }
}
