pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by the failover client.
///
/// Connection faults are absorbed by the router and only show up as
/// [`Error::NoRoute`]; errors produced by the server that handled the call are
/// passed through as [`Error::Remote`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No healthy endpoint is currently known for the worker slot.
    #[error("no healthy endpoint for worker {worker_id}")]
    NoRoute { worker_id: u64 },

    /// The router was closed.
    #[error("router for worker {worker_id} is closed")]
    RouterClosed { worker_id: u64 },

    /// The server handled the call and refused it.
    #[error(transparent)]
    Remote(#[from] snowfleet_tonic_core::Error),

    #[error(transparent)]
    Coordination(#[from] snowfleet_coord::Error),

    /// Dialing an endpoint failed.
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
}
