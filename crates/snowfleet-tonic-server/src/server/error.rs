//! Startup errors. Each of them keeps the node from serving.

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A registered peer could not be dialed or did not answer.
    #[error("peer {addr} (worker {worker_id}) is unreachable: {reason}")]
    PeerUnreachable {
        worker_id: u64,
        addr: String,
        reason: String,
    },

    /// A peer generates IDs for another datacenter.
    #[error("peer {addr} reports datacenter {remote}, this node is configured for {local}")]
    DatacenterMismatch { addr: String, local: u64, remote: u64 },

    /// The local clock is too far from the fleet mean.
    #[error("local clock ({local}s) differs from the peer mean ({mean}s) by more than {max_skew_secs}s")]
    ClockSkew {
        local: u64,
        mean: u64,
        max_skew_secs: u64,
    },

    #[error("worker id {worker_id} is configured more than once")]
    DuplicateWorkerId { worker_id: u64 },

    #[error("cannot create generator: {0}")]
    Generator(#[from] snowfleet_tonic_core::snowfleet::Error),

    #[error("coordination failed: {0}")]
    Coordination(#[from] snowfleet_coord::Error),
}
