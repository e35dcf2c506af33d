//! Type aliases and constants shared by servers and clients.
//!
//! The ID layout is fixed: clients decode IDs with [`SnowflakeId`] and assume
//! the same [`EPOCH`] as the servers that issued them.

use snowfleet::{IdGenerator, TWITTER_EPOCH, WallClock};

pub use snowfleet::{MAX_BATCH_SIZE, MAX_DATACENTER_ID, MAX_WORKER_ID, SnowflakeId};

/// Clock used by every server-side generator.
pub type Clock = WallClock;

/// The generator bound to one worker slot.
pub type Generator = IdGenerator<Clock>;

/// Default epoch subtracted from timestamps before packing.
pub const EPOCH: core::time::Duration = TWITTER_EPOCH;

/// Value returned by a healthy server's `Ping`.
pub const PING_OK: &str = "ok";

/// Normalizes a `host:port` endpoint into a URI tonic can dial. Endpoints
/// that already carry a scheme are returned unchanged.
pub fn endpoint_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}
