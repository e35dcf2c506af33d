//! Shared types and the wire error used by both ends of the RPC.

pub mod error;
pub mod types;
