//! gRPC surface of the node.
//!
//! - [`handler`] - the `snowfleet.Snowflake` service (`IdService`).

pub mod handler;
