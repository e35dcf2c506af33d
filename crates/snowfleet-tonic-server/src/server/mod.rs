//! Server-side components of a snowfleet node.
//!
//! - [`config`] - CLI and environment configuration.
//! - [`registrar`] - binds worker ids to generators and coordination slots.
//! - [`sanity`] - startup check against the rest of the fleet.
//! - [`service`] - the gRPC service.
//! - [`telemetry`] - log output.

pub mod config;
pub mod error;
pub mod registrar;
pub mod sanity;
pub mod service;
pub mod telemetry;
