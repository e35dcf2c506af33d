#![doc = include_str!("../README.md")]

pub mod common;
pub use common::{
    error::{Error, Result},
    types::*,
};
// Public re-export so downstream crates share one `snowfleet` version.
pub use snowfleet;

pub mod proto {
    tonic::include_proto!("snowfleet");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("snowfleet_descriptor");
}
