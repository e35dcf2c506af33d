#![doc = include_str!("../README.md")]

mod connection;
mod error;
mod registry;
mod router;
mod rpc;

pub use crate::connection::*;
pub use crate::error::*;
pub use crate::registry::*;
pub use crate::router::*;
pub use crate::rpc::*;
