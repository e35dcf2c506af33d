#![doc = include_str!("../README.md")]

mod coordinator;
mod error;
#[cfg(feature = "etcd")]
mod etcd;
mod leader;
mod memory;
mod peer;
mod registry;

pub use crate::coordinator::*;
pub use crate::error::*;
#[cfg(feature = "etcd")]
pub use crate::etcd::*;
pub use crate::leader::*;
pub use crate::memory::*;
pub use crate::peer::*;
pub use crate::registry::*;
