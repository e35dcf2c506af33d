mod lock;
mod mutex;

pub use lock::*;
pub(crate) use mutex::*;

#[cfg(test)]
mod tests;
