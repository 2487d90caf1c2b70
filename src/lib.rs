#[macro_use]
extern crate log;

pub mod metrics;
pub mod mvcc;
