//! Polls sensor devices, decides per cloud destination whether each reading
//! is worth sending, fans readings out and records them in a time-series
//! store.

pub mod config;
pub mod device;
pub mod error;
pub mod http;
pub mod ordered;
pub mod policy;
pub mod reading;
pub mod registry;
pub mod runner;
pub mod sender;
pub mod sink;
pub mod tsdb;

#[cfg(test)]
pub mod test_support;
