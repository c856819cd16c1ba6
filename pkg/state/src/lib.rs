//! Central state store and its watch log.

pub mod client;
pub mod watch;
