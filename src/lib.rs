//! authguard: brute-force login protection.
//!
//! Consumes a live stream of authentication events, tracks repeated failures
//! per source address, blocks offenders at the firewall once they cross a
//! threshold inside a sliding window, and lifts the block after a cooldown.

pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod firewall;
pub mod parser;
pub mod persistence;
pub mod store;
pub mod sweeper;
pub mod tracker;

pub use config::GuardConfig;
pub use error::GuardError;
pub use event::{AuthEvent, EventSource, Outcome, Timestamp};
pub use tracker::AttemptTracker;
