//! Daemon/cli pair for tracking how much active time is spent on each website domain.
//! A browser-side collaborator feeds tab lifecycle events into the daemon over a local
//! socket, and the cli renders the accumulated totals and simple productivity stats.
//!

pub mod cli;
pub mod daemon;
pub mod protocol;
pub mod utils;
