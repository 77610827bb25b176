//! src/lib.rs
//!
//! Test-orchestration harness for gossip replication across independent
//! peer implementations. `App` dispatches the binary's modes; the
//! subsystems are usable on their own.

pub mod app;
pub mod config;
pub mod content;
pub mod error;
pub mod expectations;
pub mod feed;
pub mod fixtures;
pub mod generation;
pub mod instruction;
pub mod ports;
pub mod puppet;
pub mod rpc;
pub mod sim;

pub use app::{App, Mode};
pub use config::Config;
