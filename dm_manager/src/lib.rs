//! DM Manager Library
//!
//! Shared plumbing for the `dmctl` command-line tool: session setup
//! (configuration + bus) and the command implementations.

pub mod commands;
pub mod session;

pub use session::{Session, SessionOptions};
