//! # System Module
//!
//! Process-level bootstrap: builds listener services from configuration
//! and runs the Pingora server.
//!
//! ## Module Structure
//!
//! * `server`: core server initialization and run loop.

pub mod server;
