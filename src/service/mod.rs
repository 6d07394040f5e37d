//! # Service Module
//!
//! Wires the proxy engine up to Pingora's listening services.
//!
//! ## Module Structure
//!
//! * `listener`: builds a `Service<ProxyApp>` (plain or TLS-terminating)
//!   from each configured listener.

pub mod listener;
