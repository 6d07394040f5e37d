//! # Server Management Module
//!
//! Initializes and runs the proxy's single `pingora::server::Server`
//! process: one `Service<ProxyApp>` per configured listener, all sharing
//! the same immutable [`ProxyConfig`].
//!
//! Simplified from the teacher's one-thread-per-service-class launcher
//! (gateway service, non-TLS proxy, TLS proxy, three default-page
//! servers, each in its own `thread::spawn`) down to a single server
//! process, since this proxy has exactly one service kind: the forward/
//! tunnel engine, repeated per listener.

use crate::config::ProxyConfig;
use crate::service;
use pingora::prelude::Opt;
use pingora::server::{RunArgs, Server};
use std::sync::Arc;

/// Builds one listening service per entry in `config.listeners` and runs
/// the server until it receives a shutdown signal.
///
/// This call blocks until the process receives SIGINT (or another
/// configured interrupt) — Pingora installs its own signal handling
/// during `run`.
pub fn init(config: Arc<ProxyConfig>) {
    let opt = Some(Opt::default());
    let mut my_server = Server::new(opt).expect("failed to create server");
    my_server.bootstrap();

    let mut services: Vec<Box<dyn pingora::services::Service>> = Vec::new();
    for listener in &config.listeners {
        log::info!("binding listener {}", listener.bind);
        let svc = service::listener::build(listener, Arc::clone(&config));
        services.push(Box::new(svc));
    }

    my_server.add_services(services);
    my_server.run(RunArgs::default());
}
