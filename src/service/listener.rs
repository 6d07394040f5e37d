//! Listener Manager (spec §4.8): turns each [`ListenerConfig`] into a bound
//! `pingora::services::listening::Service`, plain or TLS-terminating,
//! sharing one [`ProxyApp`] per listener.
//!
//! Grounded on the teacher's `proxy_service`/`proxy_service_tls` pair
//! (`Listeners::tcp`/`Listeners::tls` + `Service::with_listeners`),
//! generalized from a single hard-coded address to the config file's
//! listener list.

use crate::app::proxy_app::ProxyApp;
use crate::config::{ListenerConfig, ProxyConfig};
use pingora::listeners::Listeners;
use pingora::services::listening::Service;
use std::sync::Arc;

/// Builds the listening service for one configured listener.
///
/// TLS termination here is the *inbound* hop (spec §2's "TLS-terminating
/// listener") and is independent of whatever TLS mode the Egress Dialer
/// uses for the upstream hop.
pub fn build(listener: &ListenerConfig, config: Arc<ProxyConfig>) -> Service<ProxyApp> {
    let addr = listener.bind.to_string();
    let app = ProxyApp::new(config);

    match &listener.tls {
        None => Service::with_listeners("whsentry-proxy".to_string(), Listeners::tcp(&addr), app),
        Some(tls) => {
            let cert_path = tls.cert_path.to_string_lossy();
            let key_path = tls.key_path.to_string_lossy();
            let listeners = Listeners::tls(&addr, &cert_path, &key_path)
                .unwrap_or_else(|e| panic!("failed to build TLS listener for {addr}: {e}"));
            Service::with_listeners("whsentry-proxy-tls".to_string(), listeners, app)
        }
    }
}
