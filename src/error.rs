//! Error taxonomy for the proxy engine.
//!
//! Every failure path in the Address Classifier, Egress Dialer, Body Limiter,
//! Deadline Guard and Request Classifier funnels into [`ProxyError`]. The
//! Forward and Tunnel Engines are the only places that turn a `ProxyError`
//! into a client-visible outcome, via [`ProxyError::status_code`].

use std::io;

/// A single error taxonomy shared by every proxy component.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Target resolved into the CIDR deny-list, or was the literal `localhost`.
    #[error("target denied by egress policy: {0}")]
    PolicyDenied(String),

    /// The inbound request could not be parsed, or used relative-form.
    #[error("malformed proxy request: {0}")]
    MalformedRequest(String),

    /// DNS resolution of the target host failed or timed out.
    #[error("dns resolution failed for {host}: {source}")]
    Dns { host: String, source: io::Error },

    /// TCP connect was refused by every resolved address.
    #[error("connection refused to {addr}: {source}")]
    Refused { addr: String, source: io::Error },

    /// TCP connect did not complete within `connect_timeout`.
    #[error("connect timed out to {addr}")]
    ConnectTimeout { addr: String },

    /// Upstream TLS certificate verification failed.
    #[error("tls verification failed for {host}: {source}")]
    TlsVerify {
        host: String,
        source: openssl::error::ErrorStack,
    },

    /// Upstream TLS handshake failed for a reason other than verification.
    #[error("tls handshake failed for {host}: {source}")]
    TlsHandshake { host: String, source: String },

    /// The upstream response could not be parsed as HTTP/1.1.
    #[error("malformed upstream response: {0}")]
    UpstreamProtocol(String),

    /// A fixed-length response exceeded `max_response_body_size`.
    #[error("response body of {len} bytes exceeds cap of {cap} bytes")]
    SizeExceeded { len: u64, cap: u64 },

    /// The connection lifetime or read-idle deadline fired.
    #[error("deadline expired ({0})")]
    DeadlineExpired(&'static str),

    /// The inbound client closed its side of the connection.
    #[error("client closed connection")]
    ClientGone,
}

impl ProxyError {
    /// Maps an error category to the status line the Forward Engine must
    /// emit, per spec §4.6. Returns `None` for categories that never reach
    /// the client as a status line (a deadline firing after headers have
    /// already been forwarded just closes the connection).
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProxyError::PolicyDenied(_) => Some(403),
            ProxyError::MalformedRequest(_) => Some(400),
            ProxyError::Dns { .. }
            | ProxyError::Refused { .. }
            | ProxyError::ConnectTimeout { .. }
            | ProxyError::TlsVerify { .. }
            | ProxyError::TlsHandshake { .. }
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::SizeExceeded { .. } => Some(502),
            ProxyError::DeadlineExpired(_) | ProxyError::ClientGone => None,
        }
    }

    /// Short category name for log correlation, never shown to clients.
    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::PolicyDenied(_) => "POLICY_DENIED",
            ProxyError::MalformedRequest(_) => "MALFORMED_REQUEST",
            ProxyError::Dns { .. } => "DIAL_DNS",
            ProxyError::Refused { .. } => "DIAL_REFUSED",
            ProxyError::ConnectTimeout { .. } => "DIAL_TIMEOUT",
            ProxyError::TlsVerify { .. } => "TLS_VERIFY",
            ProxyError::TlsHandshake { .. } => "TLS_OTHER",
            ProxyError::UpstreamProtocol(_) => "UPSTREAM_PROTOCOL",
            ProxyError::SizeExceeded { .. } => "SIZE_EXCEEDED",
            ProxyError::DeadlineExpired(_) => "DEADLINE_EXPIRED",
            ProxyError::ClientGone => "CLIENT_GONE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(
            ProxyError::PolicyDenied("10.0.0.1".into()).status_code(),
            Some(403)
        );
        assert_eq!(
            ProxyError::MalformedRequest("relative uri".into()).status_code(),
            Some(400)
        );
        assert_eq!(
            ProxyError::ConnectTimeout {
                addr: "10.0.0.1:443".into()
            }
            .status_code(),
            Some(502)
        );
        assert_eq!(
            ProxyError::SizeExceeded { len: 9, cap: 8 }.status_code(),
            Some(502)
        );
        assert_eq!(ProxyError::DeadlineExpired("lifetime").status_code(), None);
        assert_eq!(ProxyError::ClientGone.status_code(), None);
    }
}
