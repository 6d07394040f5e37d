//! Request Classifier & Rewriter (spec §4.5).
//!
//! Parses an inbound proxy request off the wire with `httparse` — spec §1
//! names "the generic HTTP/1.1 parser" as an assumed external primitive,
//! and `httparse` is the minimal-footprint crate the pack reaches for in
//! that role — then classifies it as `CONNECT` or absolute-form HTTP,
//! extracts and strips the `X-WHSentry-*` control headers, and strips
//! hop-by-hop headers before the request is handed to the Forward or
//! Tunnel Engine.

use crate::error::ProxyError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Upper bound on the size of the request line + headers, to keep a
/// misbehaving or malicious inbound caller from growing the header buffer
/// without limit. The inbound side is trusted (spec §1) but not infallible.
const MAX_HEADER_BYTES: usize = 64 * 1024;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "upgrade",
];

const CONTROL_HEADER_TLS: &str = "x-whsentry-tls";
const CONTROL_HEADER_CLIENT_CERT: &str = "x-whsentry-clientcert";

/// Target scheme of the upstream hop, before any `X-WHSentry-TLS` override
/// is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The classified, rewritten form of an inbound proxy request, ready to
/// hand to the Forward Engine (`Http`) or Tunnel Engine (`Connect`).
pub enum ClassifiedRequest {
    Connect { host: String, port: u16 },
    Http(UpstreamRequest),
}

/// An inbound HTTP request rewritten into the shape the Forward Engine
/// sends upstream (spec §3 `UpstreamRequest`).
pub struct UpstreamRequest {
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
    pub version_minor: u8,
    /// Headers after control-header extraction and hop-by-hop stripping,
    /// in their original order. `Host` has been overwritten to the target
    /// authority per spec §4.5 step 5.
    pub headers: Vec<(String, String)>,
    /// Force TLS upgrade of the upstream hop, from `X-WHSentry-TLS: true`.
    pub force_tls: bool,
    /// The client-cert id requested via `X-WHSentry-ClientCert`, if any.
    pub client_cert_id: Option<String>,
}

impl UpstreamRequest {
    /// The port to dial: the explicit URI port if present, else 443 when
    /// `X-WHSentry-TLS` forced an upgrade, else the scheme default
    /// (spec §4.5 step 3).
    pub fn effective_port(&self) -> u16 {
        self.port
    }

    /// Whether the upstream hop must use TLS: either the URI scheme was
    /// `https` (only reachable via CONNECT per the Open Question in spec
    /// §9 — non-CONNECT `https://` requests are rejected before this
    /// point) or the control header forced it.
    pub fn upstream_uses_tls(&self) -> bool {
        self.force_tls || self.scheme == Scheme::Https
    }

    /// Re-serializes the request line + headers for the upstream hop.
    pub fn serialize_head(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.method);
        out.push(' ');
        out.push_str(&self.path_and_query);
        out.push_str(&format!(" HTTP/1.{}\r\n", self.version_minor));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }

    /// `Content-Length` of the inbound request body, if present and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
    }

    /// Whether the inbound request body uses chunked transfer-encoding.
    pub fn is_chunked(&self) -> bool {
        self.headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
        })
    }
}

/// Reads one request-line + header block from `reader` and classifies it,
/// per spec §4.5. Returns `ProxyError::MalformedRequest` for anything that
/// isn't `CONNECT host:port` or an absolute-form HTTP/1.1 request line.
pub async fn read_and_classify<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<ClassifiedRequest, ProxyError> {
    let raw = read_header_block(reader).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    let status = parsed
        .parse(&raw)
        .map_err(|e| ProxyError::MalformedRequest(format!("invalid request line/headers: {e}")))?;
    if status.is_partial() {
        return Err(ProxyError::MalformedRequest(
            "incomplete request headers".into(),
        ));
    }

    let method = parsed
        .method
        .ok_or_else(|| ProxyError::MalformedRequest("missing method".into()))?
        .to_string();
    let target = parsed
        .path
        .ok_or_else(|| ProxyError::MalformedRequest("missing request target".into()))?;
    let version_minor = parsed.version.unwrap_or(1);

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(target, 443)
            .ok_or_else(|| ProxyError::MalformedRequest(format!("invalid CONNECT target: {target}")))?;
        return Ok(ClassifiedRequest::Connect { host, port });
    }

    let (scheme, host, uri_port, path_and_query) = split_absolute_form(target)
        .ok_or_else(|| ProxyError::MalformedRequest(format!("request target is not absolute-form: {target}")))?;

    let mut headers: Vec<(String, String)> = Vec::with_capacity(parsed.headers.len());
    let mut force_tls = false;
    let mut client_cert_id = None;

    for h in parsed.headers.iter() {
        let name = h.name.to_string();
        let value = String::from_utf8_lossy(h.value).trim().to_string();
        let lower = name.to_ascii_lowercase();

        if lower == CONTROL_HEADER_TLS {
            force_tls = value.eq_ignore_ascii_case("true");
            continue;
        }
        if lower == CONTROL_HEADER_CLIENT_CERT {
            client_cert_id = Some(value);
            continue;
        }
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        headers.push((name, value));
    }

    if scheme == Scheme::Https && !force_tls {
        // spec §9 Open Question: a non-CONNECT `https://` request URI is
        // ambiguous without an explicit TLS-upgrade header. Reject rather
        // than silently guessing the caller wanted an upstream TLS hop.
        return Err(ProxyError::MalformedRequest(
            "https:// request target requires X-WHSentry-TLS (use CONNECT otherwise)".into(),
        ));
    }

    let port = uri_port.unwrap_or_else(|| {
        if force_tls {
            443
        } else {
            scheme.default_port()
        }
    });

    let authority = if port == scheme.default_port() {
        host.clone()
    } else {
        format!("{host}:{port}")
    };
    set_host_header(&mut headers, &authority);

    Ok(ClassifiedRequest::Http(UpstreamRequest {
        method,
        scheme,
        host,
        port,
        path_and_query,
        version_minor,
        headers,
        force_tls,
        client_cert_id,
    }))
}

fn set_host_header(headers: &mut Vec<(String, String)>, authority: &str) {
    if let Some(existing) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case("host")) {
        existing.1 = authority.to_string();
    } else {
        headers.insert(0, ("Host".to_string(), authority.to_string()));
    }
}

/// Reads bytes from `reader` until the blank line terminating the header
/// block (`\r\n\r\n`) has been seen, bounded by [`MAX_HEADER_BYTES`].
async fn read_header_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProxyError> {
    let mut buf = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ProxyError::MalformedRequest(format!("error reading request: {e}")))?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "connection closed before headers completed".into(),
            ));
        }
        buf.extend_from_slice(&line);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::MalformedRequest("request headers too large".into()));
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(buf)
}

/// Splits `scheme://host[:port]/path?query` into its parts. Returns `None`
/// for relative-form targets, which spec §4.5 step 2 requires rejecting.
fn split_absolute_form(target: &str) -> Option<(Scheme, String, Option<u16>, String)> {
    let (scheme_str, rest) = target.split_once("://")?;
    let scheme = match scheme_str.to_ascii_lowercase().as_str() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return None,
    };

    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, _) = split_authority(authority, scheme.default_port())?;
    let explicit_port = authority.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok());

    Some((scheme, host, explicit_port, path_and_query))
}

/// Splits `host:port` or a bare `host` (defaulting to `default_port`).
/// Handles bracketed IPv6 literals (`[::1]:8080`).
fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str.parse().ok()?;
            Some((host.to_string(), port))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}
