//! Configuration data model (spec §3) and the TOML file loader that builds
//! it.
//!
//! `FileConfig` is the on-disk shape: plain strings and paths, `serde`-
//! deserialized straight from TOML. [`FileConfig::load`] is the boundary
//! where PEM decoding happens, turning it into the immutable [`ProxyConfig`]
//! every connection shares read-only for the rest of the process lifetime.
//! A config reload path (not currently wired to any signal) would build a
//! fresh `ProxyConfig` and atomically swap an `Arc<ProxyConfig>` reference —
//! never mutate one in place, per spec §9.

use openssl::pkey::{PKey, Private};
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::X509;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cap on TCP connect + TLS handshake time (spec §3).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A loaded client certificate + private key pair, keyed by id. The spec's
/// enumerated contract is a single literal id, `"default"` (spec §9).
pub struct ClientCert {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// Immutable, process-wide proxy configuration (spec §3).
pub struct ProxyConfig {
    pub listeners: Vec<ListenerConfig>,
    pub insecure_skip_cidr_deny_list: bool,
    pub insecure_skip_cert_verification: bool,
    pub root_ca_certs: Option<X509Store>,
    pub client_cert: Option<ClientCert>,
    pub max_response_body_size: u64,
    pub connection_lifetime: Duration,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

/// One listener: a bind address, plain or TLS-terminating.
pub struct ListenerConfig {
    pub bind: SocketAddr,
    pub tls: Option<ListenerTls>,
}

pub struct ListenerTls {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// On-disk representation of [`ProxyConfig`], deserialized from TOML.
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub listeners: Vec<FileListenerConfig>,
    #[serde(default)]
    pub insecure_skip_cidr_deny_list: bool,
    #[serde(default)]
    pub insecure_skip_cert_verification: bool,
    #[serde(default)]
    pub root_ca_certs_path: Option<PathBuf>,
    #[serde(default)]
    pub client_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub client_key_file: Option<PathBuf>,
    #[serde(default)]
    pub max_response_body_size: u64,
    #[serde(default = "default_connection_lifetime_secs")]
    pub connection_lifetime_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct FileListenerConfig {
    pub bind: String,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

fn default_connection_lifetime_secs() -> u64 {
    60
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

/// Errors that can occur while loading and validating a config file. These
/// are startup-fatal (spec §7: "only listener-bind failures at startup are
/// fatal" — a config that can't be loaded never gets as far as binding).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("listener bind address {0:?} is not a valid socket address")]
    InvalidBindAddr(String),
    #[error("listener at {bind} sets tls_cert_path without tls_key_path, or vice versa")]
    IncompleteListenerTls { bind: String },
    #[error("client_cert_file is set without client_key_file, or vice versa")]
    IncompleteClientCert,
    #[error("failed to read PEM file {path}: {source}")]
    PemRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse PEM file {path}: {source}")]
    PemParse {
        path: PathBuf,
        source: openssl::error::ErrorStack,
    },
    #[error("no listeners configured")]
    NoListeners,
}

impl FileConfig {
    /// Reads and parses `path`, without doing any PEM/filesystem resolution.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validates the file and resolves it into an immutable [`ProxyConfig`],
    /// loading certificate/key PEM material from disk as needed.
    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for l in self.listeners {
            let bind = l
                .bind
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(l.bind.clone()))?;
            let tls = match (l.tls_cert_path, l.tls_key_path) {
                (Some(cert_path), Some(key_path)) => Some(ListenerTls { cert_path, key_path }),
                (None, None) => None,
                _ => {
                    return Err(ConfigError::IncompleteListenerTls { bind: l.bind });
                }
            };
            listeners.push(ListenerConfig { bind, tls });
        }

        let root_ca_certs = match self.root_ca_certs_path {
            Some(path) => Some(load_trust_store(&path)?),
            None => None,
        };

        let client_cert = match (self.client_cert_file, self.client_key_file) {
            (Some(cert_path), Some(key_path)) => Some(ClientCert {
                cert: load_x509(&cert_path)?,
                key: load_private_key(&key_path)?,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteClientCert),
        };

        Ok(ProxyConfig {
            listeners,
            insecure_skip_cidr_deny_list: self.insecure_skip_cidr_deny_list,
            insecure_skip_cert_verification: self.insecure_skip_cert_verification,
            root_ca_certs,
            client_cert,
            max_response_body_size: self.max_response_body_size,
            connection_lifetime: Duration::from_secs(self.connection_lifetime_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        })
    }

    /// Convenience combining [`FileConfig::read`] and [`FileConfig::build`].
    pub fn load(path: &Path) -> Result<ProxyConfig, ConfigError> {
        Self::read(path)?.build()
    }
}

fn load_x509(path: &Path) -> Result<X509, ConfigError> {
    let pem = std::fs::read(path).map_err(|source| ConfigError::PemRead {
        path: path.to_path_buf(),
        source,
    })?;
    X509::from_pem(&pem).map_err(|source| ConfigError::PemParse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_private_key(path: &Path) -> Result<PKey<Private>, ConfigError> {
    let pem = std::fs::read(path).map_err(|source| ConfigError::PemRead {
        path: path.to_path_buf(),
        source,
    })?;
    PKey::private_key_from_pem(&pem).map_err(|source| ConfigError::PemParse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_trust_store(path: &Path) -> Result<X509Store, ConfigError> {
    let pem = std::fs::read(path).map_err(|source| ConfigError::PemRead {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = X509::stack_from_pem(&pem).map_err(|source| ConfigError::PemParse {
        path: path.to_path_buf(),
        source,
    })?;
    let mut builder = X509StoreBuilder::new().map_err(|source| ConfigError::PemParse {
        path: path.to_path_buf(),
        source,
    })?;
    for cert in certs {
        builder
            .add_cert(cert)
            .map_err(|source| ConfigError::PemParse {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(builder.build())
}
