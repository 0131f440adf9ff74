//! Process configuration
//!
//! Command-line flags (with environment fallbacks) are parsed into
//! [`Options`] and then validated into an immutable [`RelayConfig`] before
//! any component is built. Every failure here is fatal.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;
use tracing::info;

use crate::broadcast::BroadcastConfig;
use crate::crypto::{
    generate_signing_key, load_verifying_key, signing_key_pem, CryptoConfig, KeyError,
    SymmetricKey,
};
use crate::SERVICE_NAME;

pub const DEFAULT_PORT: u16 = 27420;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("both --tls-cert and --tls-key must be provided")]
    TlsPair,

    #[error("{what} file '{}' not found", .path.display())]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("{name} must be at least 1")]
    ZeroCapacity { name: &'static str },

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Command-line options.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay", version, about = "Remote debug-event relay")]
pub struct Options {
    /// IP address to listen on
    #[arg(short = 'a', long, env = "RELAY_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub address: IpAddr,

    /// Port to listen on [use 0 for random]
    #[arg(short = 'p', long, env = "RELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path to TLS certificate file [PEM]
    #[arg(short = 'c', long, env = "RELAY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key [PEM]
    #[arg(short = 'z', long, env = "RELAY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Enable end-to-end encryption of inbound events
    #[arg(short = 'e', long)]
    pub encryption: bool,

    /// [for -e] Path to symmetric key (AES-256-GCM, raw or base64); generated when absent
    #[arg(short = 'k', long, env = "RELAY_SYMMETRIC_KEY")]
    pub symmetric_key: Option<PathBuf>,

    /// Enable signature verification of inbound events
    #[arg(short = 's', long)]
    pub sign_verification: bool,

    /// [for -s] Path to ed25519 key [PEM, public or private]; generated when absent
    #[arg(short = 'x', long, env = "RELAY_SIGN_KEY")]
    pub sign_key: Option<PathBuf>,

    /// Directory holding pause lock records (cleared at startup)
    #[arg(long, env = "RELAY_LOCKS_DIR")]
    pub locks_dir: Option<PathBuf>,

    /// Number of recent events replayed to a newly attached console
    #[arg(long, default_value_t = 100)]
    pub backlog: usize,

    /// Live events a console may fall behind before it is dropped
    #[arg(long, default_value_t = 256)]
    pub subscriber_queue: usize,

    /// Maximum requests served concurrently
    #[arg(long, default_value_t = 100)]
    pub max_concurrent_requests: usize,

    /// Session name
    #[arg(short = 'n', long, default_value = SERVICE_NAME)]
    pub session_name: String,
}

/// Certificate and key for serving HTTPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Key material created at startup because no path was given. Shown once
/// in the banner so the debugged process can be configured with it.
#[derive(Debug, Clone)]
pub enum GeneratedKey {
    Symmetric(String),
    Signing(String),
}

impl fmt::Display for GeneratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratedKey::Symmetric(b64) => write!(f, "ENCRYPTION KEY\n{}", b64),
            GeneratedKey::Signing(pem) => write!(f, "SIGNING KEY\n{}", pem),
        }
    }
}

/// Validated, immutable process configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub tls: Option<TlsPaths>,
    pub crypto: CryptoConfig,
    pub generated_keys: Vec<GeneratedKey>,
    pub locks_dir: PathBuf,
    pub broadcast: BroadcastConfig,
    pub max_concurrent_requests: usize,
    pub session_name: String,
}

impl RelayConfig {
    pub fn from_options(options: Options) -> Result<Self, ConfigError> {
        let tls = validate_tls(options.tls_cert, options.tls_key)?;

        for (name, value) in [
            ("--backlog", options.backlog),
            ("--subscriber-queue", options.subscriber_queue),
            ("--max-concurrent-requests", options.max_concurrent_requests),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity { name });
            }
        }

        let mut crypto = CryptoConfig::default();
        let mut generated_keys = Vec::new();

        if options.encryption {
            let key = match &options.symmetric_key {
                Some(path) => SymmetricKey::load(path)?,
                None => {
                    let key = SymmetricKey::generate();
                    generated_keys.push(GeneratedKey::Symmetric(key.to_base64()));
                    key
                }
            };
            crypto.symmetric_key = Some(key);
        }

        if options.sign_verification {
            let key = match &options.sign_key {
                Some(path) => load_verifying_key(path)?,
                None => {
                    let signing = generate_signing_key();
                    generated_keys.push(GeneratedKey::Signing(signing_key_pem(&signing)?));
                    signing.verifying_key()
                }
            };
            crypto.verifying_key = Some(key);
        }

        let locks_dir = options
            .locks_dir
            .unwrap_or_else(|| std::env::temp_dir().join(SERVICE_NAME).join("locks"));

        let config = Self {
            listen: SocketAddr::new(options.address, options.port),
            tls,
            crypto,
            generated_keys,
            locks_dir,
            broadcast: BroadcastConfig {
                backlog_capacity: options.backlog,
                subscriber_queue: options.subscriber_queue,
            },
            max_concurrent_requests: options.max_concurrent_requests,
            session_name: options.session_name,
        };

        info!(
            listen = %config.listen,
            tls = config.tls.is_some(),
            encryption = config.crypto.symmetric_key.is_some(),
            sign_verification = config.crypto.verifying_key.is_some(),
            locks_dir = %config.locks_dir.display(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

fn validate_tls(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<Option<TlsPaths>, ConfigError> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => {
            require_file("certificate", &cert)?;
            require_file("private key", &key)?;
            Ok(Some(TlsPaths { cert, key }))
        }
        _ => Err(ConfigError::TlsPair),
    }
}

fn require_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
    }
}

/// Host shown in the banner: wildcard addresses become `localhost`.
pub fn display_host(addr: &SocketAddr) -> String {
    match addr.ip() {
        ip if ip.is_unspecified() => "localhost".to_string(),
        IpAddr::V6(ip) => format!("[{}]", ip),
        IpAddr::V4(ip) => ip.to_string(),
    }
}
