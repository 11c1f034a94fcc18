use crate::{Error, certificate_authority::IdentityConfig};
use serde::{Deserialize, Deserializer};
use std::{fs, path::Path, path::PathBuf};

pub const DEFAULT_PORT: u16 = 8080;

/// Runtime configuration, as read from a JSON document.
///
/// ```json
/// {
///     "port": 8080,
///     "raddr": "",
///     "logFile": "",
///     "monitor": false,
///     "tls": false,
///     "ca": { "keyFile": "interloper-ca-pk.pem", "certFile": "interloper-ca-cert.pem" }
/// }
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Listen port. Accepts a number or a numeric string.
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    /// Upstream proxy `host:port`; empty or absent selects direct mode.
    pub raddr: Option<String>,
    /// Log file; standard error when empty or absent.
    #[serde(alias = "log")]
    pub log_file: Option<PathBuf>,
    /// Print every proxied exchange.
    pub monitor: bool,
    /// Serve the listener itself over TLS.
    pub tls: bool,
    /// Signing identity.
    pub ca: IdentityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            raddr: None,
            log_file: None,
            monitor: false,
            tls: false,
            ca: IdentityConfig::default(),
        }
    }
}

impl Config {
    /// Reads a JSON configuration file. Absent fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or is not a valid configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        Self::from_json(&json).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Upstream proxy address, if forward mode is configured.
    pub fn upstream(&self) -> Option<&str> {
        self.raddr
            .as_deref()
            .map(str::trim)
            .filter(|raddr| !raddr.is_empty())
    }

    /// Log file, if one is configured.
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

fn deserialize_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}
