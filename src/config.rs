//! Daemon configuration.
//!
//! Values come from an optional JSON file; every field has a default so a
//! partial file, or none at all, is valid. The binary then applies command
//! line overrides on top.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    codec::DEFAULT_MAX_FRAME_LENGTH,
    detector::DEFAULT_DETECTION_TIMEOUT,
    jsonrpc::{DEFAULT_CAPACITY, DEFAULT_WORKERS},
    stomp::{DEFAULT_REQUEST_DESTINATION, DEFAULT_RESPONSE_DESTINATION},
    tls::{DEFAULT_HANDSHAKE_TIMEOUT, ServerTls, TlsError},
};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 54321;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid configuration JSON.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// A value is out of range or inconsistent with another.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address to listen on.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// PEM certificate chain; TLS is enabled when set together with `key_file`.
    pub cert_file: Option<PathBuf>,
    /// PEM private key.
    pub key_file: Option<PathBuf>,
    /// PEM CA bundle; when set, clients must present certificates it signed.
    pub ca_file: Option<PathBuf>,
    /// TLS handshake timeout in seconds.
    pub ssl_handshake_timeout_secs: u64,
    /// Protocol detection timeout in seconds.
    pub detector_timeout_secs: u64,
    /// Maximum frame payload in bytes.
    pub max_frame_length: usize,
    /// Concurrently executing RPC methods.
    pub workers: usize,
    /// RPC jobs admitted at once before requests are refused.
    pub worker_capacity: usize,
    /// Destination STOMP clients send requests to.
    pub request_destination: String,
    /// Destination replies go to when a request names none.
    pub response_destination: String,
    /// Log filter directive.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_PORT,
            cert_file: None,
            key_file: None,
            ca_file: None,
            ssl_handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            detector_timeout_secs: DEFAULT_DETECTION_TIMEOUT.as_secs(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            workers: DEFAULT_WORKERS,
            worker_capacity: DEFAULT_CAPACITY,
            request_destination: DEFAULT_REQUEST_DESTINATION.to_owned(),
            response_destination: DEFAULT_RESPONSE_DESTINATION.to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

impl Config {
    /// Read and validate the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::Invalid(
                "cert_file and key_file must be set together".into(),
            ));
        }
        if self.ca_file.is_some() && self.cert_file.is_none() {
            return Err(ConfigError::Invalid("ca_file requires cert_file and key_file".into()));
        }
        for (name, value) in [
            ("max_frame_length", self.max_frame_length),
            ("workers", self.workers),
            ("worker_capacity", self.worker_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// TLS handshake timeout.
    #[must_use]
    pub fn ssl_handshake_timeout(&self) -> Duration { Duration::from_secs(self.ssl_handshake_timeout_secs) }

    /// Protocol detection timeout.
    #[must_use]
    pub fn detector_timeout(&self) -> Duration { Duration::from_secs(self.detector_timeout_secs) }

    /// Server TLS settings, or `None` when TLS is not configured.
    ///
    /// # Errors
    ///
    /// [`TlsError`] if the PEM files cannot be loaded.
    pub fn server_tls(&self) -> Result<Option<ServerTls>, TlsError> {
        let (Some(cert), Some(key)) = (&self.cert_file, &self.key_file) else {
            return Ok(None);
        };
        let tls = ServerTls::from_files(cert, key, self.ca_file.as_deref())?
            .with_handshake_timeout(self.ssl_handshake_timeout());
        Ok(Some(tls))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(text.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = write_config(r#"{"port": 4044, "workers": 2}"#);
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.port, 4044);
        assert_eq!(config.workers, 2);
        assert_eq!(config.host, Config::default().host);
        assert_eq!(config.detector_timeout(), DEFAULT_DETECTION_TIMEOUT);
        assert!(config.server_tls().expect("no tls").is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config(r#"{"prot": 1}"#);
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/hostwire.json")).expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[rstest]
    #[case::cert_without_key(r#"{"cert_file": "/tmp/cert.pem"}"#)]
    #[case::ca_without_cert(r#"{"ca_file": "/tmp/ca.pem"}"#)]
    #[case::zero_workers(r#"{"workers": 0}"#)]
    #[case::zero_frame_length(r#"{"max_frame_length": 0}"#)]
    fn inconsistent_settings_are_invalid(#[case] text: &str) {
        let file = write_config(text);
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))));
    }
}
