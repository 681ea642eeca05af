//! Agent configuration.
//!
//! Settings are layered: built-in defaults, then an optional file (YAML,
//! TOML or JSON by extension), then `AUTHZ_`-prefixed environment variables
//! (`AUTHZ_SERVER__ADDR`, `AUTHZ_POLICY__FILE`, ...). Command-line flags are
//! applied on top by the daemon before [`Config::validate`] runs.

use crate::{Error, Result};

use ::config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "AUTHZ";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Policy source settings
    pub policy: PolicyConfig,
    /// Request header names
    pub headers: HeaderConfig,
    /// Log output settings
    pub logging: LoggingConfig,
    /// Tracing export settings
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load defaults, then the optional file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load from the environment only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Check the assembled configuration.
    pub fn validate(&self) -> Result<()> {
        self.server.check_addrs()?;
        self.server.check_tls()?;
        self.policy.validate()?;
        self.headers.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the check endpoint
    pub addr: String,
    /// Address of the metrics and health endpoints
    pub monitoring_addr: String,
    /// Serve the check endpoint over TLS
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8282".to_string(),
            monitoring_addr: "0.0.0.0:9191".to_string(),
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Parsed check listener address.
    pub fn addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|_| Error::config_key(format!("invalid address `{}`", self.addr), "server.addr"))
    }

    /// Parsed monitoring listener address.
    pub fn monitoring_addr(&self) -> Result<SocketAddr> {
        self.monitoring_addr.parse().map_err(|_| {
            Error::config_key(
                format!("invalid address `{}`", self.monitoring_addr),
                "server.monitoring_addr",
            )
        })
    }

    fn check_addrs(&self) -> Result<()> {
        let addr = self.addr()?;
        let monitoring = self.monitoring_addr()?;
        if addr == monitoring && addr.port() != 0 {
            return Err(Error::config_key(
                "check and monitoring listeners must use different addresses",
                "server.monitoring_addr",
            ));
        }
        Ok(())
    }

    fn check_tls(&self) -> Result<()> {
        let Some(tls) = &self.tls else {
            return Ok(());
        };
        for (key, path) in [
            ("server.tls.cert_file", &tls.cert_file),
            ("server.tls.key_file", &tls.key_file),
        ] {
            if path.as_os_str().is_empty() {
                return Err(Error::config_key("TLS needs both a certificate and a private key", key));
            }
            if !path.is_file() {
                return Err(Error::config_key(format!("{} is not a readable file", path.display()), key));
            }
        }
        Ok(())
    }
}

/// PEM files for the check listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate chain
    pub cert_file: PathBuf,
    /// Private key
    pub key_file: PathBuf,
}

/// Policy source settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Policy document (YAML or JSON)
    pub file: Option<PathBuf>,
    /// Structured data file, replacing the document's inline `data`
    pub data_file: Option<PathBuf>,
    /// Seconds between reloads of the files; 0 disables reloading
    pub reload_interval_secs: u64,
}

impl PolicyConfig {
    /// Reload interval, if reloading is enabled.
    pub fn reload_interval(&self) -> Option<Duration> {
        match self.reload_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.file.is_none() {
            if self.data_file.is_some() {
                return Err(Error::config_key("data_file requires a policy file", "policy.data_file"));
            }
            if self.reload_interval_secs > 0 {
                return Err(Error::config_key(
                    "reloading requires a policy file",
                    "policy.reload_interval_secs",
                ));
            }
        }
        Ok(())
    }
}

/// Names of the headers a check request carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Path being authorized
    pub path: String,
    /// Method being authorized
    pub method: String,
    /// Caller identity
    pub source: String,
    /// Bearer token
    pub token: String,
    /// Deny requests without a source header
    pub require_source: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            path: "x-path".to_string(),
            method: "x-method".to_string(),
            source: "x-source".to_string(),
            token: "token".to_string(),
            require_source: true,
        }
    }
}

impl HeaderConfig {
    fn validate(&self) -> Result<()> {
        let names = [
            ("headers.path", &self.path),
            ("headers.method", &self.method),
            ("headers.source", &self.source),
            ("headers.token", &self.token),
        ];
        for (i, (key, name)) in names.iter().enumerate() {
            if axum::http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(Error::config_key(format!("invalid header name `{}`", name), *key));
            }
            if names[..i].iter().any(|(_, other)| other.eq_ignore_ascii_case(name)) {
                return Err(Error::config_key(format!("header `{}` is used twice", name), *key));
            }
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `authz_engine=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Log one audit line per decision
    pub audit: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            audit: true,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        tracing_subscriber::EnvFilter::try_new(&self.level)
            .map(|_| ())
            .map_err(|e| Error::config_key(format!("invalid log filter: {}", e), "logging.level"))
    }
}

/// Tracing export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Install the OpenTelemetry layer when an OTLP endpoint is set
    pub enabled: bool,
    /// `service.name` resource attribute
    pub service_name: String,
    /// OTLP gRPC collector endpoint; unset disables span export
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "authz-engine".to_string(),
            otlp_endpoint: None,
        }
    }
}
