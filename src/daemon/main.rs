//! Authorization Agent
//!
//! A standalone daemon that answers HTTP authorization checks against a
//! compiled policy file.

use authz_engine::config::TlsConfig;
use authz_engine::server::{self, shutdown_signal};
use authz_engine::telemetry::init_tracing;
use authz_engine::{AuthzEngine, Config, Result};

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Authorization Agent
#[derive(Parser, Debug)]
#[command(name = "authz-agent")]
#[command(about = "Low-latency path-pattern authorization decisions over HTTP")]
#[command(version)]
struct Args {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "AUTHZ_CONFIG")]
    config: Option<PathBuf>,

    /// Policy file to load
    #[arg(short = 'f', long, env = "AUTHZ_POLICY_FILE")]
    policy_file: Option<PathBuf>,

    /// Structured data file for json predicates
    #[arg(short, long)]
    data_file: Option<PathBuf>,

    /// Check listener address
    #[arg(long)]
    addr: Option<String>,

    /// Metrics and health listener address
    #[arg(long)]
    monitoring_addr: Option<String>,

    /// PEM certificate chain for the check listener
    #[arg(long, env = "AUTHZ_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the check listener
    #[arg(long, env = "AUTHZ_TLS_PRIVATE_KEY")]
    tls_private_key: Option<PathBuf>,

    /// Serve plain HTTP even if TLS files are configured
    #[arg(long, conflicts_with_all = ["tls_cert", "tls_private_key"])]
    tls_disable: bool,

    /// Seconds between policy reloads; 0 disables reloading
    #[arg(long)]
    reload_interval: Option<u64>,

    /// Log filter, e.g. `info` or `authz_engine=debug`
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// OTLP collector endpoint for span export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Disable per-decision audit lines
    #[arg(long)]
    no_audit: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(file) = self.policy_file {
            config.policy.file = Some(file);
        }
        if let Some(file) = self.data_file {
            config.policy.data_file = Some(file);
        }
        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(addr) = self.monitoring_addr {
            config.server.monitoring_addr = addr;
        }
        if self.tls_disable {
            config.server.tls = None;
        } else if self.tls_cert.is_some() || self.tls_private_key.is_some() {
            let current = config.server.tls.take().unwrap_or_default();
            config.server.tls = Some(TlsConfig {
                cert_file: self.tls_cert.unwrap_or(current.cert_file),
                key_file: self.tls_private_key.unwrap_or(current.key_file),
            });
        }
        if let Some(secs) = self.reload_interval {
            config.policy.reload_interval_secs = secs;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.json_logs {
            config.logging.json = true;
        }
        if let Some(endpoint) = self.otlp_endpoint {
            config.telemetry.otlp_endpoint = Some(endpoint);
        }
        if self.no_audit {
            config.logging.audit = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration, then apply command line overrides
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let _guard = init_tracing(&config.logging, &config.telemetry)?;

    info!("Starting Authorization Agent v{}", authz_engine::VERSION);

    let engine = Arc::new(AuthzEngine::builder().with_config(&config).build()?);
    let summary = engine.summary();
    info!(
        rules = summary.rules,
        policy = summary.name.as_deref().unwrap_or("unnamed"),
        file = summary.file.as_deref().unwrap_or("none"),
        "Policy compiled"
    );

    let reloader = config
        .policy
        .reload_interval()
        .and_then(|interval| engine.spawn_reloader(interval));

    server::serve(engine, &config, shutdown_signal()).await?;

    if let Some(handle) = reloader {
        handle.abort();
    }

    info!("Authorization Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn apply(args: &[&str], config: &mut Config) {
        let mut argv = vec!["authz-agent"];
        argv.extend_from_slice(args);
        Args::parse_from(argv).apply(config);
    }

    #[test]
    fn test_tls_flags() {
        let mut config = Config::default();
        apply(&["--tls-cert", "/tls/a.crt", "--tls-private-key", "/tls/a.key"], &mut config);
        let tls = config.server.tls.clone().unwrap();
        assert_eq!(tls.cert_file, Path::new("/tls/a.crt"));
        assert_eq!(tls.key_file, Path::new("/tls/a.key"));

        // One flag overrides one file of the configured pair.
        apply(&["--tls-cert", "/tls/b.crt"], &mut config);
        let tls = config.server.tls.clone().unwrap();
        assert_eq!(tls.cert_file, Path::new("/tls/b.crt"));
        assert_eq!(tls.key_file, Path::new("/tls/a.key"));

        apply(&["--tls-disable"], &mut config);
        assert!(config.server.tls.is_none());
    }

    #[test]
    fn test_lone_tls_flag_fails_validation() {
        let mut config = Config::default();
        apply(&["--tls-cert", "/tls/a.crt"], &mut config);
        assert!(config.validate().is_err());

        assert!(Args::try_parse_from(["authz-agent", "--tls-disable", "--tls-cert", "x"]).is_err());
    }
}
