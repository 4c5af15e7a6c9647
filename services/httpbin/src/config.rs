//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Env vars are handled by clap (`HTTPBIN_*`), so every CLI flag has an env
//! counterpart. The TOML file is optional and only read when `--config` or
//! `HTTPBIN_CONFIG` names one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080);
const DEFAULT_VERSION: &str = "v1";

/// Command-line interface.
///
/// Every option is optional so that unset flags fall through to the config
/// file and then to the defaults. `--version` is the reported service version,
/// so clap's own version flag is disabled.
#[derive(Debug, Parser)]
#[command(
    name = "httpbin",
    about = "Diagnostic HTTP server for exercising proxies, retries and timeouts",
    disable_version_flag = true
)]
pub struct Cli {
    /// The addr this server listens on (`:8080` binds all interfaces)
    #[arg(long, env = "HTTPBIN_ADDR", value_parser = parse_listen_addr)]
    pub addr: Option<SocketAddr>,

    /// Service version reported by /version
    #[arg(long, env = "HTTPBIN_VERSION")]
    pub version: Option<String>,

    /// Serve HTTPS with the certificate under /etc/httpbin/tls
    #[arg(long, env = "HTTPBIN_TLS")]
    pub tls: bool,

    /// Require client certificates signed by /etc/httpbin/ca/ca.crt (needs --tls)
    #[arg(long, env = "HTTPBIN_VERIFY_CLIENT")]
    pub verify_client: bool,

    /// Optional TOML config file
    #[arg(long, env = "HTTPBIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Upper bound for /timeout sleeps in seconds (unbounded when unset)
    #[arg(long, env = "HTTPBIN_MAX_TIMEOUT_SECS")]
    pub max_timeout_secs: Option<u64>,

    /// Failures /retry serves before each success
    #[arg(long, env = "HTTPBIN_RETRY_FAILURES")]
    pub retry_failures: Option<u32>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "HTTPBIN_METRICS_ADDR", value_parser = parse_listen_addr)]
    pub metrics_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, env = "HTTPBIN_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// TLS switches. Certificate locations are fixed (see `tls::TlsPaths`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsOptions {
    pub enable: bool,
    pub verify_client: bool,
}

/// Resolved configuration, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub version: String,
    pub tls: TlsOptions,
    /// `None` keeps /timeout unbounded.
    pub max_timeout: Option<Duration>,
    pub retry_failures: u32,
    pub metrics_addr: Option<SocketAddr>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_ADDR,
            version: DEFAULT_VERSION.to_owned(),
            tls: TlsOptions::default(),
            max_timeout: None,
            retry_failures: fault_injection::DEFAULT_FAILURES,
            metrics_addr: None,
            log_format: LogFormat::default(),
        }
    }
}

/// On-disk TOML layout. All fields optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: ServerSection,
    tls: TlsOptions,
    fault: FaultSection,
    observability: ObservabilitySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    listen_addr: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FaultSection {
    retry_failures: Option<u32>,
    max_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ObservabilitySection {
    metrics_addr: Option<String>,
    log_format: Option<LogFormat>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(toml::from_str(&contents)?)
    }
}

impl Config {
    /// Merge CLI/env values over the optional config file and defaults, then validate.
    pub fn resolve(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let defaults = Config::default();

        let file_listen_addr = file
            .server
            .listen_addr
            .as_deref()
            .map(parse_listen_addr)
            .transpose()
            .map_err(|e| Error::Config(format!("server.listen_addr: {e}")))?;
        let file_metrics_addr = file
            .observability
            .metrics_addr
            .as_deref()
            .map(parse_listen_addr)
            .transpose()
            .map_err(|e| Error::Config(format!("observability.metrics_addr: {e}")))?;

        let config = Config {
            listen_addr: cli
                .addr
                .or(file_listen_addr)
                .unwrap_or(defaults.listen_addr),
            version: cli
                .version
                .or(file.server.version)
                .unwrap_or(defaults.version),
            tls: TlsOptions {
                enable: cli.tls || file.tls.enable,
                verify_client: cli.verify_client || file.tls.verify_client,
            },
            max_timeout: cli
                .max_timeout_secs
                .or(file.fault.max_timeout_secs)
                .map(|secs| {
                    if secs == 0 {
                        Err(Error::Config(
                            "max_timeout_secs must be greater than 0".into(),
                        ))
                    } else {
                        Ok(Duration::from_secs(secs))
                    }
                })
                .transpose()?,
            retry_failures: cli
                .retry_failures
                .or(file.fault.retry_failures)
                .unwrap_or(defaults.retry_failures),
            metrics_addr: cli.metrics_addr.or(file_metrics_addr),
            log_format: cli
                .log_format
                .or(file.observability.log_format)
                .unwrap_or(defaults.log_format),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tls.verify_client && !self.tls.enable {
            return Err(Error::Config(
                "verify_client requires TLS to be enabled".into(),
            ));
        }

        if self.metrics_addr == Some(self.listen_addr) {
            return Err(Error::Config(format!(
                "metrics_addr must differ from listen_addr ({})",
                self.listen_addr
            )));
        }

        Ok(())
    }
}

/// Parse a listen address. A bare `:port` binds every IPv4 interface.
pub fn parse_listen_addr(raw: &str) -> std::result::Result<SocketAddr, String> {
    let raw = raw.trim();
    let candidate = match raw.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => raw.to_owned(),
    };
    candidate
        .parse()
        .map_err(|e| format!("invalid listen address {raw:?}: {e}"))
}
