//! Command line surface.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};

use crate::app::{AppConfig, UpstreamConfig};
use crate::dial::UpstreamMode;
use crate::endpoint::{Credential, Protocol};
use crate::ipinfo;

/// Probe mode: `auto` stops at the first protocol that works per endpoint,
/// `all` tries every protocol, the rest pin a single protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Auto,
    All,
    Http,
    Https,
    #[value(alias = "s5")]
    Socks5,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::All => "all",
            Mode::Http => "http",
            Mode::Https => "https",
            Mode::Socks5 => "socks5",
        }
    }

    /// The single protocol probed in fixed modes.
    pub fn fixed_protocol(self) -> Option<Protocol> {
        match self {
            Mode::Http => Some(Protocol::Http),
            Mode::Https => Some(Protocol::Https),
            Mode::Socks5 => Some(Protocol::Socks5),
            Mode::Auto | Mode::All => None,
        }
    }

    fn implied_default_port(self) -> Option<u16> {
        match self {
            Mode::Http => Some(80),
            Mode::Https => Some(443),
            Mode::Socks5 => Some(1080),
            Mode::Auto | Mode::All => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command line options
#[derive(Parser, Debug, Clone)]
#[command(name = "proxyvet", version, about)]
pub struct Cli {
    /// Proxy list file (one per line: IP / host:port / URL / user:pass@host:port)
    #[arg(short = 'i', long = "ip", value_name = "FILE")]
    pub input: PathBuf,

    /// Port for lines that carry none (e.g. 443)
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Output file for working proxies; auto-generated when empty
    #[arg(short = 'o', long = "out")]
    pub out: Option<PathBuf>,

    /// Probe mode
    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    pub mode: Mode,

    /// Per-probe timeout
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub timeout: Duration,

    /// Delay after each finished endpoint
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub delay: Duration,

    /// Concurrency (0 = auto-size from CPU, memory and FD limits)
    #[arg(short = 'c', long, default_value_t = 0)]
    pub concurrency: usize,

    /// Progress line interval
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    pub progress: Duration,

    /// Optional credential file, user:pass per line
    #[arg(long)]
    pub auth: Option<PathBuf>,

    /// Memory budget ratio for auto-sized concurrency (0-1)
    #[arg(long, default_value_t = 0.55)]
    pub mem_budget: f64,

    /// Estimated bytes per in-flight job for auto-sized concurrency
    #[arg(long, default_value_t = 256 * 1024)]
    pub mem_per_job: i64,

    /// Allocator memory-limit ratio (advisory)
    #[arg(long, default_value_t = 0.75)]
    pub gc_limit: f64,

    /// Drop memory/FD/admission safety limits
    #[arg(long = "unsafe")]
    pub unsafe_mode: bool,

    /// Skip endpoints inside known CDN ranges (fetched at startup)
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub skip_cdn: bool,

    /// Optional upstream proxy host:port
    #[arg(long)]
    pub upstream: Option<String>,

    /// Upstream proxy protocol: s5/http/https
    #[arg(long, default_value = "s5")]
    pub upstream_mode: String,

    /// Optional upstream credential user:pass
    #[arg(long)]
    pub upstream_auth: Option<String>,

    /// Log one FAIL line per failed endpoint
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// IP intelligence endpoint fetched through each proxy
    #[arg(long, default_value = ipinfo::PRIMARY_IPAPI)]
    pub intel_url: String,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn into_config(self) -> Result<AppConfig> {
        let default_port = self.port.or(self.mode.implied_default_port());
        let output = self.out.unwrap_or_else(|| {
            let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
            let port = default_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "auto".into());
            PathBuf::from(format!("result_mode-{}_port-{}_{}.txt", self.mode, port, ts))
        });

        let upstream = match self.upstream {
            Some(addr) if !addr.trim().is_empty() => {
                let job = crate::parse::parse_line(addr.trim(), None)
                    .with_context(|| format!("invalid upstream address {addr:?}"))?;
                let auth = self
                    .upstream_auth
                    .as_deref()
                    .and_then(|s| s.split_once(':'))
                    .map(|(u, p)| Credential::new(u, p));
                Some(UpstreamConfig {
                    endpoint: job.endpoint,
                    mode: UpstreamMode::parse(&self.upstream_mode)?,
                    auth,
                })
            }
            _ => None,
        };

        let mut cfg = AppConfig::new(self.input, output);
        cfg.mode = self.mode;
        cfg.default_port = default_port;
        cfg.timeout = self.timeout;
        cfg.delay = self.delay;
        cfg.concurrency = self.concurrency;
        cfg.progress_every = self.progress;
        cfg.auth_file = self.auth;
        if self.mem_budget > 0.0 && self.mem_budget <= 1.0 {
            cfg.mem_budget = self.mem_budget;
        }
        if self.mem_per_job > 0 {
            cfg.mem_per_job = self.mem_per_job;
        }
        cfg.gc_limit = self.gc_limit.clamp(0.0, 1.0);
        cfg.unsafe_mode = self.unsafe_mode;
        cfg.skip_cdn = self.skip_cdn;
        cfg.upstream = upstream;
        cfg.verbose = self.verbose;
        cfg.intel_url = self.intel_url;
        Ok(cfg)
    }
}
