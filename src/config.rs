use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Daemon configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// NFQUEUE number for IPv4 flows.
    #[serde(default = "default_queue_v4")]
    pub queue_v4: u16,

    /// NFQUEUE number for IPv6 flows.
    #[serde(default = "default_queue_v6")]
    pub queue_v6: u16,

    /// MaxMind country database path.
    #[serde(default = "default_country_db")]
    pub country_db: String,

    /// MaxMind ASN database path.
    #[serde(default = "default_asn_db")]
    pub asn_db: String,

    /// Append-only text log file.
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Seconds a cached verdict stays valid for its flow.
    #[serde(default = "default_verdict_ttl")]
    pub verdict_ttl_seconds: u64,

    /// Seconds an inode-to-process resolution stays cached.
    #[serde(default = "default_process_ttl")]
    pub process_ttl_seconds: u64,

    /// Seconds before an idle connection record is dropped from the registry.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,

    /// Bytes of each packet copied to user space.
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: u16,

    /// Kernel-side queue length.
    #[serde(default = "default_queue_max_len")]
    pub queue_max_len: u32,

    /// Concurrent pipeline bound per worker.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Enable reverse DNS resolution for connection records.
    #[serde(default)]
    pub resolve_dns: bool,

    /// Inspection endpoint bind address (feature `inspect`).
    #[serde(default = "default_api_listen")]
    pub api_listen: String,

    /// CIDRs allowed to reach the inspection endpoint (empty = allow all).
    #[serde(default)]
    pub api_allowed_ips: Vec<String>,
}

fn default_queue_v4() -> u16 {
    17040
}

fn default_queue_v6() -> u16 {
    17060
}

fn default_country_db() -> String {
    "/var/lib/netmonitor/GeoLite2-Country.mmdb".to_string()
}

fn default_asn_db() -> String {
    "/var/lib/netmonitor/GeoLite2-ASN.mmdb".to_string()
}

fn default_log_file() -> String {
    "netmonitor.log".to_string()
}

fn default_verdict_ttl() -> u64 {
    300
}

fn default_process_ttl() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    600
}

fn default_max_packet_len() -> u16 {
    1600
}

fn default_queue_max_len() -> u32 {
    0xffff
}

fn default_capacity() -> usize {
    5000
}

fn default_api_listen() -> String {
    "127.0.0.1:17055".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_v4: default_queue_v4(),
            queue_v6: default_queue_v6(),
            country_db: default_country_db(),
            asn_db: default_asn_db(),
            log_file: default_log_file(),
            quiet: false,
            verdict_ttl_seconds: default_verdict_ttl(),
            process_ttl_seconds: default_process_ttl(),
            connection_timeout: default_connection_timeout(),
            max_packet_len: default_max_packet_len(),
            queue_max_len: default_queue_max_len(),
            capacity: default_capacity(),
            resolve_dns: false,
            api_listen: default_api_listen(),
            api_allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(queue_v4) = cli.queue_v4 {
            self.queue_v4 = queue_v4;
        }
        if let Some(queue_v6) = cli.queue_v6 {
            self.queue_v6 = queue_v6;
        }
        if let Some(ref country_db) = cli.country_db {
            self.country_db = country_db.clone();
        }
        if let Some(ref asn_db) = cli.asn_db {
            self.asn_db = asn_db.clone();
        }
        if let Some(ref log_file) = cli.log_file {
            self.log_file = log_file.clone();
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.resolve_dns {
            self.resolve_dns = true;
        }
        if let Some(ref api_listen) = cli.api_listen {
            self.api_listen = api_listen.clone();
        }
    }
}

use clap::Parser;

/// netmonitor: NFQUEUE-based network monitor and policy enforcement daemon
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// NFQUEUE number for IPv4 flows.
    #[arg(long)]
    pub queue_v4: Option<u16>,

    /// NFQUEUE number for IPv6 flows.
    #[arg(long)]
    pub queue_v6: Option<u16>,

    /// MaxMind country database path.
    #[arg(long)]
    pub country_db: Option<String>,

    /// MaxMind ASN database path.
    #[arg(long)]
    pub asn_db: Option<String>,

    /// Log file path.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Enable reverse DNS resolution for connection records.
    #[arg(long)]
    pub resolve_dns: bool,

    /// Inspection endpoint bind address.
    #[arg(long)]
    pub api_listen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.queue_v4, 17040);
        assert_eq!(config.queue_v6, 17060);
        assert_eq!(config.verdict_ttl_seconds, 300);
        assert_eq!(config.capacity, 5000);
        assert_eq!(config.max_packet_len, 1600);
        assert_eq!(config.log_file, "netmonitor.log");
        assert!(config.api_listen.starts_with("127.0.0.1"));
    }

    #[test]
    fn test_yaml_overrides_and_defaults() {
        let yaml = "queue_v4: 100\nresolve_dns: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.queue_v4, 100);
        assert_eq!(config.queue_v6, 17060);
        assert!(config.resolve_dns);
    }

    #[test]
    fn test_cli_takes_precedence() {
        let mut config = Config::default();
        let cli = CliArgs {
            config: None,
            queue_v4: Some(4100),
            queue_v6: None,
            country_db: Some("/tmp/country.mmdb".into()),
            asn_db: None,
            log_file: None,
            quiet: true,
            resolve_dns: false,
            api_listen: None,
        };
        config.merge_cli(&cli);
        assert_eq!(config.queue_v4, 4100);
        assert_eq!(config.queue_v6, 17060);
        assert_eq!(config.country_db, "/tmp/country.mmdb");
        assert!(config.quiet);
        assert!(!config.resolve_dns);
    }
}
