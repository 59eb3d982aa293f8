//! Configuration management for the pool
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON) with validation and defaults.

use crate::job::CoinFamily;
use crate::round::RewardScheme;
use crate::store::{Aggregation, DownsampleRule, MetricsRetention};
use crate::stratum::ReactorConfig;
use crate::vardiff::VardiffConfig;
use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Complete configuration for the pool
#[derive(Debug, Clone, PartialEq, Parser, Serialize, Deserialize)]
#[command(
    name = "stratum-pool",
    version = env!("CARGO_PKG_VERSION"),
    about = "Stratum v1 mining pool backend",
    long_about = "A mining pool backend: Stratum v1 server, share validation, vardiff, PROP/PPLNS accounting and block maturity tracking"
)]
pub struct Config {
    /// Print the effective configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long, env = "POOL_LOG_LEVEL", default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, default_value = "text")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write logs to daily-rotated files at this path
    #[arg(long, value_name = "FILE")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Runtime worker threads (default: CPU count)
    #[arg(long)]
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Coin family of the chain being mined
    #[arg(long, default_value = "bitcoin")]
    #[serde(default = "default_coin_family")]
    pub coin_family: CoinFamily,

    /// Stratum server interface
    #[arg(long, default_value = "0.0.0.0")]
    #[serde(default = "default_stratum_interface")]
    pub stratum_interface: String,

    /// Stratum server port
    #[arg(short = 'p', long, default_value = "3333")]
    #[serde(default = "default_stratum_port")]
    pub stratum_port: u16,

    /// Maximum concurrent miner connections
    #[arg(long, default_value = "10000")]
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle time before a silent connection's timer expires
    #[arg(long, default_value = "5m")]
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    /// Consecutive idle expirations before disconnecting
    #[arg(long, default_value = "2")]
    #[serde(default = "default_max_expirations")]
    pub max_expirations: u32,

    /// Control channel interface (loopback only)
    #[arg(long, default_value = "127.0.0.1")]
    #[serde(default = "default_control_interface")]
    pub control_interface: String,

    /// Control channel port
    #[arg(long, default_value = "3334")]
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Node JSON-RPC URL
    #[arg(short = 'n', long, env = "POOL_NODE_URL", default_value = "http://127.0.0.1:8332")]
    #[serde(default = "default_node_url")]
    pub node_url: String,

    /// Node RPC user
    #[arg(long, env = "POOL_RPC_USER")]
    #[serde(default)]
    pub rpc_user: Option<String>,

    /// Node RPC password
    #[arg(long, env = "POOL_RPC_PASSWORD", hide_env_values = true)]
    #[serde(default, skip_serializing)]
    pub rpc_password: Option<String>,

    /// Node RPC timeout
    #[arg(long, default_value = "30s")]
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: String,

    /// Accept self-signed TLS certificates from the node
    #[arg(short = 'x', long)]
    #[serde(default)]
    pub insecure: bool,

    /// Address receiving block rewards
    #[arg(short = 'a', long, env = "POOL_PAYOUT_ADDRESS")]
    #[serde(default)]
    pub payout_address: Option<String>,

    /// Tag written into every coinbase
    #[arg(long, default_value = "stratum-pool")]
    #[serde(default = "default_pool_tag")]
    pub pool_tag: String,

    /// Pool fee as a fraction of each block reward
    #[arg(long, default_value = "0.01")]
    #[serde(default = "default_pool_fee")]
    pub pool_fee: f64,

    /// Reward scheme
    #[arg(long, default_value = "prop")]
    #[serde(default = "default_reward_scheme")]
    pub reward_scheme: RewardScheme,

    /// PPLNS window in difficulty units
    #[arg(long, default_value = "1000000")]
    #[serde(default = "default_pplns_window")]
    pub pplns_window: f64,

    /// Difficulty assigned to new sessions
    #[arg(long, default_value = "16")]
    #[serde(default = "default_initial_difficulty")]
    pub initial_difficulty: f64,

    /// Lowest difficulty vardiff may assign
    #[arg(long, default_value = "1")]
    #[serde(default = "default_min_difficulty")]
    pub min_difficulty: f64,

    /// Highest difficulty vardiff may assign
    #[arg(long, default_value = "1000000000000")]
    #[serde(default = "default_max_difficulty")]
    pub max_difficulty: f64,

    /// Share rate vardiff steers each session towards
    #[arg(long, default_value = "20")]
    #[serde(default = "default_target_shares_per_minute")]
    pub target_shares_per_minute: f64,

    /// Time between vardiff checks
    #[arg(long, default_value = "90s")]
    #[serde(default = "default_retarget_interval")]
    pub retarget_interval: String,

    /// Relative change below which vardiff keeps the current difficulty
    #[arg(long, default_value = "0.1")]
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,

    /// Largest factor one retarget may apply
    #[arg(long, default_value = "8")]
    #[serde(default = "default_max_retarget_factor")]
    pub max_retarget_factor: f64,

    /// Fraction below session difficulty still accepted
    #[arg(long, default_value = "0.01")]
    #[serde(default = "default_low_difficulty_tolerance")]
    pub low_difficulty_tolerance: f64,

    /// Template poll interval
    #[arg(long, default_value = "5s")]
    #[serde(default = "default_template_refresh")]
    pub template_refresh: String,

    /// Largest serialized block the pool builds
    #[arg(long, default_value = "2000000")]
    #[serde(default = "default_max_block_bytes")]
    pub max_block_bytes: usize,

    /// Bytes reserved for the coinbase transaction
    #[arg(long, default_value = "1000")]
    #[serde(default = "default_coinbase_reserve_bytes")]
    pub coinbase_reserve_bytes: usize,

    /// How far ahead of the pool clock a share's time may be
    #[arg(long, default_value = "2h")]
    #[serde(default = "default_max_future_skew")]
    pub max_future_skew: String,

    /// Jobs kept live for submissions; reaching it publishes the next job as clean
    #[arg(long, default_value = "16")]
    #[serde(default = "default_max_live_jobs")]
    pub max_live_jobs: usize,

    /// Share fingerprints remembered per session
    #[arg(long, default_value = "4096")]
    #[serde(default = "default_duplicate_capacity")]
    pub duplicate_capacity: usize,

    /// Attempts when submitting a block
    #[arg(long, default_value = "3")]
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: usize,

    /// Confirmations before a block's payouts mature
    #[arg(long, default_value = "100")]
    #[serde(default = "default_maturity_depth")]
    pub maturity_depth: u64,

    /// Interval between maturity polls
    #[arg(long, default_value = "1m")]
    #[serde(default = "default_maturity_interval")]
    pub maturity_interval: String,

    /// Interval between hashrate samples
    #[arg(long, default_value = "1m")]
    #[serde(default = "default_stats_interval")]
    pub stats_interval: String,

    /// How long hashrate samples are kept
    #[arg(long, default_value = "7days")]
    #[serde(default = "default_metrics_retention")]
    pub metrics_retention: String,

    /// Bucket width for down-sampled hashrate series
    #[arg(long, value_name = "DURATION")]
    #[serde(default)]
    pub metrics_downsample: Option<String>,

    /// Aggregation applied within each down-sampling bucket
    #[arg(long, value_enum, default_value = "avg")]
    #[serde(default = "default_metrics_aggregation")]
    pub metrics_aggregation: Aggregation,
}

/// Apply file values to every field the command line left at its default
macro_rules! merge_defaults {
    ($cli:ident, $file:ident, $defaults:ident, [$($field:ident),* $(,)?]) => {
        $(
            if $cli.$field == $defaults.$field {
                $cli.$field = $file.$field;
            }
        )*
    };
}

impl Config {
    /// Parse the command line, merge the config file and validate
    pub async fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(config_file) = &config.config_file {
            let file_config = Self::load_from_file(config_file).await?;
            config = config.merge_with_file(file_config)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge CLI config with file config (explicit CLI values take precedence)
    fn merge_with_file(mut self, file: Self) -> Result<Self> {
        let defaults = Self::try_parse_from([crate::APP_NAME])
            .map_err(|e| Error::config(format!("Failed to build defaults: {}", e)))?;
        let cli = &mut self;

        merge_defaults!(cli, file, defaults, [
            log_level,
            log_format,
            log_file,
            worker_threads,
            coin_family,
            stratum_interface,
            stratum_port,
            max_connections,
            idle_timeout,
            max_expirations,
            control_interface,
            control_port,
            node_url,
            rpc_user,
            rpc_password,
            rpc_timeout,
            insecure,
            payout_address,
            pool_tag,
            pool_fee,
            reward_scheme,
            pplns_window,
            initial_difficulty,
            min_difficulty,
            max_difficulty,
            target_shares_per_minute,
            retarget_interval,
            variance_threshold,
            max_retarget_factor,
            low_difficulty_tolerance,
            template_refresh,
            max_block_bytes,
            coinbase_reserve_bytes,
            max_future_skew,
            max_live_jobs,
            duplicate_capacity,
            submit_attempts,
            maturity_depth,
            maturity_interval,
            stats_interval,
            metrics_retention,
            metrics_downsample,
            metrics_aggregation,
        ]);

        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.node_url).map_err(|e| Error::config(format!("Invalid node URL: {}", e)))?;

        match &self.payout_address {
            Some(address) if !address.trim().is_empty() => {}
            _ => return Err(Error::config("A payout address is required")),
        }

        self.stratum_socket_addr()?;
        let control = self.control_socket_addr()?;
        if !control.ip().is_loopback() {
            return Err(Error::config("Control interface must be a loopback address"));
        }

        for (name, value) in [
            ("idle-timeout", &self.idle_timeout),
            ("rpc-timeout", &self.rpc_timeout),
            ("retarget-interval", &self.retarget_interval),
            ("template-refresh", &self.template_refresh),
            ("max-future-skew", &self.max_future_skew),
            ("maturity-interval", &self.maturity_interval),
            ("stats-interval", &self.stats_interval),
            ("metrics-retention", &self.metrics_retention),
        ] {
            let duration = parse_duration(name, value)?;
            if duration.is_zero() && name != "max-future-skew" {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }

        if let Some(bucket) = &self.metrics_downsample {
            if parse_duration("metrics-downsample", bucket)?.is_zero() {
                return Err(Error::config("metrics-downsample must be greater than zero"));
            }
        }

        if self.max_connections == 0 {
            return Err(Error::config("Max connections must be greater than 0"));
        }
        if self.max_expirations == 0 {
            return Err(Error::config("Max expirations must be greater than 0"));
        }
        if self.worker_threads == Some(0) {
            return Err(Error::config("Worker threads must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.pool_fee) {
            return Err(Error::config("Pool fee must be in [0, 1)"));
        }
        if self.reward_scheme == RewardScheme::Pplns && !(self.pplns_window > 0.0) {
            return Err(Error::config("PPLNS window must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.low_difficulty_tolerance) {
            return Err(Error::config("Low difficulty tolerance must be in [0, 1)"));
        }

        let vardiff = self.vardiff()?;
        vardiff.validate()?;
        if self.initial_difficulty < vardiff.min_difficulty
            || self.initial_difficulty > vardiff.max_difficulty
        {
            return Err(Error::config(
                "Initial difficulty must lie between min and max difficulty",
            ));
        }

        if self.coinbase_reserve_bytes + self.coin_family.header_reserve() >= self.max_block_bytes {
            return Err(Error::config(
                "Max block bytes must exceed the header and coinbase reserve",
            ));
        }
        if self.max_live_jobs == 0 {
            return Err(Error::config("Max live jobs must be greater than 0"));
        }
        if self.duplicate_capacity == 0 {
            return Err(Error::config("Duplicate capacity must be greater than 0"));
        }
        if self.submit_attempts == 0 {
            return Err(Error::config("Submit attempts must be greater than 0"));
        }
        if self.maturity_depth == 0 {
            return Err(Error::config("Maturity depth must be greater than 0"));
        }

        Ok(())
    }

    /// Runtime worker threads
    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get)
    }

    /// Get stratum socket address
    pub fn stratum_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .stratum_interface
            .parse()
            .map_err(|e| Error::config(format!("Invalid stratum interface: {}", e)))?;
        Ok(SocketAddr::new(ip, self.stratum_port))
    }

    /// Get control socket address
    pub fn control_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .control_interface
            .parse()
            .map_err(|e| Error::config(format!("Invalid control interface: {}", e)))?;
        Ok(SocketAddr::new(ip, self.control_port))
    }

    /// Payout address; present once validated
    pub fn payout_address(&self) -> Result<&str> {
        self.payout_address
            .as_deref()
            .ok_or_else(|| Error::config("A payout address is required"))
    }

    /// Socket limits for the reactor
    pub fn reactor(&self) -> Result<ReactorConfig> {
        Ok(ReactorConfig {
            max_connections: self.max_connections,
            idle_timeout: parse_duration("idle-timeout", &self.idle_timeout)?,
            max_expirations: self.max_expirations,
            ..ReactorConfig::default()
        })
    }

    /// Vardiff policy
    pub fn vardiff(&self) -> Result<VardiffConfig> {
        Ok(VardiffConfig {
            target_shares_per_minute: self.target_shares_per_minute,
            min_difficulty: self.min_difficulty,
            max_difficulty: self.max_difficulty,
            variance: self.variance_threshold,
            max_factor: self.max_retarget_factor,
            retarget_interval: self.retarget_interval_duration()?,
        })
    }

    /// Metrics retention applied to every series
    pub fn retention(&self) -> Result<MetricsRetention> {
        Ok(MetricsRetention {
            retention: parse_duration("metrics-retention", &self.metrics_retention)?,
            downsample: self
                .metrics_downsample
                .as_deref()
                .map(|bucket| {
                    Ok::<_, Error>(DownsampleRule {
                        bucket: parse_duration("metrics-downsample", bucket)?,
                        aggregation: self.metrics_aggregation,
                    })
                })
                .transpose()?,
        })
    }

    pub fn rpc_timeout_duration(&self) -> Result<Duration> {
        parse_duration("rpc-timeout", &self.rpc_timeout)
    }

    pub fn retarget_interval_duration(&self) -> Result<Duration> {
        parse_duration("retarget-interval", &self.retarget_interval)
    }

    pub fn template_refresh_duration(&self) -> Result<Duration> {
        parse_duration("template-refresh", &self.template_refresh)
    }

    pub fn max_future_skew_duration(&self) -> Result<Duration> {
        parse_duration("max-future-skew", &self.max_future_skew)
    }

    pub fn maturity_interval_duration(&self) -> Result<Duration> {
        parse_duration("maturity-interval", &self.maturity_interval)
    }

    pub fn stats_interval_duration(&self) -> Result<Duration> {
        parse_duration("stats-interval", &self.stats_interval)
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::config(format!("Invalid {} '{}': {}", name, value, e)))
}

// Default value functions for serde
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Text }
fn default_coin_family() -> CoinFamily { CoinFamily::Bitcoin }
fn default_stratum_interface() -> String { "0.0.0.0".to_string() }
fn default_stratum_port() -> u16 { 3333 }
fn default_max_connections() -> usize { 10_000 }
fn default_idle_timeout() -> String { "5m".to_string() }
fn default_max_expirations() -> u32 { 2 }
fn default_control_interface() -> String { "127.0.0.1".to_string() }
fn default_control_port() -> u16 { 3334 }
fn default_node_url() -> String { "http://127.0.0.1:8332".to_string() }
fn default_rpc_timeout() -> String { "30s".to_string() }
fn default_pool_tag() -> String { "stratum-pool".to_string() }
fn default_pool_fee() -> f64 { 0.01 }
fn default_reward_scheme() -> RewardScheme { RewardScheme::Prop }
fn default_pplns_window() -> f64 { 1_000_000.0 }
fn default_initial_difficulty() -> f64 { 16.0 }
fn default_min_difficulty() -> f64 { 1.0 }
fn default_max_difficulty() -> f64 { 1e12 }
fn default_target_shares_per_minute() -> f64 { 20.0 }
fn default_retarget_interval() -> String { "90s".to_string() }
fn default_variance_threshold() -> f64 { 0.1 }
fn default_max_retarget_factor() -> f64 { 8.0 }
fn default_low_difficulty_tolerance() -> f64 { 0.01 }
fn default_template_refresh() -> String { "5s".to_string() }
fn default_max_block_bytes() -> usize { 2_000_000 }
fn default_coinbase_reserve_bytes() -> usize { 1000 }
fn default_max_future_skew() -> String { "2h".to_string() }
fn default_max_live_jobs() -> usize { 16 }
fn default_duplicate_capacity() -> usize { 4096 }
fn default_submit_attempts() -> usize { 3 }
fn default_maturity_depth() -> u64 { 100 }
fn default_maturity_interval() -> String { "1m".to_string() }
fn default_stats_interval() -> String { "1m".to_string() }
fn default_metrics_retention() -> String { "7days".to_string() }
fn default_metrics_aggregation() -> Aggregation { Aggregation::Avg }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["stratum-pool"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = parse(&["--payout-address", "tb1qpool"]);

        assert_eq!(config.coin_family, CoinFamily::Bitcoin);
        assert_eq!(config.reward_scheme, RewardScheme::Prop);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.stratum_port, 3333);
        assert_eq!(config.reactor().unwrap().idle_timeout, Duration::from_secs(300));
        assert_eq!(config.vardiff().unwrap().retarget_interval, Duration::from_secs(90));
        assert_eq!(config.max_future_skew_duration().unwrap(), Duration::from_secs(7200));
        assert_eq!(
            config.retention().unwrap().retention,
            Duration::from_secs(7 * 24 * 3600)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        assert!(parse(&[]).validate().is_err());
        assert!(parse(&["--payout-address", "a", "--control-interface", "0.0.0.0"])
            .validate()
            .is_err());
        assert!(parse(&["--payout-address", "a", "--pool-fee", "1.5"])
            .validate()
            .is_err());
        assert!(parse(&["--payout-address", "a", "--stats-interval", "soon"])
            .validate()
            .is_err());
        assert!(parse(&["--payout-address", "a", "--initial-difficulty", "0.5"])
            .validate()
            .is_err());
        assert!(parse(&["--payout-address", "a", "--max-block-bytes", "1000"])
            .validate()
            .is_err());
        assert!(parse(&[
            "--payout-address",
            "a",
            "--reward-scheme",
            "pplns",
            "--pplns-window",
            "0"
        ])
        .validate()
        .is_err());
        assert!(parse(&["--payout-address", "a", "--metrics-downsample", "0s"])
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_config_from_yaml() {
        let yaml_content = r#"
payout_address: "tb1qpool"
coin_family: equihash
reward_scheme: pplns
pplns_window: 5000.0
stratum_port: 4444
stats_interval: "30s"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();

        assert_eq!(config.payout_address.as_deref(), Some("tb1qpool"));
        assert_eq!(config.coin_family, CoinFamily::Equihash);
        assert_eq!(config.reward_scheme, RewardScheme::Pplns);
        assert_eq!(config.pplns_window, 5000.0);
        assert_eq!(config.stratum_port, 4444);
        assert_eq!(config.stats_interval_duration().unwrap(), Duration::from_secs(30));
        // Unset fields fall back to defaults
        assert_eq!(config.max_live_jobs, 16);
    }

    #[tokio::test]
    async fn test_cli_overrides_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            temp_file,
            r#"{{"payout_address": "fromfile", "stratum_port": 4444, "pool_fee": 0.02}}"#
        )
        .unwrap();

        let file = Config::load_from_file(temp_file.path()).await.unwrap();
        let cli = parse(&["--stratum-port", "5555"]);
        let merged = cli.merge_with_file(file).unwrap();

        assert_eq!(merged.stratum_port, 5555);
        assert_eq!(merged.payout_address.as_deref(), Some("fromfile"));
        assert_eq!(merged.pool_fee, 0.02);
        merged.validate().unwrap();
    }

    #[test]
    fn test_print_config_hides_password() {
        let config = parse(&["--payout-address", "a", "--rpc-password", "hunter2"]);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("payout_address"));
        assert!(!yaml.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_downsample_settings_reach_the_store() {
        use crate::store::{MemoryStore, MetricPoint, MetricsStore};

        let config = parse(&[
            "--payout-address",
            "a",
            "--metrics-retention",
            "1h",
            "--metrics-downsample",
            "1m",
            "--metrics-aggregation",
            "max",
        ]);
        config.validate().unwrap();

        let retention = config.retention().unwrap();
        assert_eq!(
            retention.downsample,
            Some(DownsampleRule {
                bucket: Duration::from_secs(60),
                aggregation: Aggregation::Max,
            })
        );

        let store = MemoryStore::new(Some(retention));
        let points: Vec<MetricPoint> = [(0u64, 1.0), (30, 4.0), (60, 2.0), (90, 3.0)]
            .iter()
            .map(|&(ts, v)| MetricPoint::new("hashrate", ts, v))
            .collect();
        store.append(&points).await.unwrap();
        assert_eq!(store.downsampled("hashrate"), vec![(0, 4.0), (60, 3.0)]);

        // Without a bucket the series is kept raw
        let raw = parse(&["--payout-address", "a"]).retention().unwrap();
        assert_eq!(raw.downsample, None);
    }
}
