use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "./config.toml";

#[derive(Parser, Debug)]
#[clap(name = "speedtrack", version, about)]
pub struct Cli {
    /// Path to configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the results log path
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Override the pause between measurements, in seconds
    #[clap(long)]
    pub interval: Option<u64>,

    /// Override the diagnostic log level (error, warn, info, debug, trace)
    #[clap(long)]
    pub log_level: Option<String>,

    /// Take a single measurement and exit
    #[clap(long)]
    pub once: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_file: PathBuf,
    pub interval_secs: u64,
    pub log_level: String,
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("internet_speed.csv"),
            interval_secs: 30,
            log_level: "info".to_string(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Config {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn level_filter(&self) -> Result<log::LevelFilter> {
        self.log_level
            .parse()
            .with_context(|| format!("Invalid log level: {}", self.log_level))
    }
}

/// Settings for the HTTP speed probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub server_list_url: String,
    /// Connect and idle-read timeout; also caps server-list and latency requests
    pub request_timeout_secs: u64,
    /// Wall-clock time spent downloading payloads per measurement
    pub download_budget_secs: u64,
    pub max_candidates: usize,
    pub latency_samples: u32,
    /// Edge lengths of the `random{N}x{N}.jpg` payloads to fetch
    pub download_sizes: Vec<u32>,
    pub download_repeats: u32,
    pub download_concurrency: usize,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            server_list_url: "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true"
                .to_string(),
            request_timeout_secs: 10,
            download_budget_secs: 10,
            max_candidates: 5,
            latency_samples: 3,
            download_sizes: vec![350, 500, 750, 1000, 1500, 2000],
            download_repeats: 2,
            download_concurrency: 4,
            user_agent: format!("speedtrack/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProbeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_budget(&self) -> Duration {
        Duration::from_secs(self.download_budget_secs)
    }
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        let config_content = fs::read_to_string(&cli.config)
            .with_context(|| format!("Failed to read config file: {:?}", cli.config))?;
        parse_config(&config_content)?
    } else if cli.config == PathBuf::from(DEFAULT_CONFIG_PATH) {
        Config::default()
    } else {
        anyhow::bail!("Config file not found: {:?}", cli.config);
    };

    // Apply CLI overrides
    if let Some(ref log_file) = cli.log_file {
        config.log_file = log_file.clone();
    }

    if let Some(interval) = cli.interval {
        config.interval_secs = interval;
    }

    if let Some(ref level) = cli.log_level {
        config.log_level = level.clone();
    }

    validate(&config)?;

    Ok(config)
}

fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.interval_secs == 0 {
        anyhow::bail!("interval_secs must be greater than zero");
    }
    if config.probe.download_budget_secs == 0 {
        anyhow::bail!("probe.download_budget_secs must be greater than zero");
    }
    if config.probe.download_sizes.is_empty() {
        anyhow::bail!("probe.download_sizes must not be empty");
    }
    config.level_filter()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["speedtrack"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse_config("interval_secs = 60\n[probe]\nmax_candidates = 2\n").unwrap();
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.log_file, PathBuf::from("internet_speed.csv"));
        assert_eq!(config.probe.max_candidates, 2);
        assert_eq!(config.probe.latency_samples, 3);
    }

    #[test]
    fn example_config_parses() {
        let config = parse_config(include_str!("../config.example.toml")).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.probe.download_sizes.len(), 6);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let args = cli(&["--config", path.to_str().unwrap()]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn cli_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "log_file = \"from_file.csv\"\ninterval_secs = 45\n").unwrap();

        let args = cli(&[
            "--config",
            path.to_str().unwrap(),
            "--interval",
            "5",
            "--log-file",
            "override.csv",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.interval(), Duration::from_secs(5));
        assert_eq!(config.log_file, PathBuf::from("override.csv"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "interval_secs = 0\n").unwrap();
        let args = cli(&["--config", path.to_str().unwrap()]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn zero_download_budget_is_rejected() {
        let config = parse_config("[probe]\ndownload_budget_secs = 0\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();
        let args = cli(&["--config", path.to_str().unwrap(), "--log-level", "loud"]);
        assert!(load_config(&args).is_err());
    }
}
