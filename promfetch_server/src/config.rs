use anyhow::{Context, Result};
use promfetch_core::{BackendConfig, ConsulConfig, ExternalExporter, TlsConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub no_color: bool,
    pub in_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_owned(),
            no_color: false,
            in_json: false,
        }
    }
}

/// Client certificate presented to scraped targets
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendsConfig {
    pub cert_chain: Option<String>,
    pub private_key: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub consul: ConsulConfig,

    pub logging: LogConfig,

    /// Port of the metrics api
    pub port: u16,

    /// Port of the health check, served apart from the api
    pub health_check_port: u16,

    /// The public url of the api, used in its documentation
    pub base_url: String,

    pub disable_keep_alives: bool,

    /// Accepted for compatibility; the client only bounds connections per host
    pub max_idle_conns: usize,

    pub max_idle_conns_per_host: usize,

    /// PEM encoded CA certificates trusted when scraping targets
    pub ca_certs: Option<String>,

    pub skip_ssl_validation: bool,

    pub backends: BackendsConfig,

    pub external_exporters: Vec<ExternalExporter>,
}

impl Default for Config {
    fn default() -> Self {
        let backend = BackendConfig::default();
        Config {
            consul: ConsulConfig::default(),
            logging: LogConfig::default(),
            port: 8085,
            health_check_port: 8080,
            base_url: "http://localhost:8085".to_owned(),
            disable_keep_alives: backend.disable_keep_alives,
            max_idle_conns: 100,
            max_idle_conns_per_host: backend.max_idle_conns_per_host,
            ca_certs: None,
            skip_ssl_validation: false,
            backends: BackendsConfig::default(),
            external_exporters: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from arguments, env, dotenv and the config file
    pub fn load() -> Result<(Config, bool)> {
        // Attempts to find a `.env` file to initialize/extend the environment
        dotenv::dotenv().ok();

        let env = Environment::from_args();
        let config = match &env.config {
            Some(path) => Config::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Config::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Config::default(),
        };
        Ok((config, env.debug))
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Config::parse(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Config> {
        let mut config: Config = if raw.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.process();
        Ok(config)
    }

    fn process(&mut self) {
        let trimmed = self.base_url.trim_end_matches('/').len();
        self.base_url.truncate(trimmed);
    }

    pub fn backend(&self) -> BackendConfig {
        BackendConfig {
            disable_keep_alives: self.disable_keep_alives,
            max_idle_conns_per_host: self.max_idle_conns_per_host,
            tls: TlsConfig {
                ca_certs: self.ca_certs.clone(),
                cert_chain: self.backends.cert_chain.clone(),
                private_key: self.backends.private_key.clone(),
                skip_ssl_validation: self.skip_ssl_validation,
            },
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "promfetch")]
struct Environment {
    /// Enables debug logging, regardless of the configured level
    #[structopt(short, long)]
    debug: bool,

    /// Path to the yaml config file; `config.yml` is used when present
    #[structopt(short, long, env = "PROMFETCH_CONFIG", parse(from_os_str))]
    config: Option<PathBuf>,
}
