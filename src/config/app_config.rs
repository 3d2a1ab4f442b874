use std::env;
use std::path::PathBuf;

use thiserror::Error;

use super::probe_config::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("organisation {0:?} has a polling interval of zero")]
    ZeroInterval(String),
}

pub struct AppConfig {
    pub config: Config,

    /// Endpoint receiving JSON results. Results are logged when absent.
    pub result_endpoint: Option<String>,

    /// DNS servers to use; empty means the system configuration.
    pub dns_hosts: Vec<String>,

    pub app_env: String,

    /// Width of the widest organisation name, used to align log output.
    pub max_org_width: usize,
}

/// Load the application configuration from a YAML file and environment variables.
/// A `.env` file in the working directory is loaded first, if present. The schedule
/// is read from the file named by `CONFIG_FILE` (default `config.yml`); `DNS_HOSTS`,
/// `RESULT_ENDPOINT` and `APP_ENV` are read from the environment.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            log::warn!("Unable to load .env file: {e}");
        }
    }

    let path = PathBuf::from(env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yml".to_string()));
    let config_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config = parse_config(&config_str).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.clone(),
            source,
        },
        other => other,
    })?;

    let dns_hosts = parse_dns_hosts(&env::var("DNS_HOSTS").unwrap_or_default());
    if dns_hosts.is_empty() {
        log::info!("Using system DNS configuration");
    } else {
        log::info!("Using DNS hosts: {:?}", dns_hosts);
    }

    let result_endpoint = env::var("RESULT_ENDPOINT")
        .ok()
        .filter(|endpoint| !endpoint.trim().is_empty());
    let app_env = env::var("APP_ENV").unwrap_or_else(|_| "production".to_string());

    let max_org_width = config.keys().map(|org| org.len()).max().unwrap_or(10);

    Ok(AppConfig {
        config,
        result_endpoint,
        dns_hosts,
        app_env,
        max_org_width,
    })
}

/// Parse and validate the schedule.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
        path: PathBuf::new(),
        source,
    })?;
    if let Some((name, _)) = config
        .iter()
        .find(|(_, org)| org.polling_interval_seconds == 0)
    {
        return Err(ConfigError::ZeroInterval(name.clone()));
    }
    Ok(config)
}

/// Split a comma separated list of DNS servers, ignoring blanks.
pub fn parse_dns_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
