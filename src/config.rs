use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Configuration file looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "wzrpc.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address the server listens on and the client dials.
    pub bind: SocketAddr,
    /// Idle connections kept by the client pool.
    pub pool_capacity: usize,
    pub call_timeout_ms: u64,
    pub json_logs: bool,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7878)),
            pool_capacity: 8,
            call_timeout_ms: 5000,
            json_logs: false,
            verbose: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `WZRPC_*` environment variables and
    /// finally `overrides` (usually the parsed command line).
    pub fn new<T: Serialize>(
        config_path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let toml = match config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(format!("config file not found: {}", path.display()).into());
                }
                Toml::file_exact(path)
            }
            None => Toml::file(DEFAULT_CONFIG_FILE),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(toml)
            .merge(Env::prefixed("WZRPC_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
