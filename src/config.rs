//! Station configuration file.
//!
//! ```yaml
//! server:
//!   host: 0.0.0.0
//!   port: 12345
//! instruments:
//!   - provider: psu
//!     transport: tcp
//!     address: 192.168.0.20
//!     port: 5025
//!     parameters: {}
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, Result};
use crate::instrument::config::InstrumentConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 12345;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl SystemConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        info!(path = %path.display(), instruments = config.instruments.len(), "configuration loaded");
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.check_providers()?;
        Ok(config)
    }

    /// Provider ids namespace the catalog, so two instruments may not share
    /// one.
    fn check_providers(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            if instrument.provider.is_empty() {
                return Err(ConfigError::Invalid("instrument with an empty provider".into()));
            }
            if !seen.insert(instrument.provider.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' is declared twice",
                    instrument.provider
                )));
            }
        }
        Ok(())
    }
}
