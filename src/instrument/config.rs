//! Declarative instrument configuration, as written in the system YAML file.
//!
//! ```yaml
//! provider: psu
//! transport: tcp
//! address: 192.168.0.20
//! port: 5025
//! parameters:
//!   voltage:
//!     description: Output voltage
//!     type: float
//!     default: 0.0
//!     get:
//!       instrument_command:
//!         - query: "VOLT?"
//!     set:
//!       signature: [[float], null]
//!       instrument_command:
//!         - write: "VOLT {0}"
//!         - query: "VOLT?"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub provider: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_termination")]
    pub write_termination: String,
    #[serde(default = "default_termination")]
    pub read_termination: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Simulator executable speaking the instrument's line protocol on
    /// stdin/stdout.
    #[serde(default)]
    pub simulation: Option<String>,
    /// Executable run once per command by the `script` transport.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub rmap: RmapSettings,
    #[serde(default)]
    pub cyclic: Option<CyclicConfig>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterConfig>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_termination() -> String {
    "\n".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

impl InstrumentConfig {
    pub fn new(provider: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            transport: transport.into(),
            address: None,
            port: None,
            encoding: Encoding::default(),
            write_termination: default_termination(),
            read_termination: default_termination(),
            timeout_ms: default_timeout_ms(),
            simulation: None,
            script: None,
            rmap: RmapSettings::default(),
            cyclic: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Whether an optional top-level field named `field` is set.
    pub fn has_field(&self, field: &str) -> bool {
        match field {
            "address" => self.address.is_some(),
            "port" => self.port.is_some(),
            "simulation" => self.simulation.is_some(),
            "script" => self.script.is_some(),
            "cyclic" => self.cyclic.is_some(),
            _ => false,
        }
    }

    pub fn socket_address(&self) -> Option<String> {
        Some(format!("{}:{}", self.address.as_ref()?, self.port?))
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Ascii,
    Utf8,
    Latin1,
}

impl Encoding {
    pub fn encode(self, text: &str) -> Result<Vec<u8>, TransportError> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Ascii if text.is_ascii() => Ok(text.as_bytes().to_vec()),
            Encoding::Ascii => Err(TransportError::Encoding(format!("'{text}' is not ASCII"))),
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| TransportError::Encoding(format!("'{c}' is not Latin-1")))
                })
                .collect(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Encoding::Ascii | Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmapSettings {
    #[serde(default = "default_target_address")]
    pub target_address: u8,
    #[serde(default = "default_initiator_address")]
    pub initiator_address: u8,
    #[serde(default = "default_key")]
    pub key: u8,
    #[serde(default)]
    pub verify: bool,
}

fn default_target_address() -> u8 {
    0x32
}

fn default_initiator_address() -> u8 {
    0x20
}

fn default_key() -> u8 {
    0x20
}

impl Default for RmapSettings {
    fn default() -> Self {
        Self {
            target_address: default_target_address(),
            initiator_address: default_initiator_address(),
            key: default_key(),
            verify: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclicMode {
    /// Re-issue the listed parameters' get commands every interval.
    #[default]
    Poll,
    /// Drain unsolicited `key=value;...` records from the link.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclicConfig {
    #[serde(default)]
    pub mode: CyclicMode,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub parameters: Vec<String>,
}

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    /// Shared-memory key this parameter reads and writes. Defaults to the
    /// parameter name.
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub get: Option<AccessorConfig>,
    #[serde(default)]
    pub set: Option<AccessorConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessorConfig {
    #[serde(default)]
    pub signature: Option<Value>,
    #[serde(default)]
    pub instrument_command: Vec<StepConfig>,
}

/// One `instrument_command` entry: `{write: ...}` or `{query: ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl StepConfig {
    pub fn write(template: impl Into<String>) -> Self {
        Self {
            write: Some(template.into()),
            query: None,
        }
    }

    pub fn query(template: impl Into<String>) -> Self {
        Self {
            write: None,
            query: Some(template.into()),
        }
    }
}
