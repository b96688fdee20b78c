//! String-keyed transport factories, resolved once per instrument at
//! construction and used on every `connect`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ConfigError, TransportError};
use crate::instrument::config::InstrumentConfig;
use crate::instrument::transport::{ScriptTransport, SimulationTransport, TcpTransport, Transport, UdpTransport};
use crate::rmap::transport::RmapTransport;

pub type TransportFactory =
    Arc<dyn Fn(&InstrumentConfig) -> Result<Box<dyn Transport>, TransportError> + Send + Sync>;

fn boxed<T>(open: fn(&InstrumentConfig) -> Result<T, TransportError>) -> TransportFactory
where
    T: Transport + 'static,
{
    Arc::new(move |config: &InstrumentConfig| -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(open(config)?) as Box<dyn Transport>)
    })
}

struct Entry {
    required: &'static [&'static str],
    factory: TransportFactory,
}

#[derive(Default)]
pub struct TransportRegistry {
    entries: HashMap<String, Entry>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `tcp`, `udp`, `script`, `simulation` and `rmap`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, &'static [&'static str], TransportFactory); 5] = [
            ("tcp", &["address", "port"], boxed(TcpTransport::connect)),
            ("udp", &["address", "port"], boxed(UdpTransport::connect)),
            ("script", &["script"], boxed(ScriptTransport::new)),
            ("simulation", &["simulation"], boxed(SimulationTransport::spawn)),
            ("rmap", &["address", "port"], boxed(RmapTransport::connect)),
        ];
        for (id, required, factory) in builtins {
            // The names above are distinct.
            let _ = registry.register_factory(id, required, factory);
        }
        registry
    }

    /// Adds a transport. Ids are unique; registering one twice is a
    /// configuration error.
    pub fn register<F>(&mut self, id: &str, required: &'static [&'static str], factory: F) -> Result<(), ConfigError>
    where
        F: Fn(&InstrumentConfig) -> Result<Box<dyn Transport>, TransportError> + Send + Sync + 'static,
    {
        self.register_factory(id, required, Arc::new(factory))
    }

    fn register_factory(
        &mut self,
        id: &str,
        required: &'static [&'static str],
        factory: TransportFactory,
    ) -> Result<(), ConfigError> {
        if self.entries.contains_key(id) {
            return Err(ConfigError::DuplicateTransport(id.to_string()));
        }
        debug!(transport = id, "transport registered");
        self.entries.insert(id.to_string(), Entry { required, factory });
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Checks that the instrument's transport exists and that every field it
    /// requires is present.
    pub fn validate(&self, config: &InstrumentConfig) -> Result<(), ConfigError> {
        let entry = self
            .entries
            .get(&config.transport)
            .ok_or_else(|| ConfigError::UnknownTransport(config.transport.clone()))?;
        match entry.required.iter().copied().find(|field| !config.has_field(field)) {
            Some(field) => Err(ConfigError::MissingField {
                instrument: config.provider.clone(),
                field,
            }),
            None => Ok(()),
        }
    }

    pub fn open(&self, config: &InstrumentConfig) -> Result<Box<dyn Transport>, TransportError> {
        let entry = self
            .entries
            .get(&config.transport)
            .ok_or_else(|| TransportError::InvalidCommand(format!("unknown transport '{}'", config.transport)))?;
        (entry.factory)(config)
    }
}
