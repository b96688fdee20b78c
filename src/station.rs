use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::bus::{Message, MessageBus, QUIT};
use crate::config::SystemConfig;
use crate::controller::ProtocolController;
use crate::error::Result;
use crate::instrument::{ConnectionState, Instrument, InstrumentConfig};
use crate::registry::TransportRegistry;
use crate::translator::ProtocolTranslator;

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentStatus {
    pub provider: String,
    pub transport: String,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub uptime_seconds: u64,
    pub catalog_entries: usize,
    pub instruments: Vec<InstrumentStatus>,
}

/// One ground station: the bus plus the translator, the controller and one
/// engine per configured instrument, wired in dependency order.
pub struct Station {
    bus: MessageBus,
    registry: Arc<TransportRegistry>,
    controller: ProtocolController,
    translator: ProtocolTranslator,
    instruments: Vec<Instrument>,
    started: Instant,
}

impl Station {
    pub fn new(bus: MessageBus, registry: TransportRegistry) -> Self {
        let controller = ProtocolController::attach(&bus);
        let translator = ProtocolTranslator::attach(&bus);
        Self {
            bus,
            registry: Arc::new(registry),
            controller,
            translator,
            instruments: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Builds every configured instrument with the built-in transports.
    /// The first configuration error aborts startup.
    pub fn from_config(config: &SystemConfig) -> Result<Self> {
        let mut station = Self::new(MessageBus::new(), TransportRegistry::with_builtins());
        for instrument in &config.instruments {
            station.add_instrument(instrument.clone())?;
        }
        Ok(station)
    }

    /// Compiles `config`, publishes its catalog and puts it in service.
    pub fn add_instrument(&mut self, config: InstrumentConfig) -> Result<()> {
        let instrument = Instrument::new(config, Arc::clone(&self.registry), self.bus.clone())?;
        instrument.start()?;
        self.instruments.push(instrument);
        Ok(())
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn controller(&self) -> &ProtocolController {
        &self.controller
    }

    pub fn instrument(&self, provider: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.provider() == provider)
    }

    pub fn status(&self) -> StationStatus {
        StationStatus {
            uptime_seconds: self.started.elapsed().as_secs(),
            catalog_entries: self.controller.catalog_len(),
            instruments: self
                .instruments
                .iter()
                .map(|i| InstrumentStatus {
                    provider: i.provider().to_string(),
                    transport: i.config().transport.clone(),
                    state: i.state(),
                })
                .collect(),
        }
    }

    /// Publishes `quit` and detaches every component.
    pub fn shutdown(&self) -> Result<()> {
        info!(instruments = self.instruments.len(), "station shutting down");
        self.bus.publish(QUIT, Message::Quit)?;
        for instrument in &self.instruments {
            instrument.shutdown();
        }
        self.controller.detach();
        self.translator.detach();
        Ok(())
    }
}
