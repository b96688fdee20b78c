//! Generic instrument engine.
//!
//! An [`Instrument`] is built from an [`InstrumentConfig`]: every declared
//! parameter is validated and compiled into command templates, its shared
//! memory is seeded from the declared defaults, and its catalog slice is
//! published on `io_service_signature` when started. Requests arriving on
//! `io_service_request` for this provider are executed against the device
//! link and answered on `io_result`.
//!
//! Each instrument runs one command at a time; the link mutex is held for
//! the whole round trip. Different instruments proceed independently.

pub mod config;
pub mod cyclic;
pub mod memory;
pub mod template;
pub mod transport;

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bus::{lock, Message, MessageBus, Subscription, IO_RESULT, IO_SERVICE_REQUEST, IO_SERVICE_SIGNATURE, QUIT, TM};
use crate::error::{CommandError, ConfigError, Result, TransportError};
use crate::protocol::{ParameterInfo, ParameterType, RequestType, ResponseType, ServiceRequest, ServiceResponse, Signature};
use crate::registry::TransportRegistry;

pub use config::{CyclicConfig, CyclicMode, Encoding, InstrumentConfig, ParameterConfig, StepConfig};
pub use cyclic::{parse_record, CyclicWorker, RecordAccumulator};
pub use memory::SharedMemory;
pub use template::{CommandTemplate, CompiledParameter, Setter, Step, ValueType};
pub use transport::Transport;

pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connect attempt failed. Requests are refused as if
    /// disconnected until a new `connect` succeeds.
    Unreachable,
}

struct Link {
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    worker: Option<CyclicWorker>,
}

impl Link {
    /// Drops the transport after a lost connection. The worker, if any, is
    /// handed back so it can be stopped once the lock is released.
    fn degrade(&mut self, provider: &str, err: &TransportError) -> Option<CyclicWorker> {
        warn!(provider, error = %err, "connection lost");
        self.state = ConnectionState::Disconnected;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.worker.take()
    }
}

enum Failure {
    Command(CommandError),
    Lost(TransportError),
}

impl From<CommandError> for Failure {
    fn from(err: CommandError) -> Self {
        Failure::Command(err)
    }
}

fn link_error(err: TransportError) -> Failure {
    if err.is_connection_loss() {
        Failure::Lost(err)
    } else {
        Failure::Command(err.into())
    }
}

struct InstrumentInner {
    config: InstrumentConfig,
    parameters: BTreeMap<String, CompiledParameter>,
    memory: SharedMemory,
    registry: Arc<TransportRegistry>,
    bus: MessageBus,
    link: Mutex<Link>,
}

pub struct Instrument {
    inner: Arc<InstrumentInner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Validates `config` against its transport and compiles every parameter.
fn compile_parameters(
    config: &InstrumentConfig,
    registry: &TransportRegistry,
) -> Result<BTreeMap<String, CompiledParameter>, ConfigError> {
    registry.validate(config)?;

    let mut parameters = BTreeMap::new();
    for (name, parameter) in &config.parameters {
        let compiled = template::compile(name, parameter)?;
        if template::is_lifecycle(name) && (compiled.getter.is_some() || compiled.setter.is_none()) {
            return Err(ConfigError::Invalid(format!(
                "'{name}' of instrument '{}' may only declare a set accessor",
                config.provider
            )));
        }
        parameters.insert(name.clone(), compiled);
    }

    if let Some(cyclic) = &config.cyclic {
        for id in &cyclic.parameters {
            let known = match cyclic.mode {
                CyclicMode::Poll => parameters.get(id).is_some_and(|p| p.getter.is_some()),
                CyclicMode::Stream => parameters
                    .values()
                    .any(|p| &p.name == id || &p.memory_key == id),
            };
            if !known {
                return Err(ConfigError::UnknownCyclicParameter {
                    instrument: config.provider.clone(),
                    id: id.clone(),
                });
            }
        }
    }

    Ok(parameters)
}

impl Instrument {
    /// Validates `config` and compiles every parameter. Nothing is opened
    /// until a `connect` request arrives.
    pub fn new(config: InstrumentConfig, registry: Arc<TransportRegistry>, bus: MessageBus) -> Result<Self, ConfigError> {
        let parameters = compile_parameters(&config, &registry).map_err(|e| {
            error!(provider = %config.provider, error = %e, "instrument configuration rejected");
            e
        })?;

        let memory = SharedMemory::seeded(
            parameters
                .values()
                .filter_map(|p| Some((p.memory_key.clone(), p.default.clone()?))),
        );

        info!(provider = %config.provider, transport = %config.transport, parameters = parameters.len(), "instrument compiled");
        Ok(Self {
            inner: Arc::new(InstrumentInner {
                config,
                parameters,
                memory,
                registry,
                bus,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    transport: None,
                    worker: None,
                }),
            }),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn provider(&self) -> &str {
        &self.inner.config.provider
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.inner.config
    }

    pub fn parameter(&self, name: &str) -> Option<&CompiledParameter> {
        self.inner.parameters.get(name)
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.inner.memory
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link().state
    }

    /// Catalog slice published on `io_service_signature`, including the
    /// built-in `connect` and `disconnect` setters.
    pub fn catalog(&self) -> Vec<ParameterInfo> {
        self.inner.catalog()
    }

    /// Subscribes to `io_service_request` and `quit`, then publishes the
    /// catalog slice. If registration is rejected the subscriptions are
    /// cancelled and the instrument stays out of service.
    pub fn start(&self) -> Result<()> {
        let bus = &self.inner.bus;

        let weak = Arc::downgrade(&self.inner);
        let requests = bus.subscribe(IO_SERVICE_REQUEST, move |message| {
            let (Message::Request(request), Some(inner)) = (message, weak.upgrade()) else {
                return Ok(());
            };
            if let Some(response) = InstrumentInner::execute(&inner, request) {
                inner.bus.publish(IO_RESULT, Message::Response(response))?;
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.inner);
        let quit = bus.subscribe(QUIT, move |message| {
            if let (Message::Quit, Some(inner)) = (message, weak.upgrade()) {
                inner.shutdown();
            }
            Ok(())
        });

        if let Err(e) = bus.publish(IO_SERVICE_SIGNATURE, Message::Signatures(self.catalog())) {
            error!(provider = %self.provider(), error = %e, "catalog rejected, instrument not in service");
            requests.cancel();
            quit.cancel();
            return Err(e);
        }

        lock(&self.subscriptions).extend([requests, quit]);
        info!(provider = %self.provider(), "instrument in service");
        Ok(())
    }

    /// Runs `request` if it is addressed to this instrument. Returns `None`
    /// for any other provider.
    pub fn execute(&self, request: &ServiceRequest) -> Option<ServiceResponse> {
        InstrumentInner::execute(&self.inner, request)
    }

    /// Disconnects and stops listening on the bus.
    pub fn shutdown(&self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.cancel();
        }
        self.inner.shutdown();
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl InstrumentInner {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    fn catalog(&self) -> Vec<ParameterInfo> {
        let entry = |id: &str, kind, signature: &Signature, description: &str| ParameterInfo {
            provider: self.config.provider.clone(),
            id: id.to_string(),
            kind,
            signature: signature.to_value(),
            description: description.to_string(),
        };

        let mut slice = Vec::new();
        for parameter in self.parameters.values() {
            if parameter.getter.is_some() {
                slice.push(entry(
                    &parameter.name,
                    ParameterType::Get,
                    &parameter.get_signature(),
                    &parameter.description,
                ));
            }
            if let Some(setter) = &parameter.setter {
                slice.push(entry(&parameter.name, ParameterType::Set, &setter.signature, &parameter.description));
            }
        }
        for (name, description) in [(CONNECT, "Open the instrument link"), (DISCONNECT, "Close the instrument link")] {
            if !self.parameters.contains_key(name) {
                slice.push(entry(name, ParameterType::Set, &Signature::new(Vec::new(), None), description));
            }
        }
        slice
    }

    fn execute(this: &Arc<Self>, request: &ServiceRequest) -> Option<ServiceResponse> {
        if request.provider.as_deref() != Some(this.provider()) {
            return None;
        }

        let reply = |result: core::result::Result<Option<Value>, CommandError>| match result {
            Ok(value) => ServiceResponse::new(request.provider.clone(), request.id.clone(), request.kind.into(), value),
            Err(err) => {
                warn!(provider = %this.provider(), id = %request.id, error = %err, "command failed");
                ServiceResponse::error_for(request, &err)
            }
        };

        let response = match (request.kind, request.id.as_str()) {
            (RequestType::Set, CONNECT) => reply(Self::connect(this, &request.args)),
            (RequestType::Set, DISCONNECT) => reply(this.disconnect(&request.args)),
            (RequestType::Get | RequestType::Set, _) => reply(this.run(request)),
            _ => reply(Err(CommandError::NotRecognizedType)),
        };
        Some(response)
    }

    fn run(&self, request: &ServiceRequest) -> core::result::Result<Option<Value>, CommandError> {
        let parameter = self.parameters.get(&request.id).ok_or(CommandError::NotRecognized)?;

        let mut link = self.link();
        if link.state != ConnectionState::Connected {
            return Err(CommandError::NotConnected);
        }
        let Some(transport) = link.transport.as_mut() else {
            return Err(CommandError::NotConnected);
        };

        let outcome = match request.kind {
            RequestType::Get => self.get(transport.as_mut(), parameter, &request.args),
            _ => self.set(transport.as_mut(), parameter, &request.args),
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(Failure::Command(err)) => Err(err),
            Err(Failure::Lost(err)) => {
                let worker = link.degrade(self.provider(), &err);
                drop(link);
                if let Some(worker) = worker {
                    worker.stop();
                }
                Err(err.into())
            }
        }
    }

    fn get(
        &self,
        transport: &mut dyn Transport,
        parameter: &CompiledParameter,
        args: &[String],
    ) -> core::result::Result<Option<Value>, Failure> {
        let template = parameter.getter.as_ref().ok_or(CommandError::NotRecognized)?;
        if !args.is_empty() {
            return Err(CommandError::WrongArgumentCount {
                id: parameter.name.clone(),
                expected: 0,
                got: args.len(),
            }
            .into());
        }
        let reply = run_template(transport, &parameter.name, template, args)?.unwrap_or_default();
        let value = parameter.parse_reply(&reply)?;
        if let Some(value) = &value {
            self.memory.set(parameter.memory_key.clone(), value.clone());
        }
        Ok(value)
    }

    fn set(
        &self,
        transport: &mut dyn Transport,
        parameter: &CompiledParameter,
        args: &[String],
    ) -> core::result::Result<Option<Value>, Failure> {
        let setter = parameter.setter.as_ref().ok_or(CommandError::NotRecognized)?;
        let typed = parameter.check_args(setter, args)?;
        let reply = run_template(transport, &parameter.name, &setter.template, args)?;

        let stored = match reply {
            Some(reply) => parameter.parse_reply(&reply)?,
            None => match (typed.as_slice(), args) {
                ([Some(value)], _) => Some(value.clone()),
                ([None], [raw]) => Some(Value::String(raw.clone())),
                _ => None,
            },
        };
        if let Some(value) = &stored {
            self.memory.set(parameter.memory_key.clone(), value.clone());
        }
        Ok(stored)
    }

    fn connect(this: &Arc<Self>, args: &[String]) -> core::result::Result<Option<Value>, CommandError> {
        let declared = this.parameters.get(CONNECT);
        match declared.and_then(|p| Some((p, p.setter.as_ref()?))) {
            Some((parameter, setter)) => {
                parameter.check_args(setter, args)?;
            }
            None if !args.is_empty() => {
                return Err(CommandError::WrongArgumentCount {
                    id: CONNECT.to_string(),
                    expected: 0,
                    got: args.len(),
                });
            }
            None => {}
        }

        let mut link = this.link();
        if link.state == ConnectionState::Connected {
            debug!(provider = %this.provider(), "already connected");
            return Ok(None);
        }
        link.state = ConnectionState::Connecting;
        info!(provider = %this.provider(), transport = %this.config.transport, "connecting");

        let mut transport = match this.registry.open(&this.config) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(provider = %this.provider(), error = %e, "instrument unreachable");
                link.state = ConnectionState::Unreachable;
                return Err(CommandError::Unreachable);
            }
        };

        if let Some(setter) = declared.and_then(|p| p.setter.as_ref()) {
            if let Err(e) = run_template(transport.as_mut(), CONNECT, &setter.template, args) {
                let reason = match e {
                    Failure::Command(err) => err.to_string(),
                    Failure::Lost(err) => err.to_string(),
                };
                warn!(provider = %this.provider(), error = %reason, "connect sequence failed");
                transport.close();
                link.state = ConnectionState::Unreachable;
                return Err(CommandError::Unreachable);
            }
        }

        link.transport = Some(transport);
        link.state = ConnectionState::Connected;
        if let Some(cyclic) = &this.config.cyclic {
            link.worker = Self::spawn_worker(this, cyclic);
        }
        info!(provider = %this.provider(), "connected");
        Ok(None)
    }

    fn disconnect(&self, args: &[String]) -> core::result::Result<Option<Value>, CommandError> {
        let declared = self.parameters.get(DISCONNECT);
        let mut link = self.link();
        if link.state != ConnectionState::Connected {
            debug!(provider = %self.provider(), state = ?link.state, "disconnect without a link");
            return Ok(None);
        }

        let worker = link.worker.take();
        if let (Some(parameter), Some(transport)) = (declared, link.transport.as_mut()) {
            if let Some(setter) = &parameter.setter {
                let result = parameter
                    .check_args(setter, args)
                    .map_err(Failure::Command)
                    .and_then(|_| run_template(transport.as_mut(), DISCONNECT, &setter.template, args));
                if result.is_err() {
                    warn!(provider = %self.provider(), "disconnect sequence failed, closing anyway");
                }
            }
        }
        if let Some(mut transport) = link.transport.take() {
            transport.close();
        }
        link.state = ConnectionState::Disconnected;
        drop(link);

        if let Some(worker) = worker {
            worker.stop();
        }
        info!(provider = %self.provider(), "disconnected");
        Ok(None)
    }

    fn shutdown(&self) {
        if self.link().state == ConnectionState::Connected {
            let _ = self.disconnect(&[]);
        }
    }

    fn spawn_worker(this: &Arc<Self>, cyclic: &CyclicConfig) -> Option<CyclicWorker> {
        let weak: Weak<Self> = Arc::downgrade(this);
        let mode = cyclic.mode;
        let mut accumulator = RecordAccumulator::new(this.config.read_termination.as_bytes());
        let interval = std::time::Duration::from_millis(cyclic.interval_ms.max(1));
        let name = format!("cyclic-{}", this.provider());

        let spawned = CyclicWorker::spawn(name, interval, move || {
            let Some(inner) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            let updates = match mode {
                CyclicMode::Poll => inner.poll(),
                CyclicMode::Stream => inner.drain(&mut accumulator),
            };
            let Some(updates) = updates else {
                return ControlFlow::Break(());
            };
            for response in updates {
                if let Err(e) = inner.bus.publish(TM, Message::Response(response)) {
                    warn!(provider = %inner.provider(), error = %e, "unsolicited telemetry rejected");
                }
            }
            ControlFlow::Continue(())
        });

        match spawned {
            Ok(worker) => Some(worker),
            Err(e) => {
                error!(provider = %this.provider(), error = %e, "cannot start cyclic acquisition");
                None
            }
        }
    }

    fn unsolicited(&self, id: &str, value: Value) -> ServiceResponse {
        ServiceResponse::new(Some(self.config.provider.clone()), id, ResponseType::Get, Some(value))
    }

    /// One poll round. `None` once the link is gone.
    fn poll(&self) -> Option<Vec<ServiceResponse>> {
        let ids = self.config.cyclic.as_ref().map(|c| c.parameters.clone()).unwrap_or_default();
        let mut link = self.link();
        if link.state != ConnectionState::Connected {
            return None;
        }
        let transport = link.transport.as_mut()?;

        let mut updates = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(parameter) = self.parameters.get(id) else {
                continue;
            };
            match self.get(transport.as_mut(), parameter, &[]) {
                Ok(Some(value)) => updates.push(self.unsolicited(id, value)),
                Ok(None) => {}
                Err(Failure::Command(err)) => debug!(provider = %self.provider(), id = %id, error = %err, "poll failed"),
                Err(Failure::Lost(err)) => {
                    // Dropping the handle detaches this thread; it exits on
                    // the next break.
                    drop(link.degrade(self.provider(), &err));
                    return None;
                }
            }
        }
        Some(updates)
    }

    /// Reads whatever the device pushed and decodes complete records.
    fn drain(&self, accumulator: &mut RecordAccumulator) -> Option<Vec<ServiceResponse>> {
        let mut link = self.link();
        if link.state != ConnectionState::Connected {
            return None;
        }
        let transport = link.transport.as_mut()?;
        let bytes = match transport.read_available() {
            Ok(bytes) => bytes,
            Err(err) if err.is_connection_loss() => {
                drop(link.degrade(self.provider(), &err));
                accumulator.clear();
                return None;
            }
            Err(err) => {
                debug!(provider = %self.provider(), error = %err, "stream read failed");
                return Some(Vec::new());
            }
        };
        drop(link);

        let mut updates = Vec::new();
        for record in accumulator.push(&bytes) {
            for (key, raw) in parse_record(&record) {
                let Some(parameter) = self
                    .parameters
                    .values()
                    .find(|p| p.memory_key == key || p.name == key)
                else {
                    continue;
                };
                let value = match parameter.parse_reply(&raw) {
                    Ok(Some(value)) => value,
                    Ok(None) => Value::String(raw),
                    Err(err) => {
                        debug!(provider = %self.provider(), error = %err, "bad stream field");
                        continue;
                    }
                };
                self.memory.set(parameter.memory_key.clone(), value.clone());
                updates.push(self.unsolicited(&parameter.name, value));
            }
        }
        Some(updates)
    }
}

/// Runs every step in order and returns the reply of the last query.
fn run_template(
    transport: &mut dyn Transport,
    id: &str,
    template: &CommandTemplate,
    args: &[String],
) -> core::result::Result<Option<String>, Failure> {
    let mut last = None;
    for step in &template.steps {
        let command = template::render(id, step.template(), args)?;
        match step {
            Step::Write(_) => transport.write(&command).map_err(link_error)?,
            Step::Query(_) => last = Some(transport.query(&command).map_err(link_error)?),
        }
    }
    Ok(last)
}
