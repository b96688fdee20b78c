//! Protocol controller: validates telecommands against the parameter catalog
//! and routes them to instrument engines.
//!
//! `get`/`set` correlation is a single-slot rendezvous on `io_result`. Each
//! forwarded request installs a one-shot subscription that replaces (and
//! cancels) any still-pending one; the first `io_result` to arrive is sent
//! to `tm` and clears the slot. No request id is carried, so two overlapping
//! requests yield one `tm` reply, the earliest instrument response.

use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::json;
use tracing::{debug, warn};

use crate::bus::{lock, Message, MessageBus, Subscription, IO_RESULT, IO_SERVICE_REQUEST, IO_SERVICE_SIGNATURE, TC, TM};
use crate::catalog::ParameterCatalog;
use crate::error::{CommandError, ConfigError, Result};
use crate::protocol::{ParameterInfo, ParameterType, RequestType, ServiceRequest, ServiceResponse};

struct ControllerInner {
    bus: MessageBus,
    catalog: RwLock<ParameterCatalog>,
    pending: Mutex<Option<Subscription>>,
}

pub struct ProtocolController {
    inner: Arc<ControllerInner>,
    subscriptions: Vec<Subscription>,
}

impl ProtocolController {
    /// Controller that is not subscribed to anything; drive it with
    /// [`register`](Self::register) and [`dispatch`](Self::dispatch).
    pub fn new(bus: MessageBus) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                bus,
                catalog: RwLock::new(ParameterCatalog::new()),
                pending: Mutex::new(None),
            }),
            subscriptions: Vec::new(),
        }
    }

    /// Creates a controller listening on `tc` and `io_service_signature`.
    /// A rejected signature batch fails the publisher's call.
    pub fn attach(bus: &MessageBus) -> Self {
        let mut controller = Self::new(bus.clone());

        let weak = Arc::downgrade(&controller.inner);
        let signatures = bus.subscribe(IO_SERVICE_SIGNATURE, move |message| {
            let (Message::Signatures(batch), Some(inner)) = (message, weak.upgrade()) else {
                return Ok(());
            };
            inner.register(batch)?;
            Ok(())
        });

        let weak = Arc::downgrade(&controller.inner);
        let telecommands = bus.subscribe(TC, move |message| {
            let (Message::Request(request), Some(inner)) = (message, weak.upgrade()) else {
                return Ok(());
            };
            ControllerInner::dispatch(&inner, request)
        });

        controller.subscriptions = vec![signatures, telecommands];
        controller
    }

    pub fn register(&self, batch: &[ParameterInfo]) -> Result<(), ConfigError> {
        self.inner.register(batch)
    }

    pub fn dispatch(&self, request: &ServiceRequest) -> Result<()> {
        ControllerInner::dispatch(&self.inner, request)
    }

    pub fn lookup(&self, qualified_id: &str, kind: ParameterType) -> Option<ParameterInfo> {
        read_catalog(&self.inner.catalog).get(qualified_id, kind).cloned()
    }

    pub fn catalog_len(&self) -> usize {
        read_catalog(&self.inner.catalog).len()
    }

    /// Whether a forwarded `get`/`set` is still waiting for its result.
    pub fn has_pending(&self) -> bool {
        lock(&self.inner.pending).is_some()
    }

    pub fn detach(&self) {
        for subscription in &self.subscriptions {
            subscription.cancel();
        }
        if let Some(pending) = lock(&self.inner.pending).take() {
            pending.cancel();
        }
    }
}

fn read_catalog(catalog: &RwLock<ParameterCatalog>) -> std::sync::RwLockReadGuard<'_, ParameterCatalog> {
    catalog.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ControllerInner {
    fn register(&self, batch: &[ParameterInfo]) -> Result<(), ConfigError> {
        self.catalog
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .register(batch)
    }

    fn reply(&self, response: ServiceResponse) -> Result<()> {
        if response.is_error() {
            warn!(id = %response.id, error = ?response.value, "telecommand failed");
        }
        self.bus.publish(TM, Message::Response(response))?;
        Ok(())
    }

    fn dispatch(this: &Arc<Self>, request: &ServiceRequest) -> Result<()> {
        let (kind, forward) = match request.kind {
            RequestType::Helo => return this.reply(ServiceResponse::helo(request.id.clone())),
            RequestType::Get => (ParameterType::Get, true),
            RequestType::Set => (ParameterType::Set, true),
            RequestType::GetMeta => (ParameterType::Get, false),
            RequestType::SetMeta => (ParameterType::Set, false),
        };

        let qualified = request.qualified_id();
        let entry = read_catalog(&this.catalog).get(&qualified, kind).cloned();
        let Some(info) = entry else {
            return this.reply(ServiceResponse::error_for(request, &CommandError::NotRecognized));
        };

        if !forward {
            let value = json!({
                "signature": info.signature,
                "description": info.description,
            });
            return this.reply(ServiceResponse::new(
                request.provider.clone(),
                request.id.clone(),
                request.kind.into(),
                Some(value),
            ));
        }

        let readdressed = ServiceRequest {
            provider: Some(info.provider),
            id: info.id,
            kind: request.kind,
            args: request.args.clone(),
        };

        {
            let mut pending = lock(&this.pending);
            let subscription = this.bus.subscribe(IO_RESULT, one_shot(Arc::downgrade(this)));
            if let Some(previous) = pending.replace(subscription) {
                debug!(id = %qualified, "replacing pending io_result subscription");
                previous.cancel();
            }
        }

        debug!(provider = ?readdressed.provider, id = %readdressed.id, kind = ?readdressed.kind, "forwarding");
        this.bus.publish(IO_SERVICE_REQUEST, Message::Request(readdressed))?;
        Ok(())
    }
}

fn one_shot(weak: Weak<ControllerInner>) -> impl Fn(&Message) -> Result<()> + Send + Sync + 'static {
    move |message| {
        let (Message::Response(response), Some(inner)) = (message, weak.upgrade()) else {
            return Ok(());
        };
        let Some(current) = lock(&inner.pending).take() else {
            return Ok(());
        };
        current.cancel();
        inner.reply(response.clone())
    }
}
