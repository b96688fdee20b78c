//! # Groundlink
//!
//! Telemetry/telecommand routing for ground equipment. Operators speak one
//! textual protocol over TCP; instruments behind it are driven over TCP, UDP,
//! subprocesses or SpaceWire RMAP from a declarative YAML description.
//!
//! ## Data flow
//!
//! ```text
//! raw_tc ─▶ translator ─▶ tc ─▶ controller ─▶ io_service_request ─▶ instrument
//!                                                                       │
//! raw_tm ◀─ translator ◀─ tm ◀─ controller ◀─ io_result ◀───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use groundlink::bus::{Message, MessageBus, RAW_TC, RAW_TM};
//! use groundlink::{ProtocolController, ProtocolTranslator};
//! use std::sync::{Arc, Mutex};
//!
//! let bus = MessageBus::new();
//! let _controller = ProtocolController::attach(&bus);
//! let _translator = ProtocolTranslator::attach(&bus);
//!
//! let lines = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&lines);
//! let _sub = bus.subscribe(RAW_TM, move |message| {
//!     if let Message::Line(line) = message {
//!         sink.lock().unwrap().push(line.clone());
//!     }
//!     Ok(())
//! });
//!
//! bus.publish(RAW_TC, Message::Raw(b"helo test\r\n".to_vec())).unwrap();
//! assert_eq!(lines.lock().unwrap()[0], "> OK helo test\r\n");
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Topic registry and synchronous fan-out channels
//! - [`translator`] - Wire text to and from service requests/responses
//! - [`controller`] - Parameter catalog, routing and meta-telemetry
//! - [`instrument`] - Declarative instrument engine and device links
//! - [`rmap`] - RMAP packet codec and its TCP transport
//! - [`registry`] - Transport factories by name
//! - [`station`] - Wires everything up from a [`config::SystemConfig`]
//! - [`server`] - TCP front end for operators

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod instrument;
pub mod protocol;
pub mod registry;
pub mod rmap;
pub mod server;
pub mod station;
pub mod translator;

pub use bus::{Message, MessageBus, Subscription};
pub use controller::ProtocolController;
pub use error::{CommandError, ConfigError, Error, TransportError};
pub use instrument::{ConnectionState, Instrument, InstrumentConfig};
pub use protocol::{ParameterInfo, ParameterType, RequestType, ResponseType, ServiceRequest, ServiceResponse};
pub use registry::TransportRegistry;
pub use station::Station;
pub use translator::ProtocolTranslator;
