//! Textual TMTC wire protocol <-> internal request/response messages.
//!
//! The translator is stateless. A received buffer is split on `\r\n`; the
//! trailing fragment after the last terminator is dropped, not carried over
//! to the next read.

use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{Message, MessageBus, Subscription, RAW_TC, RAW_TM, TC, TM};
use crate::error::CommandError;
use crate::protocol::{RequestType, ResponseType, ServiceRequest, ServiceResponse};

pub const LINE_TERMINATOR: &str = "\r\n";

/// Outcome of parsing one complete line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Request(ServiceRequest),
    /// The line could not become a request; the reply goes straight to `tm`.
    Rejected(ServiceResponse),
}

fn request_kind(keyword: &str) -> Option<RequestType> {
    match keyword {
        "helo" => Some(RequestType::Helo),
        "tc" => Some(RequestType::Set),
        "tm" => Some(RequestType::Get),
        "tc_meta" => Some(RequestType::SetMeta),
        "tm_meta" => Some(RequestType::GetMeta),
        _ => None,
    }
}

/// Splits on spaces outside double quotes and strips the quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            ' ' if !quoted => {
                if pending {
                    tokens.push(core::mem::take(&mut current));
                    pending = false;
                }
            }
            _ => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }
    tokens
}

/// Parses one line without its terminator. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let tokens = tokenize(line.trim());
    let mut tokens = tokens.into_iter();
    let keyword = tokens.next()?;

    let Some(id) = tokens.next() else {
        return Some(ParsedLine::Rejected(ServiceResponse::new(
            None,
            keyword,
            ResponseType::Error,
            Some(Value::String(CommandError::Malformed.to_string())),
        )));
    };

    match request_kind(&keyword) {
        Some(kind) => Some(ParsedLine::Request(
            ServiceRequest::new(id, kind).with_args(tokens),
        )),
        None => Some(ParsedLine::Rejected(ServiceResponse::new(
            None,
            id,
            ResponseType::Error,
            Some(Value::String(CommandError::NotRecognizedType.to_string())),
        ))),
    }
}

/// Parses every complete line in `buffer`.
pub fn parse_buffer(buffer: &[u8]) -> Vec<ParsedLine> {
    let text = String::from_utf8_lossy(buffer);
    let mut lines: Vec<&str> = text.split(LINE_TERMINATOR).collect();
    // Incomplete (or empty) trailing fragment.
    lines.pop();
    lines.into_iter().filter_map(parse_line).collect()
}

fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn meta_field<'a>(response: &'a ServiceResponse, field: &str) -> Option<&'a Value> {
    response.value.as_ref().and_then(|v| v.get(field))
}

/// Seconds since the Unix epoch, millisecond precision.
pub fn current_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

pub fn format_response(response: &ServiceResponse) -> String {
    format_response_at(response, current_timestamp())
}

/// Formats `response` with an explicit `get` timestamp.
pub fn format_response_at(response: &ServiceResponse, timestamp: f64) -> String {
    let id = response.qualified_id();
    match response.kind {
        ResponseType::Helo => format!("> OK helo {id}{LINE_TERMINATOR}"),
        ResponseType::Set => format!("> OK {id}{LINE_TERMINATOR}"),
        ResponseType::Get => {
            let value = render(response.value.as_ref());
            format!("> OK {id};{timestamp:.3};{value};{value};0;1{LINE_TERMINATOR}")
        }
        ResponseType::SetMeta => {
            let arg_count = meta_field(response, "signature")
                .and_then(|s| s.get(0))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let description = render(meta_field(response, "description"));
            format!("> OK {id};{arg_count};{description}{LINE_TERMINATOR}")
        }
        ResponseType::GetMeta => {
            let return_type = render(meta_field(response, "signature").and_then(|s| s.get(1)));
            let description = render(meta_field(response, "description"));
            format!("> OK {id};{return_type};{return_type};{description};7;4{LINE_TERMINATOR}")
        }
        ResponseType::Error => {
            let value = render(response.value.as_ref());
            format!("> ERROR {id} {value}{LINE_TERMINATOR}")
        }
    }
}

/// Bus wiring: `raw_tc` -> `tc` (or `tm` for rejected lines), `tm` -> `raw_tm`.
pub struct ProtocolTranslator {
    subscriptions: Vec<Subscription>,
}

impl ProtocolTranslator {
    pub fn attach(bus: &MessageBus) -> Self {
        let inbound_bus = bus.clone();
        let inbound = bus.subscribe(RAW_TC, move |message| {
            let Message::Raw(bytes) = message else {
                debug!(topic = RAW_TC, "ignoring non-raw message");
                return Ok(());
            };
            for parsed in parse_buffer(bytes) {
                match parsed {
                    ParsedLine::Request(request) => {
                        debug!(id = %request.id, kind = ?request.kind, "telecommand");
                        inbound_bus.publish(TC, Message::Request(request))?;
                    }
                    ParsedLine::Rejected(response) => {
                        warn!(id = %response.id, "rejected telecommand line");
                        inbound_bus.publish(TM, Message::Response(response))?;
                    }
                }
            }
            Ok(())
        });

        let outbound_bus = bus.clone();
        let outbound = bus.subscribe(TM, move |message| {
            let Message::Response(response) = message else {
                debug!(topic = TM, "ignoring non-response message");
                return Ok(());
            };
            outbound_bus.publish(RAW_TM, Message::Line(format_response(response)))?;
            Ok(())
        });

        Self {
            subscriptions: vec![inbound, outbound],
        }
    }

    pub fn detach(&self) {
        for subscription in &self.subscriptions {
            subscription.cancel();
        }
    }
}
