//! Internal request/response messages and catalog entries.
//!
//! These are the values carried on the `tc`, `tm`, `io_service_request`,
//! `io_result` and `io_service_signature` topics.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, ConfigError};

/// Joins a provider namespace and a bare parameter id the way the wire
/// protocol addresses parameters.
pub fn qualify(provider: &str, id: &str) -> String {
    format!("{provider}_{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Get,
    Set,
    Helo,
    GetMeta,
    SetMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Get,
    Set,
    Helo,
    GetMeta,
    SetMeta,
    Error,
}

impl From<RequestType> for ResponseType {
    fn from(kind: RequestType) -> Self {
        match kind {
            RequestType::Get => ResponseType::Get,
            RequestType::Set => ResponseType::Set,
            RequestType::Helo => ResponseType::Helo,
            RequestType::GetMeta => ResponseType::GetMeta,
            RequestType::SetMeta => ResponseType::SetMeta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Absent when `id` already embeds the provider as `<provider>_<id>`.
    pub provider: Option<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub args: Vec<String>,
}

impl ServiceRequest {
    pub fn new(id: impl Into<String>, kind: RequestType) -> Self {
        Self {
            provider: None,
            id: id.into(),
            kind,
            args: Vec::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn qualified_id(&self) -> String {
        match &self.provider {
            Some(provider) => qualify(provider, &self.id),
            None => self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub provider: Option<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub value: Option<Value>,
}

impl ServiceResponse {
    pub fn new(provider: Option<String>, id: impl Into<String>, kind: ResponseType, value: Option<Value>) -> Self {
        Self {
            provider,
            id: id.into(),
            kind,
            value,
        }
    }

    pub fn helo(id: impl Into<String>) -> Self {
        Self::new(None, id, ResponseType::Helo, None)
    }

    /// Error reply addressed back to whoever sent `request`.
    pub fn error_for(request: &ServiceRequest, err: &CommandError) -> Self {
        Self::new(
            request.provider.clone(),
            request.id.clone(),
            ResponseType::Error,
            Some(Value::String(err.to_string())),
        )
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseType::Error
    }

    pub fn qualified_id(&self) -> String {
        match &self.provider {
            Some(provider) => qualify(provider, &self.id),
            None => self.id.clone(),
        }
    }
}

/// Accessor kind of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Get,
    Set,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterType::Get => write!(f, "get"),
            ParameterType::Set => write!(f, "set"),
        }
    }
}

/// One catalog entry as published on `io_service_signature`.
///
/// `signature` is kept as raw JSON so that malformed shapes coming from a
/// declarative config reach the catalog, where they are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub provider: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    pub signature: Value,
    pub description: String,
}

impl ParameterInfo {
    pub fn qualified_id(&self) -> String {
        qualify(&self.provider, &self.id)
    }
}

/// Validated `[[arg, ...], return_type]` signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub args: Vec<Value>,
    pub returns: Option<String>,
}

impl Signature {
    pub fn new(args: Vec<Value>, returns: Option<String>) -> Self {
        Self { args, returns }
    }

    pub fn parse(id: &str, raw: &Value) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedSignature {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let parts = raw
            .as_array()
            .ok_or_else(|| malformed("expected [[args...], return_type]"))?;
        if parts.len() != 2 {
            return Err(malformed("expected exactly two elements"));
        }

        let args = parts[0]
            .as_array()
            .ok_or_else(|| malformed("argument list must be an array"))?
            .clone();

        let returns = match &parts[1] {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            _ => return Err(malformed("return type must be a string or null")),
        };

        Ok(Self { args, returns })
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Array(self.args.clone()),
            self.returns.clone().map_or(Value::Null, Value::String),
        ])
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}
