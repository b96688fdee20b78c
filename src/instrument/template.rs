//! Compilation of declarative parameter entries into executable command
//! templates.

use std::collections::HashMap;

use serde_json::Value;
use strfmt::strfmt;

use super::config::{AccessorConfig, ParameterConfig, StepConfig};
use crate::error::{CommandError, ConfigError};
use crate::protocol::Signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Float,
    Bool,
    Str,
    /// Raw bytes rendered as a lowercase hex string.
    Hex,
}

impl ValueType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => Some(ValueType::Int),
            "float" | "double" | "real" => Some(ValueType::Float),
            "bool" | "boolean" => Some(ValueType::Bool),
            "str" | "string" => Some(ValueType::Str),
            "hex" | "bytes" => Some(ValueType::Hex),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::Str => "str",
            ValueType::Hex => "hex",
        }
    }

    /// Converts one textual token. `None` if the token is not of this type.
    pub fn parse(self, text: &str) -> Option<Value> {
        let text = text.trim();
        match self {
            ValueType::Int => text.parse::<i64>().ok().map(Value::from),
            ValueType::Float => text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            ValueType::Bool => match text.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Some(Value::Bool(true)),
                "0" | "off" | "false" => Some(Value::Bool(false)),
                _ => None,
            },
            ValueType::Str => Some(Value::String(text.to_string())),
            ValueType::Hex => {
                let digits = text.strip_prefix("0x").unwrap_or(text);
                (digits.len() % 2 == 0 && digits.bytes().all(|b| b.is_ascii_hexdigit()))
                    .then(|| Value::String(digits.to_ascii_lowercase()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Write(String),
    Query(String),
}

impl Step {
    pub fn template(&self) -> &str {
        match self {
            Step::Write(t) | Step::Query(t) => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandTemplate {
    pub steps: Vec<Step>,
}

impl CommandTemplate {
    pub fn has_query(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Query(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Positional placeholders (`{0}`, `{1:>4}`, ...) referenced by `template`.
/// `{{` and `}}` are literal braces.
fn placeholders(template: &str) -> Result<Vec<usize>, String> {
    let mut found = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => key.push(c),
                        None => return Err(format!("unclosed placeholder in '{template}'")),
                    }
                }
                let name = key.split(':').next().unwrap_or_default();
                let index = name
                    .parse::<usize>()
                    .map_err(|_| format!("placeholder '{{{key}}}' is not positional"))?;
                found.push(index);
            }
            '}' => return Err(format!("unmatched '}}' in '{template}'")),
            _ => {}
        }
    }
    Ok(found)
}

/// Substitutes `{n}` with `args[n]`.
pub fn render(id: &str, template: &str, args: &[String]) -> Result<String, CommandError> {
    let vars: HashMap<String, String> = args
        .iter()
        .enumerate()
        .map(|(i, a)| (i.to_string(), a.clone()))
        .collect();
    strfmt(template, &vars).map_err(|e| CommandError::Template {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// A `set` accessor: validated signature, per-argument types and steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Setter {
    pub signature: Signature,
    pub arg_types: Vec<Option<ValueType>>,
    pub template: CommandTemplate,
}

/// One declared parameter after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledParameter {
    pub name: String,
    pub description: String,
    pub value_type: Option<ValueType>,
    pub memory_key: String,
    pub default: Option<Value>,
    pub getter: Option<CommandTemplate>,
    pub setter: Option<Setter>,
}

fn compile_steps(id: &str, accessor: &AccessorConfig, arg_count: usize) -> Result<CommandTemplate, ConfigError> {
    let steps = accessor
        .instrument_command
        .iter()
        .map(|step| match step {
            StepConfig { write: Some(t), query: None } => Ok(Step::Write(t.clone())),
            StepConfig { write: None, query: Some(t) } => Ok(Step::Query(t.clone())),
            _ => Err(ConfigError::InvalidStep {
                id: id.to_string(),
                reason: "each step needs exactly one of write or query".to_string(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    for step in &steps {
        let indices = placeholders(step.template()).map_err(|reason| ConfigError::InvalidStep {
            id: id.to_string(),
            reason,
        })?;
        if let Some(index) = indices.into_iter().find(|i| *i >= arg_count) {
            return Err(ConfigError::InvalidStep {
                id: id.to_string(),
                reason: format!("placeholder {{{index}}} exceeds the {arg_count} declared argument(s)"),
            });
        }
    }

    Ok(CommandTemplate { steps })
}

fn arg_type(id: &str, spec: &Value) -> Result<Option<ValueType>, ConfigError> {
    let name = match spec {
        Value::String(name) => name.as_str(),
        Value::Object(map) => match map.get("type") {
            Some(Value::String(name)) => name.as_str(),
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };
    ValueType::from_name(name)
        .map(Some)
        .ok_or_else(|| ConfigError::UnknownValueType {
            id: id.to_string(),
            value_type: name.to_string(),
        })
}

/// Parameters that may declare steps without a signature or any step at all.
pub fn is_lifecycle(name: &str) -> bool {
    matches!(name, "connect" | "disconnect")
}

pub fn compile(name: &str, config: &ParameterConfig) -> Result<CompiledParameter, ConfigError> {
    if config.get.is_none() && config.set.is_none() {
        return Err(ConfigError::NoAccessor { id: name.to_string() });
    }

    let value_type = match &config.value_type {
        None => None,
        Some(type_name) => Some(ValueType::from_name(type_name).ok_or_else(|| ConfigError::UnknownValueType {
            id: name.to_string(),
            value_type: type_name.clone(),
        })?),
    };

    let getter = match &config.get {
        None => None,
        Some(get) => {
            if let Some(raw) = &get.signature {
                let signature = Signature::parse(name, raw)?;
                if signature.arg_count() > 0 {
                    return Err(ConfigError::GetSignatureNotEmpty { id: name.to_string() });
                }
            }
            let template = compile_steps(name, get, 0)?;
            if !template.has_query() {
                return Err(ConfigError::GetWithoutQuery { id: name.to_string() });
            }
            if value_type.is_none() {
                return Err(ConfigError::MissingType { id: name.to_string() });
            }
            Some(template)
        }
    };

    let setter = match &config.set {
        None => None,
        Some(set) => {
            let signature = match &set.signature {
                Some(raw) => Signature::parse(name, raw)?,
                None => Signature::new(Vec::new(), None),
            };
            let arg_types = signature
                .args
                .iter()
                .map(|spec| arg_type(name, spec))
                .collect::<Result<Vec<_>, _>>()?;
            let template = compile_steps(name, set, signature.arg_count())?;
            if template.is_empty() && !is_lifecycle(name) {
                return Err(ConfigError::EmptyTemplate { id: name.to_string() });
            }
            if template.has_query() && value_type.is_none() {
                return Err(ConfigError::MissingType { id: name.to_string() });
            }
            Some(Setter {
                signature,
                arg_types,
                template,
            })
        }
    };

    Ok(CompiledParameter {
        name: name.to_string(),
        description: config.description.clone(),
        value_type,
        memory_key: config.memory.clone().unwrap_or_else(|| name.to_string()),
        default: config.default.clone(),
        getter,
        setter,
    })
}

impl CompiledParameter {
    /// Signature advertised for the `get` accessor: `[[], type]`.
    pub fn get_signature(&self) -> Signature {
        Signature::new(Vec::new(), self.value_type.map(|t| t.name().to_string()))
    }

    /// Checks `args` against the setter signature.
    pub fn check_args(&self, setter: &Setter, args: &[String]) -> Result<Vec<Option<Value>>, CommandError> {
        if args.len() != setter.signature.arg_count() {
            return Err(CommandError::WrongArgumentCount {
                id: self.name.clone(),
                expected: setter.signature.arg_count(),
                got: args.len(),
            });
        }
        args.iter()
            .zip(&setter.arg_types)
            .enumerate()
            .map(|(index, (arg, ty))| match ty {
                None => Ok(None),
                Some(ty) => ty.parse(arg).map(Some).ok_or_else(|| CommandError::InvalidArgument {
                    id: self.name.clone(),
                    index,
                    value: arg.clone(),
                    expected: ty.name().to_string(),
                }),
            })
            .collect()
    }

    pub fn parse_reply(&self, reply: &str) -> Result<Option<Value>, CommandError> {
        match self.value_type {
            None => Ok(None),
            Some(ty) => ty.parse(reply).map(Some).ok_or_else(|| CommandError::UnparsableReply {
                id: self.name.clone(),
                reply: reply.to_string(),
            }),
        }
    }
}
