use thiserror::Error;

/// Errors raised while building or registering components. A component that
/// hits one of these does not enter service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed signature for parameter '{id}': {reason}")]
    MalformedSignature { id: String, reason: String },

    #[error("parameter '{id}' ({kind}) is already registered")]
    DuplicateParameter { id: String, kind: String },

    #[error("instrument '{instrument}' is missing required field '{field}'")]
    MissingField { instrument: String, field: &'static str },

    #[error("parameter '{id}' does not declare a type")]
    MissingType { id: String },

    #[error("get parameter '{id}' must not declare signature arguments")]
    GetSignatureNotEmpty { id: String },

    #[error("get parameter '{id}' has no query step")]
    GetWithoutQuery { id: String },

    #[error("parameter '{id}' declares neither get nor set")]
    NoAccessor { id: String },

    #[error("parameter '{id}' has an empty instrument_command")]
    EmptyTemplate { id: String },

    #[error("parameter '{id}' has an invalid command step: {reason}")]
    InvalidStep { id: String, reason: String },

    #[error("unknown value type '{value_type}' for parameter '{id}'")]
    UnknownValueType { id: String, value_type: String },

    #[error("cyclic parameter '{id}' is not a get parameter of instrument '{instrument}'")]
    UnknownCyclicParameter { instrument: String, id: String },

    #[error("unknown transport '{0}'")]
    UnknownTransport(String),

    #[error("transport '{0}' is already registered")]
    DuplicateTransport(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures of the link between an instrument engine and its device.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for the instrument")]
    Timeout,

    #[error("connection closed by the instrument")]
    Closed,

    #[error("operation not supported by the '{0}' transport")]
    Unsupported(&'static str),

    #[error("script failed: {0}")]
    Script(String),

    #[error("RMAP Reply error")]
    RmapReply,

    #[error("invalid command for this transport: {0}")]
    InvalidCommand(String),

    #[error("cannot encode command: {0}")]
    Encoding(String),
}

impl TransportError {
    /// Whether the link itself is gone, as opposed to a single bad exchange.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            TransportError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            TransportError::Closed => true,
            _ => false,
        }
    }
}

/// Runtime errors. These are never fatal: the `Display` text travels back to
/// the operator as the value of an `error` response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Not recognized command")]
    NotRecognized,

    #[error("Not recognized command type")]
    NotRecognizedType,

    #[error("Malformed command")]
    Malformed,

    #[error("Not possible to perform command before connection is established")]
    NotConnected,

    #[error("Instrument is unreachable")]
    Unreachable,

    #[error("Wrong number of arguments for {id}: expected {expected}, got {got}")]
    WrongArgumentCount { id: String, expected: usize, got: usize },

    #[error("Invalid argument {index} for {id}: '{value}' is not a valid {expected}")]
    InvalidArgument { id: String, index: usize, value: String, expected: String },

    #[error("Unable to parse reply for {id}: '{reply}'")]
    UnparsableReply { id: String, reply: String },

    #[error("Unable to format command for {id}: {reason}")]
    Template { id: String, reason: String },

    #[error("RMAP Reply error")]
    RmapReply,

    #[error("Instrument communication error: {0}")]
    Transport(String),
}

impl From<TransportError> for CommandError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::RmapReply => CommandError::RmapReply,
            other => CommandError::Transport(other.to_string()),
        }
    }
}

/// Crate-level error returned by bus publishes and component startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
