use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Problems found while compiling an application's mappings and registrations. These are always
/// raised when the application is built, never while serving a request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("url pattern `{0}` contains more than one wildcard")]
    MultipleWildcards(String),

    #[error("`{pattern}` is mapped to `{target}`, which is not registered")]
    UnknownTarget { pattern: String, target: String },

    #[error("`{0}` is registered more than once")]
    DuplicateName(String),

    #[error("an application is already mounted at context path `{0}`")]
    DuplicateContext(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("the {pool} pool is exhausted ({max} objects in use)")]
    CapacityExceeded { pool: &'static str, max: usize },

    #[error("no request handler became available after retrying")]
    Rejected,
}

/// A typed failure cause. The class is a dotted name; each leading run of segments is an ancestor,
/// so a page registered for `db` also catches `db.timeout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    class: String,
    message: String,
    cause: Option<Box<Fault>>,
}

impl Fault {
    pub fn new(class: &str, message: &str) -> Self {
        Fault {
            class: class.to_owned(),
            message: message.to_owned(),
            cause: None,
        }
    }

    pub fn caused_by(mut self, cause: Fault) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn cause(&self) -> Option<&Fault> {
        self.cause.as_deref()
    }

    /// True when `ancestor` names this fault's class or one of its dotted parents.
    pub fn is_a(&self, ancestor: &str) -> bool {
        class_is_a(&self.class, ancestor)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

pub(crate) fn class_is_a(class: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return false;
    }

    class == ancestor
        || (class.len() > ancestor.len()
            && class.starts_with(ancestor)
            && class.as_bytes()[ancestor.len()] == b'.')
}

/// What handlers and filters return. The dispatch engine hands these back to its caller in the
/// same variant it received them.
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    #[error("{0}")]
    Failure(Fault),

    #[error("runtime fault, {0}")]
    Runtime(Fault),

    #[error("handler unavailable, {0}")]
    Unavailable(Fault),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn failure(class: &str, message: &str) -> Self {
        HandlerError::Failure(Fault::new(class, message))
    }

    pub fn runtime(class: &str, message: &str) -> Self {
        HandlerError::Runtime(Fault::new(class, message))
    }

    pub fn unavailable(message: &str) -> Self {
        HandlerError::Unavailable(Fault::new("unavailable", message))
    }

    /// The class used to look up error pages.
    pub fn class(&self) -> &str {
        match self {
            HandlerError::Failure(fault) | HandlerError::Runtime(fault) => fault.class(),
            HandlerError::Unavailable(fault) => fault.class(),
            HandlerError::IllegalState(_) => "illegal_state",
            HandlerError::Io(_) => "io",
            HandlerError::Fatal(_) => "fatal",
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            HandlerError::Failure(fault)
            | HandlerError::Runtime(fault)
            | HandlerError::Unavailable(fault) => Some(fault),
            _ => None,
        }
    }

    /// Classes along the cause chain, outermost first.
    pub fn class_chain(&self) -> Vec<&str> {
        let mut chain = vec![self.class()];
        let mut next = self.fault().and_then(Fault::cause);

        while let Some(fault) = next {
            chain.push(fault.class());
            next = fault.cause();
        }

        chain
    }

    /// Message of the innermost cause that has one.
    pub fn summary(&self) -> String {
        let mut message = match self {
            HandlerError::Failure(fault)
            | HandlerError::Runtime(fault)
            | HandlerError::Unavailable(fault) => fault.message().to_owned(),
            HandlerError::IllegalState(msg) | HandlerError::Fatal(msg) => msg.clone(),
            HandlerError::Io(err) => err.to_string(),
        };

        let mut next = self.fault().and_then(Fault::cause);
        while let Some(fault) = next {
            if !fault.message().is_empty() {
                message = fault.message().to_owned();
            }
            next = fault.cause();
        }

        message
    }

    #[inline]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, HandlerError::Unavailable(_))
    }
}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> Self {
        HandlerError::Io(Arc::new(err))
    }
}

impl From<SessionError> for HandlerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Io(err) => HandlerError::Io(Arc::new(err)),
            other => HandlerError::IllegalState(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session `{0}` has already been invalidated")]
    AlreadyInvalidated(String),

    #[error("session `{0}` is no longer valid")]
    Invalidated(String),

    #[error("failed to encode or decode session: {0}")]
    Codec(String),

    #[error("unsupported session format version {0}")]
    VersionMismatch(u32),

    #[error("session storage error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Codec(err.to_string())
    }
}

/// Failures below the HTTP layer. They end the current connection cycle without a response.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("timed out waiting for the request")]
    Timeout,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] io::Error),

    #[error("failed to start server threads: {0}")]
    Threads(io::Error),

    #[error("no application named `{0}` is mounted")]
    UnknownApp(String),

    #[error("server control channel is closed")]
    ControlClosed,
}
