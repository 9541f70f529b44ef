//! Error types for modem firmware update operations

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = UpdateError> = std::result::Result<T, E>;

/// Errors that can occur while detaching, flashing or attaching a modem
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Device lacks a port, capability or command required by its advertised method
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Device is not in the mode the operation expects
    #[error("Device not ready: {0}")]
    NotReady(String),

    /// Malformed or rejected response on a command or transfer
    #[error("Protocol error: {}", format_protocol(.message, .response.as_deref()))]
    Protocol {
        /// What was being attempted
        message: String,
        /// Trimmed device-reported text, when the device answered at all
        response: Option<String>,
    },

    /// Descriptor, ioctl or transport failure
    #[error("I/O error: {context}: {source}")]
    Io {
        /// What was being attempted
        context: String,
        /// Underlying platform error
        #[source]
        source: std::io::Error,
    },

    /// Manifest/archive mismatch or undecodable firmware bundle
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Another update attempt already holds the device
    #[error("Update already in progress for device: {0}")]
    Busy(String),

    /// Invalid updater configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another error with a context prefix
    #[error("{context}: {source}")]
    Context {
        /// Phase, file or action the error happened in
        context: String,
        /// The wrapped error
        #[source]
        source: Box<UpdateError>,
    },
}

fn format_protocol(message: &str, response: Option<&str>) -> String {
    match response {
        Some(response) => format!("{message}: {response}"),
        None => message.to_string(),
    }
}

/// Failure classification independent of any context wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Permanent; never retried
    NotSupported,
    /// Device in the wrong mode; the caller may retry the whole attempt later
    NotReady,
    /// Device rejected or garbled a command
    Protocol,
    /// Transport failure
    Io,
    /// Payload/manifest mismatch
    Validation,
    /// Device locked by another attempt
    Busy,
    /// Bad configuration
    Config,
}

impl ErrorKind {
    /// Whether repeating the whole attempt later can succeed without changing inputs
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::NotReady | ErrorKind::Busy)
    }

    /// Whether the failure is a property of the device or payload itself
    pub fn is_permanent(self) -> bool {
        matches!(self, ErrorKind::NotSupported | ErrorKind::Validation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::NotReady => "not-ready",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
            ErrorKind::Validation => "validation",
            ErrorKind::Busy => "busy",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

impl UpdateError {
    /// Build an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        UpdateError::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a protocol error, trimming the device response
    pub fn protocol(message: impl Into<String>, response: Option<&str>) -> Self {
        UpdateError::Protocol {
            message: message.into(),
            response: response.map(|r| r.trim().to_string()),
        }
    }

    /// Wrap this error with a context prefix
    pub fn context(self, context: impl Into<String>) -> Self {
        UpdateError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classification of the innermost error
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::NotSupported(_) => ErrorKind::NotSupported,
            UpdateError::NotReady(_) => ErrorKind::NotReady,
            UpdateError::Protocol { .. } => ErrorKind::Protocol,
            UpdateError::Io { .. } => ErrorKind::Io,
            UpdateError::Validation(_) => ErrorKind::Validation,
            UpdateError::Busy(_) => ErrorKind::Busy,
            UpdateError::Config(_) => ErrorKind::Config,
            UpdateError::Context { source, .. } => source.kind(),
        }
    }

    /// The innermost error, with every context layer removed
    pub fn root(&self) -> &UpdateError {
        match self {
            UpdateError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Device-reported response text carried by a protocol error, if any
    pub fn device_response(&self) -> Option<&str> {
        match self.root() {
            UpdateError::Protocol { response, .. } => response.as_deref(),
            _ => None,
        }
    }

    /// Platform error code carried by an I/O error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self.root() {
            UpdateError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Context prefixing for `Result<T, UpdateError>`
pub trait ResultExt<T> {
    /// Prefix the error, if any, with a fixed context
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Prefix the error, if any, with a lazily built context
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}
