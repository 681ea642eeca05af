//! Error types for the authorization engine.
//!
//! Only configuration, policy loading and compilation produce errors. Once a
//! [`PolicySet`](crate::core::PolicySet) exists, every request resolves to a
//! [`Decision`](crate::api::Decision) instead.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the authorization engine.
#[derive(Error, Debug)]
pub enum Error {
    /// A rule could not be compiled (bad template, bad regex, missing key, ...)
    #[error("Policy compile error{}: {message}", location_suffix(.location))]
    Compile {
        /// Detailed error message
        message: String,
        /// Rule location in the policy document, e.g. `rules[2].children[0]`
        location: Option<String>,
    },

    /// A policy document could not be parsed
    #[error("Policy parse error: {message}")]
    Parse {
        /// Detailed error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Detailed error message
        message: String,
        /// Configuration key that caused the error
        key: Option<String>,
    },

    /// Telemetry/observability setup error
    #[error("Telemetry error: {message}")]
    Telemetry {
        /// Detailed error message
        message: String,
    },

    /// Listener or transport failure
    #[error("Server error: {message}")]
    Server {
        /// Detailed error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error (unexpected condition)
    #[error("Internal error: {message}")]
    Internal {
        /// Detailed error message
        message: String,
    },
}

fn location_suffix(location: &Option<String>) -> String {
    match location {
        Some(loc) => format!(" at {}", loc),
        None => String::new(),
    }
}

impl Error {
    /// Create a compile error.
    pub fn compile(message: impl Into<String>) -> Self {
        Error::Compile {
            message: message.into(),
            location: None,
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: None,
        }
    }

    /// Create a configuration error with key context.
    pub fn config_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Create a telemetry error.
    pub fn telemetry(message: impl Into<String>) -> Self {
        Error::Telemetry {
            message: message.into(),
        }
    }

    /// Create a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Error::Server {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Get the error category for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Compile { .. } => "compile",
            Error::Parse { .. } => "parse",
            Error::Config { .. } => "config",
            Error::Telemetry { .. } => "telemetry",
            Error::Server { .. } => "server",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Yaml(_) => "yaml",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::config(err.to_string())
    }
}

/// Extension trait for adding rule location context to compile errors.
pub trait ErrorContext<T> {
    /// Attach a rule location unless the error already carries a deeper one.
    fn at_rule(self, location: impl Into<String>) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn at_rule(self, location: impl Into<String>) -> Result<T> {
        self.map_err(|e| match e {
            Error::Compile {
                message,
                location: None,
            } => Error::Compile {
                message,
                location: Some(location.into()),
            },
            other => other,
        })
    }
}
