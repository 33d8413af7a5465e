//! Error types for ElOyente.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the failure class: configuration problems are surfaced at save time,
//! transport problems leave the trigger inactive, and evaluation problems
//! are isolated per subscription entry.

use thiserror::Error;

/// Validation errors raised while building or loading configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid XPath expression '{expression}': {reason}")]
    InvalidExpression {
        expression: String,
        reason: String,
    },

    #[error("Node name cannot be empty")]
    EmptyNodeName,

    #[error("Invalid variable name '{name}'")]
    InvalidVariableName {
        name: String,
    },

    #[error("XMPP settings are incomplete: '{field}' is empty")]
    IncompleteSettings {
        field: String,
    },

    #[error("Payload for node '{node}' is not well-formed XML: {reason}")]
    MalformedPayload {
        node: String,
        reason: String,
    },
}

/// Errors reported by the XMPP transport collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to '{server}': {message}")]
    ConnectFailed {
        server: String,
        message: String,
    },

    #[error("Authentication failed for user '{user}'")]
    AuthFailed {
        user: String,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Node not found: {node}")]
    NodeNotFound {
        node: String,
    },

    #[error("Node discovery failed: {message}")]
    DiscoveryFailed {
        message: String,
    },

    #[error("PubSub request '{operation}' failed: {message}")]
    RequestFailed {
        operation: String,
        message: String,
    },
}

/// Runtime errors while evaluating a compiled XPath expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Function '{function}' expects a node-set argument")]
    NodeSetExpected {
        function: String,
    },

    #[error("Path step applied to a non node-set value")]
    PathOnNonNodeSet,

    #[error("Predicate applied to a non node-set value")]
    PredicateOnNonNodeSet,

    #[error("Union of non node-set values")]
    UnionOfNonNodeSets,
}

/// Errors while loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {message}")]
    Parse {
        message: String,
    },
}

/// Top-level error type for ElOyente.
#[derive(Debug, Error)]
pub enum ElOyenteError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ElOyenteError {
    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if a later reconfiguration or restart may succeed.
    ///
    /// Nothing in this crate retries transport errors on its own; the flag
    /// only tells the operator whether trying again is meaningful.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Evaluation(_) | Self::Config(_) => false,
            Self::Transport(e) => !matches!(e, TransportError::AuthFailed { .. }),
        }
    }
}

/// Result type alias for ElOyente operations.
pub type ElOyenteResult<T> = Result<T, ElOyenteError>;
