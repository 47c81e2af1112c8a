use thiserror::Error;

/// Main error type for agenterm with structured error handling.
///
/// Every fallible operation in the control plane maps onto one of these
/// kinds. `Policy` errors are returned to the orchestrating LLM as
/// structured tool results so it can adapt; `Transport` errors are the only
/// kind retried.
#[derive(Error, Debug)]
pub enum AgentermError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Bad input at an interface boundary. Surfaced, never retried.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Command-policy deny, approval-gate deny, or scheduler deny.
    #[error("Policy error [{rule}]: {message}")]
    Policy { rule: String, message: String },

    /// LLM provider or WebSocket transport failure. Retried with capped
    /// exponential backoff.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Repository conflict or unknown entity.
    #[error("State error: {message}")]
    State { message: String },

    /// PTY spawn or read/write failure. The session transitions to
    /// `failed`, not `completed`.
    #[error("Terminal error [{session_id}]: {message}")]
    Terminal {
        session_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Git operation error
    #[error("Git error: {message}")]
    Git {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invariant violation. Logged with correlation IDs and fails the
    /// current request.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for agenterm operations
pub type Result<T> = std::result::Result<T, AgentermError>;

impl AgentermError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a policy error
    pub fn policy<R: Into<String>, S: Into<String>>(rule: R, message: S) -> Self {
        Self::Policy {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a state error
    pub fn state<S: Into<String>>(message: S) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a terminal error
    pub fn terminal<I: Into<String>, S: Into<String>>(session_id: I, message: S) -> Self {
        Self::Terminal {
            session_id: session_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a git error
    pub fn git<S: Into<String>>(message: S) -> Self {
        Self::Git {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the operation should be retried with backoff.
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<agent_session::PolicyViolation> for AgentermError {
    fn from(v: agent_session::PolicyViolation) -> Self {
        Self::Policy {
            rule: v.rule,
            message: v.token,
        }
    }
}
