use crate::types::TurnId;

use thiserror::Error;
use tracing::error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors raised by the three AI providers (and the resilience layer wrapping them).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("{provider}: timed out after {after_ms}ms")]
    Timeout { provider: String, after_ms: u64 },

    #[error("{provider}: rate limited")]
    RateLimited { provider: String },

    #[error("{provider}: service unavailable ({status})")]
    Unavailable { provider: String, status: u16 },

    #[error("{provider}: connection error: {message}")]
    Connection { provider: String, message: String },

    #[error("{provider}: bad request: {message}")]
    BadRequest { provider: String, message: String },

    #[error("{provider}: authentication failed")]
    Unauthorized { provider: String },

    #[error("{provider}: content policy rejection: {message}")]
    PolicyViolation { provider: String, message: String },

    #[error("{provider}: protocol error: {message}")]
    Protocol { provider: String, message: String },

    #[error("{provider}: circuit open")]
    CircuitOpen { provider: String },

    #[error("no provider configured for {capability}")]
    NoProvider { capability: &'static str },
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else surfaces immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Unavailable { .. }
                | ProviderError::Connection { .. }
        )
    }

    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Timeout { provider, .. }
            | ProviderError::RateLimited { provider }
            | ProviderError::Unavailable { provider, .. }
            | ProviderError::Connection { provider, .. }
            | ProviderError::BadRequest { provider, .. }
            | ProviderError::Unauthorized { provider }
            | ProviderError::PolicyViolation { provider, .. }
            | ProviderError::Protocol { provider, .. }
            | ProviderError::CircuitOpen { provider } => provider,
            ProviderError::NoProvider { capability } => capability,
        }
    }

    /// Short machine-readable kind used in emitted events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::RateLimited { .. } => "rate_limit",
            ProviderError::Unavailable { .. } => "unavailable",
            ProviderError::Connection { .. } => "connection",
            ProviderError::BadRequest { .. } => "bad_request",
            ProviderError::Unauthorized { .. } => "unauthorized",
            ProviderError::PolicyViolation { .. } => "policy_violation",
            ProviderError::Protocol { .. } => "protocol",
            ProviderError::CircuitOpen { .. } => "circuit_open",
            ProviderError::NoProvider { .. } => "no_provider",
        }
    }

    /// Classify an HTTP status returned by a provider API.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let provider = provider.to_string();
        match status {
            408 => ProviderError::Timeout {
                provider,
                after_ms: 0,
            },
            429 => ProviderError::RateLimited { provider },
            401 | 403 => ProviderError::Unauthorized { provider },
            451 => ProviderError::PolicyViolation {
                provider,
                message: body.to_string(),
            },
            s if s >= 500 => ProviderError::Unavailable { provider, status },
            _ => ProviderError::BadRequest {
                provider,
                message: format!("{status}: {body}"),
            },
        }
    }

    pub fn from_reqwest(provider: &str, e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            return ProviderError::Timeout {
                provider: provider.to_string(),
                after_ms: 0,
            };
        }
        if let Some(status) = e.status() {
            return ProviderError::from_status(provider, status.as_u16(), &e.to_string());
        }
        ProviderError::Connection {
            provider: provider.to_string(),
            message: e.to_string(),
        }
    }
}

/// Function-call validation failures; these are reported back into context, never executed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("function '{0}' is not in the allow-list")]
    NotAllowed(String),

    #[error("arguments are not a JSON object: {0}")]
    MalformedArguments(String),

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{param}' must be of type '{expected}', got '{got}'")]
    TypeMismatch {
        param: String,
        expected: String,
        got: String,
    },

    #[error("parameter '{param}' must be one of [{allowed}]")]
    NotInEnum { param: String, allowed: String },
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::NotAllowed(_) => "not_allowed",
            ValidationError::MalformedArguments(_) => "malformed_arguments",
            ValidationError::MissingParameter(_) => "missing_parameter",
            ValidationError::UnknownParameter(_) => "unknown_parameter",
            ValidationError::TypeMismatch { .. } => "type_mismatch",
            ValidationError::NotInEnum { .. } => "not_in_enum",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Fatal for the call: the store refused to drop protected history.
    #[error("context invariant violated: {0}")]
    InvariantViolation(String),

    #[error("turn {0} not found in context")]
    UnknownTurn(TurnId),

    #[error("turn {0} is not an agent turn")]
    NotAgentTurn(TurnId),

    #[error("turn {0} is still open")]
    OpenTurn(TurnId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("outbound transport closed")]
    Closed,

    #[error("outbound transport error: {0}")]
    Send(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    App(&'static str),
}

impl EngineError {
    /// Only a context invariant violation ends the call; everything else is per-turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Context(ContextError::InvariantViolation(_))
        )
    }
}

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ProviderError::from_status("openai", 429, "").is_retriable());
        assert!(ProviderError::from_status("openai", 503, "").is_retriable());
        assert!(ProviderError::from_status("openai", 408, "").is_retriable());
        assert!(!ProviderError::from_status("openai", 400, "bad").is_retriable());
        assert!(!ProviderError::from_status("openai", 401, "").is_retriable());
        assert_eq!(
            ProviderError::from_status("openai", 451, "nope").kind(),
            "policy_violation"
        );
    }

    #[test]
    fn circuit_open_is_not_retried() {
        let e = ProviderError::CircuitOpen {
            provider: "deepgram".into(),
        };
        assert!(!e.is_retriable());
        assert_eq!(e.provider(), "deepgram");
    }

    #[test]
    fn only_invariant_violations_are_fatal() {
        let fatal: EngineError = ContextError::InvariantViolation("x".into()).into();
        assert!(fatal.is_fatal());
        let not_fatal: EngineError = ProviderError::RateLimited {
            provider: "p".into(),
        }
        .into();
        assert!(!not_fatal.is_fatal());
    }
}
