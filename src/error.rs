//! Error types for the reactive-streams engine.

use std::sync::Arc;

use thiserror::Error as ThisError;

/// Violations of the subscription protocol.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `request(n)` was called with a non-positive amount.
    #[error("n > 0 required but it was {0}")]
    NonPositiveRequest(u64),

    /// `on_subscribe` was called more than once.
    #[error("subscription already set")]
    DuplicateSubscription,

    /// A unicast processor was subscribed to a second time.
    #[error("this processor allows only a single subscriber")]
    SingleSubscriberOnly,
}

/// The main error type carried by `on_error` signals.
#[derive(ThisError, Debug, Clone)]
pub enum Error {
    /// A producer signalled a terminal failure
    #[error("Upstream error: {0}")]
    Upstream(Arc<dyn std::error::Error + Send + Sync>),

    /// A user-supplied function failed while a signal was being processed
    #[error("Callback error: {0}")]
    Callback(Arc<dyn std::error::Error + Send + Sync>),

    /// A value had to be emitted but the consumer had not requested it
    #[error("Missing backpressure: {0}")]
    MissingBackpressure(String),

    /// The subscription protocol was violated
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Several errors were observed for the same terminal event
    #[error("{}", fmt_composite(.0))]
    Composite(Vec<Error>),

    /// An error that arrived after the terminal signal had been delivered
    #[error("Undeliverable error: {0}")]
    Undeliverable(Box<Error>),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

fn fmt_composite(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| format!("[{}]", e)).collect();
    format!("{} errors occurred: {}", errors.len(), parts.join(", "))
}

// Convenience constructors
impl Error {
    /// Create an upstream error from any error type
    pub fn upstream<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Upstream(Arc::new(error))
    }

    /// Create a callback error from any error type
    pub fn callback<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Callback(Arc::new(error))
    }

    /// Create a missing-backpressure error
    pub fn missing_backpressure<S: Into<String>>(message: S) -> Self {
        Error::MissingBackpressure(message.into())
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Merge errors observed for one terminal event.
    ///
    /// Nested composites are flattened. A single error is returned as-is.
    pub fn composite(errors: Vec<Error>) -> Self {
        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                Error::Composite(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        Error::Composite(flat)
    }

    /// The errors wrapped by this value; a non-composite error yields itself.
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Composite(errors) => errors,
            other => std::slice::from_ref(other),
        }
    }

    /// Returns a short stable label for use in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Upstream(_) => "upstream",
            Error::Callback(_) => "callback",
            Error::MissingBackpressure(_) => "missing_backpressure",
            Error::Protocol(_) => "protocol_violation",
            Error::Composite(_) => "composite",
            Error::Undeliverable(_) => "undeliverable",
            Error::Custom(_) => "custom",
        }
    }

    pub fn is_missing_backpressure(&self) -> bool {
        matches!(self, Error::MissingBackpressure(_))
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_flattens_nested_errors() {
        let inner = Error::composite(vec!["a".into(), "b".into()]);
        let outer = Error::composite(vec![inner, "c".into()]);

        let labels: Vec<String> = outer.errors().iter().map(|e| e.to_string()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
    }

    #[test]
    fn composite_of_one_is_the_error_itself() {
        let single = Error::composite(vec![Error::missing_backpressure("full")]);
        assert!(single.is_missing_backpressure());
    }

    #[test]
    fn display_and_labels() {
        let err = Error::from(ProtocolViolation::NonPositiveRequest(0));
        assert_eq!(err.to_string(), "Protocol violation: n > 0 required but it was 0");
        assert_eq!(err.as_label(), "protocol_violation");

        let composite = Error::composite(vec!["x".into(), "y".into()]);
        assert_eq!(composite.to_string(), "2 errors occurred: [x], [y]");
    }
}
