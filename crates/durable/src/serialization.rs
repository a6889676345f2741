//! Error envelope storage format
//!
//! Step and workflow errors are persisted as a structural JSON envelope and
//! rehydrated on replay as a neutral value exposing the same fields. The
//! original message survives the round trip; the concrete Rust type does not.

use serde::{Deserialize, Serialize};

use crate::error::DurableError;

/// Persisted form of an error: `{ name, message, stack?, cause? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error kind name, e.g. `"RetriesExceeded"` or `"Application"`
    pub name: String,

    /// Human-readable message
    pub message: String,

    /// Captured backtrace, when one was available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Nested cause envelope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorEnvelope>>,
}

impl ErrorEnvelope {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    /// Capture an error into its storable envelope
    pub fn capture(err: &DurableError) -> Self {
        match err {
            DurableError::Recorded(envelope) => envelope.clone(),
            DurableError::RetriesExceeded {
                step,
                max_attempts,
                cause,
            } => Self {
                name: "RetriesExceeded".to_string(),
                message: format!("step {step} exceeded {max_attempts} attempts"),
                stack: None,
                cause: Some(Box::new(Self::capture(cause))),
            },
            DurableError::Conflict { .. } => Self::new("Conflict", err.to_string()),
            DurableError::NotRegistered(_) => Self::new("NotRegistered", err.to_string()),
            DurableError::Application(message) => Self::new("Application", message.clone()),
            DurableError::Serialization(e) => Self::new("Serialization", e.to_string()),
            DurableError::UserDatabase(e) => Self::new("UserDatabase", e.to_string()),
            other => Self::new("Internal", other.to_string()),
        }
    }

    /// Serialize to the stored JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("error envelope is always serializable")
    }

    /// Parse a stored envelope, tolerating free-form legacy strings
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::new("Unknown", raw.to_string()))
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

impl From<ErrorEnvelope> for DurableError {
    fn from(envelope: ErrorEnvelope) -> Self {
        DurableError::Recorded(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let envelope = ErrorEnvelope::new("Application", "payment declined");
        let parsed = ErrorEnvelope::from_json(&envelope.to_json());
        assert_eq!(envelope, parsed);
    }

    #[test]
    fn test_capture_nests_cause() {
        let err = DurableError::RetriesExceeded {
            step: "charge".to_string(),
            max_attempts: 3,
            cause: Box::new(DurableError::application("card expired")),
        };

        let envelope = ErrorEnvelope::capture(&err);
        assert_eq!(envelope.name, "RetriesExceeded");
        let cause = envelope.cause.expect("should capture cause");
        assert_eq!(cause.name, "Application");
        assert_eq!(cause.message, "card expired");
    }

    #[test]
    fn test_capture_is_stable_for_recorded() {
        let envelope = ErrorEnvelope::new("Application", "boom");
        let rehydrated = DurableError::Recorded(envelope.clone());
        assert_eq!(ErrorEnvelope::capture(&rehydrated), envelope);
    }

    #[test]
    fn test_legacy_string_tolerated() {
        let parsed = ErrorEnvelope::from_json("not json at all");
        assert_eq!(parsed.name, "Unknown");
        assert_eq!(parsed.message, "not json at all");
    }
}
