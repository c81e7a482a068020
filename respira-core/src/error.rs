//! Error types for the Respira session engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the remote voice service, the data store, plan generation,
//! narration, audio playback, configuration, and the session state machine.

use std::path::PathBuf;

/// Top-level error type for the Respira core library.
#[derive(Debug, thiserror::Error)]
pub enum RespiraError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Narration error: {0}")]
    Narration(#[from] NarrationError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the remote voice/text service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Service unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Service returned empty audio")]
    EmptyAudio,
}

impl ServiceError {
    /// Whether the caller may retry or fall back. Client errors (4xx) are
    /// surfaced to the user instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Unavailable { .. }
                | ServiceError::Connection { .. }
                | ServiceError::Timeout { .. }
        )
    }

    /// Whether the caller's credentials were refused. Only signing in again helps.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ServiceError::AuthFailed { .. })
    }

    /// Human-readable message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            ServiceError::AuthFailed { message }
            | ServiceError::Rejected { message, .. }
            | ServiceError::Unavailable { message, .. }
            | ServiceError::Connection { message }
            | ServiceError::MalformedResponse { message } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from the external data store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Not authenticated with the data store")]
    Unauthenticated,

    #[error("Store request failed: {message}")]
    Request { message: String },

    #[error("Store returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode store response: {message}")]
    Decode { message: String },
}

/// Errors from the phase pattern generator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error("Stress level must be between 1 and 5, got {level}")]
    InvalidStressLevel { level: i64 },

    #[error("Mood description is empty")]
    EmptyMood,

    #[error("Unknown mood preset: {name}")]
    UnknownPreset { name: String },

    #[error("Exercise generation failed: {message}")]
    GenerationFailed { message: String },

    #[error("Not signed in: {message}")]
    Unauthenticated { message: String },

    #[error("Plan has no steps")]
    EmptyPlan,
}

/// Errors from the narration driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NarrationError {
    #[error("Speech synthesis failed: {0}")]
    Synthesis(#[from] ServiceError),

    #[error("Narration playback failed: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Narration timed out after {timeout_secs}s")]
    TimedOut { timeout_secs: u64 },

    #[error("Nothing to narrate")]
    EmptyText,
}

impl NarrationError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, NarrationError::Synthesis(e) if e.is_auth_failure())
    }
}

/// Errors from an audio channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlaybackError {
    #[error("No clip loaded on channel '{channel}'")]
    NothingLoaded { channel: String },

    #[error("Playback was interrupted")]
    Interrupted,

    #[error("Audio device error: {message}")]
    Device { message: String },

    #[error("Playback blocked: {message}")]
    Blocked { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the session sequencer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Cannot {action} while {from}")]
    InvalidTransition { from: String, action: String },

    #[error("No plan is loaded")]
    NoPlan,

    #[error("Mood description is empty")]
    EmptyMood,

    #[error("Sign in again to continue")]
    Unauthenticated,

    #[error("Session has been torn down")]
    TornDown,
}

/// A type alias for results using the top-level `RespiraError`.
pub type Result<T> = std::result::Result<T, RespiraError>;
