//! # Respira Core
//!
//! Core library for Respira guided breathing sessions.
//! Provides plan generation (fixed, preset and service-generated), the
//! session sequencer, voice narration, background music, stress history
//! insights, the remote voice/data service clients, configuration, and
//! fundamental types.

pub mod audio;
pub mod config;
pub mod error;
pub mod guidance;
pub mod insights;
pub mod music;
pub mod narration;
pub mod plan;
pub mod recorder;
pub mod service;
pub mod session;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use audio::{AudioChannel, AudioClip, SimulatedChannel};
pub use config::{RespiraConfig, load_config, save_config};
pub use error::{RespiraError, Result};
pub use plan::{MoodPreset, PlanGenerator, PlanRequest, Planner};
pub use service::{FunctionsClient, GuidanceService, MockVoiceService, SpeechSynthesizer};
pub use session::{SessionDeps, SessionSequencer, WelcomeFlow};
pub use store::{DataStore, InMemoryStore, RestDataStore};
pub use types::{
    ExercisePlan, PhaseKind, PhaseStep, Script, SessionSnapshot, SessionState, Stage, StressLevel,
    Voice,
};
