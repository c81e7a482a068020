//! Remote voice/text service.
//!
//! Speech synthesis, per-stage guidance text and custom exercise generation are
//! delegated to hosted functions. Two traits split the concerns:
//! - `SpeechSynthesizer`: text → audio clip
//! - `GuidanceService`: text generation (stage guidance, custom exercises,
//!   stress history analysis)
//!
//! `FunctionsClient` implements both over HTTP; `MockVoiceService` implements
//! both in memory for tests and offline runs.

pub mod functions;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::audio::AudioClip;
use crate::error::ServiceError;
use crate::insights::StressStats;
use crate::types::{PhaseStep, StressEntry, StressLevel, Voice};

pub use functions::FunctionsClient;
pub use mock::MockVoiceService;

/// A speech synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: Voice,
    pub speed: f32,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: Voice::default(),
            speed: 0.85,
        }
    }

    pub fn with_voice(mut self, voice: Voice) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }
}

/// Request for the guidance text of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceRequest {
    pub stress_level: StressLevel,
    #[serde(rename = "phase")]
    pub stage_key: String,
    pub user_name: String,
    pub current_step: usize,
}

/// Request for a mood-tailored exercise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomExerciseRequest {
    pub mood_text: String,
    pub first_name: String,
}

/// Raw custom exercise payload. Every field is optional on the wire; the plan
/// generator decides whether the payload is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomExercise {
    #[serde(default)]
    pub interpreted_mood: Option<String>,
    #[serde(default)]
    pub exercise_name: Option<String>,
    #[serde(default)]
    pub introductory_guidance: Option<String>,
    #[serde(default)]
    pub completion_guidance: Option<String>,
    #[serde(default)]
    pub stress_score: Option<serde_json::Value>,
    #[serde(default)]
    pub music_category: Option<String>,
    #[serde(default)]
    pub pattern: Vec<PhaseStep>,
}

/// Request for a written analysis of recent stress entries, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressAnalysisRequest {
    pub stress_entries: Vec<StressEntry>,
}

/// Analysis text plus the statistics the service based it on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StressAnalysis {
    pub analysis: String,
    #[serde(default)]
    pub stats: Option<StressStats>,
}

/// Text-to-speech backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `request.text` into an encoded clip.
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioClip, ServiceError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

/// Text-generation backend.
#[async_trait]
pub trait GuidanceService: Send + Sync {
    /// Guidance text for one stage of a session.
    async fn generate_guidance_text(&self, request: &GuidanceRequest)
    -> Result<String, ServiceError>;

    /// A breathing exercise tailored to a free-text mood.
    async fn generate_custom_exercise(
        &self,
        request: &CustomExerciseRequest,
    ) -> Result<CustomExercise, ServiceError>;

    /// Supportive written insights over the user's stress history.
    async fn analyze_stress(
        &self,
        request: &StressAnalysisRequest,
    ) -> Result<StressAnalysis, ServiceError>;
}

/// Retry settings for transient service failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `operation`, retrying with exponential backoff while the error is
/// retryable. Client errors return immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, ServiceError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient service error"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_stress_analysis_wire_shape() {
        let request = StressAnalysisRequest {
            stress_entries: vec![StressEntry::new(
                "user-1",
                StressLevel::new(4).unwrap(),
                Some("Deadline week".into()),
            )],
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["stressEntries"][0]["stress_score"], 4);
        assert_eq!(body["stressEntries"][0]["notes"], "Deadline week");

        let raw = serde_json::json!({
            "analysis": "You're doing well.",
            "stats": {"total": 1, "average": 4.0, "highStress": 1, "lowStress": 0, "trend": 4.0}
        });
        let analysis: StressAnalysis = serde_json::from_value(raw).unwrap();
        assert_eq!(analysis.stats.unwrap().high_stress, 1);
    }

    #[test]
    fn test_custom_exercise_wire_shape() {
        let raw = serde_json::json!({
            "interpretedMood": "Tired",
            "exerciseName": "Energizing Breath",
            "introductoryGuidance": "Let's wake up.",
            "completionGuidance": "Well done.",
            "stressScore": 3,
            "musicCategory": "nature",
            "pattern": [
                {"phase": "inhale", "duration": 4},
                {"phase": "exhale", "duration": 2}
            ]
        });
        let exercise: CustomExercise = serde_json::from_value(raw).unwrap();
        assert_eq!(exercise.exercise_name.as_deref(), Some("Energizing Breath"));
        assert_eq!(exercise.pattern.len(), 2);
        assert_eq!(exercise.music_category.as_deref(), Some("nature"));
    }

    #[test]
    fn test_guidance_request_wire_shape() {
        let req = GuidanceRequest {
            stress_level: StressLevel::new(3).unwrap(),
            stage_key: "body_awareness".into(),
            user_name: "Sam".into(),
            current_step: 2,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["stressLevel"], 3);
        assert_eq!(json["phase"], "body_awareness");
        assert_eq!(json["userName"], "Sam");
        assert_eq!(json["currentStep"], 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient_error() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ServiceError::Unavailable {
                    status: 503,
                    message: "busy".into(),
                })
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_client_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Rejected {
                status: 400,
                message: "bad".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
