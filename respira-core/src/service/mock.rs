//! In-memory voice service for tests and offline runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    CustomExercise, CustomExerciseRequest, GuidanceRequest, GuidanceService, SpeechRequest,
    SpeechSynthesizer, StressAnalysis, StressAnalysisRequest,
};
use crate::audio::AudioClip;
use crate::error::ServiceError;
use crate::insights::StressStats;
use crate::types::PhaseStep;

/// Encoded bytes produced per narrated character (~32 characters per second
/// at the estimate bit rate).
const BYTES_PER_CHAR: usize = 500;

#[derive(Debug, Default)]
struct MockState {
    speech_failure: Option<ServiceError>,
    speech_delay: Duration,
    guidance_failure: Option<ServiceError>,
    guidance_delays: HashMap<String, Duration>,
    custom_response: Option<Result<CustomExercise, ServiceError>>,
    custom_delay: Duration,
    analysis_failure: Option<ServiceError>,
    spoken: Vec<String>,
    guidance_requests: Vec<GuidanceRequest>,
}

/// Scriptable stand-in for the hosted functions.
#[derive(Debug, Default)]
pub struct MockVoiceService {
    speech_calls: AtomicUsize,
    guidance_calls: AtomicUsize,
    custom_calls: AtomicUsize,
    analysis_calls: AtomicUsize,
    state: Mutex<MockState>,
}

impl MockVoiceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The exercise returned when no custom response has been scripted.
    pub fn sample_exercise() -> CustomExercise {
        CustomExercise {
            interpreted_mood: Some("Tired".to_string()),
            exercise_name: Some("Energizing Breath".to_string()),
            introductory_guidance: Some(
                "This rhythmic breathing will help awaken your senses.".to_string(),
            ),
            completion_guidance: Some("Well done. Notice the new energy in your body.".to_string()),
            stress_score: Some(serde_json::json!(3)),
            music_category: Some("nature".to_string()),
            pattern: vec![
                PhaseStep::inhale(4),
                PhaseStep::exhale(2),
                PhaseStep::inhale(4),
                PhaseStep::exhale(2),
                PhaseStep::inhale(4),
                PhaseStep::exhale(2),
            ],
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_speech_failure(&self, error: Option<ServiceError>) {
        self.lock().speech_failure = error;
    }

    pub fn set_speech_delay(&self, delay: Duration) {
        self.lock().speech_delay = delay;
    }

    pub fn set_guidance_failure(&self, error: Option<ServiceError>) {
        self.lock().guidance_failure = error;
    }

    /// Delay guidance responses for one stage key.
    pub fn set_guidance_delay(&self, stage_key: impl Into<String>, delay: Duration) {
        self.lock().guidance_delays.insert(stage_key.into(), delay);
    }

    pub fn set_custom_response(&self, response: Result<CustomExercise, ServiceError>) {
        self.lock().custom_response = Some(response);
    }

    pub fn set_custom_delay(&self, delay: Duration) {
        self.lock().custom_delay = delay;
    }

    pub fn set_analysis_failure(&self, error: Option<ServiceError>) {
        self.lock().analysis_failure = error;
    }

    pub fn analysis_calls(&self) -> usize {
        self.analysis_calls.load(Ordering::SeqCst)
    }

    pub fn speech_calls(&self) -> usize {
        self.speech_calls.load(Ordering::SeqCst)
    }

    pub fn guidance_calls(&self) -> usize {
        self.guidance_calls.load(Ordering::SeqCst)
    }

    pub fn custom_calls(&self) -> usize {
        self.custom_calls.load(Ordering::SeqCst)
    }

    /// Every text passed to `synthesize`, in call order.
    pub fn spoken_texts(&self) -> Vec<String> {
        self.lock().spoken.clone()
    }

    pub fn guidance_requests(&self) -> Vec<GuidanceRequest> {
        self.lock().guidance_requests.clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockVoiceService {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioClip, ServiceError> {
        self.speech_calls.fetch_add(1, Ordering::SeqCst);
        let (failure, delay) = {
            let mut state = self.lock();
            state.spoken.push(request.text.clone());
            (state.speech_failure.clone(), state.speech_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if request.text.is_empty() {
            return Err(ServiceError::EmptyAudio);
        }
        let bytes = vec![0u8; request.text.chars().count() * BYTES_PER_CHAR];
        Ok(AudioClip::mpeg(request.text.clone(), bytes))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[async_trait]
impl GuidanceService for MockVoiceService {
    async fn generate_guidance_text(
        &self,
        request: &GuidanceRequest,
    ) -> Result<String, ServiceError> {
        self.guidance_calls.fetch_add(1, Ordering::SeqCst);
        let (failure, delay) = {
            let mut state = self.lock();
            state.guidance_requests.push(request.clone());
            (
                state.guidance_failure.clone(),
                state
                    .guidance_delays
                    .get(&request.stage_key)
                    .copied()
                    .unwrap_or_default(),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(format!(
                "{}, guidance for {}.",
                request.user_name, request.stage_key
            )),
        }
    }

    async fn generate_custom_exercise(
        &self,
        _request: &CustomExerciseRequest,
    ) -> Result<CustomExercise, ServiceError> {
        self.custom_calls.fetch_add(1, Ordering::SeqCst);
        let (response, delay) = {
            let state = self.lock();
            (state.custom_response.clone(), state.custom_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        response.unwrap_or_else(|| Ok(Self::sample_exercise()))
    }

    async fn analyze_stress(
        &self,
        request: &StressAnalysisRequest,
    ) -> Result<StressAnalysis, ServiceError> {
        self.analysis_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.lock().analysis_failure.clone() {
            return Err(err);
        }
        let stats = StressStats::from_entries(&request.stress_entries).ok_or_else(|| {
            ServiceError::Rejected {
                status: 400,
                message: "No stress entries provided".to_string(),
            }
        })?;
        Ok(StressAnalysis {
            analysis: format!(
                "Across {} sessions your average stress was {:.1}/5 and the trend is {}. \
                 Keep making time for slow, steady breathing.",
                stats.total,
                stats.average,
                stats.direction().to_string().to_lowercase()
            ),
            stats: Some(stats),
        })
    }
}
