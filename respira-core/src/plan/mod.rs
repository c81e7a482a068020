//! Phase pattern generation.
//!
//! A `PlanGenerator` turns a `PlanRequest` into an immutable `ExercisePlan`.
//! Three strategies exist:
//! - `FixedPlanGenerator`: stress level → staged guided session (pure)
//! - `MoodPresetGenerator`: mood bucket → canned breathing pattern (pure)
//! - `CustomPlanGenerator`: free-text mood → remotely generated pattern
//!
//! `Planner` routes each request to the strategy that handles it.

pub mod custom;
pub mod fixed;
pub mod preset;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::PlanError;
use crate::service::GuidanceService;
use crate::types::{ExercisePlan, StressLevel};

pub use custom::CustomPlanGenerator;
pub use fixed::{BASE_STAGES, FixedPlanGenerator, LevelProfile, stages_for};
pub use preset::{MoodPreset, MoodPresetGenerator};

/// What the caller wants a plan for.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanRequest {
    Level {
        level: StressLevel,
        display_name: Option<String>,
    },
    Mood {
        text: String,
        display_name: String,
    },
    Preset {
        preset: MoodPreset,
        display_name: String,
    },
}

impl PlanRequest {
    pub fn level(level: StressLevel) -> Self {
        PlanRequest::Level {
            level,
            display_name: None,
        }
    }

    pub fn mood(text: impl Into<String>, display_name: impl Into<String>) -> Self {
        PlanRequest::Mood {
            text: text.into(),
            display_name: display_name.into(),
        }
    }

    pub fn preset(preset: MoodPreset, display_name: impl Into<String>) -> Self {
        PlanRequest::Preset {
            preset,
            display_name: display_name.into(),
        }
    }

    /// Short name of the request kind, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            PlanRequest::Level { .. } => "level",
            PlanRequest::Mood { .. } => "mood",
            PlanRequest::Preset { .. } => "preset",
        }
    }
}

/// Strategy for producing a plan.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, request: &PlanRequest) -> Result<ExercisePlan, PlanError>;

    fn name(&self) -> &str;
}

/// Routes requests to the fixed, preset or custom generator.
pub struct Planner {
    fixed: FixedPlanGenerator,
    presets: MoodPresetGenerator,
    custom: CustomPlanGenerator,
}

impl Planner {
    pub fn new(service: Arc<dyn GuidanceService>, preset_cycles: u32) -> Self {
        Self {
            fixed: FixedPlanGenerator,
            presets: MoodPresetGenerator::new(preset_cycles),
            custom: CustomPlanGenerator::new(service),
        }
    }
}

#[async_trait]
impl PlanGenerator for Planner {
    async fn generate(&self, request: &PlanRequest) -> Result<ExercisePlan, PlanError> {
        let generator: &dyn PlanGenerator = match request {
            PlanRequest::Level { .. } => &self.fixed,
            PlanRequest::Preset { .. } => &self.presets,
            PlanRequest::Mood { .. } => &self.custom,
        };
        tracing::debug!(request = request.kind(), generator = generator.name(), "Generating plan");
        generator.generate(request).await
    }

    fn name(&self) -> &str {
        "planner"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MockVoiceService;

    #[tokio::test]
    async fn test_planner_routes_by_request() {
        let mock = Arc::new(MockVoiceService::new());
        let planner = Planner::new(mock.clone(), 2);

        let fixed = planner
            .generate(&PlanRequest::level(StressLevel::new(3).unwrap()))
            .await
            .unwrap();
        assert!(fixed.is_stage_based());

        let preset = planner
            .generate(&PlanRequest::preset(MoodPreset::Calm, "Ada"))
            .await
            .unwrap();
        assert_eq!(preset.segment_count(), 4);

        let custom = planner
            .generate(&PlanRequest::mood("exhausted", "Ada"))
            .await
            .unwrap();
        assert_eq!(custom.display_name, "Energizing Breath");
        assert_eq!(mock.custom_calls(), 1);
    }

    #[test]
    fn test_request_kind() {
        assert_eq!(PlanRequest::mood("x", "y").kind(), "mood");
        assert_eq!(PlanRequest::level(StressLevel::MIN).kind(), "level");
    }
}
