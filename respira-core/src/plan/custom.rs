//! Free-text mood → remotely generated exercise.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{PlanGenerator, PlanRequest};
use crate::error::PlanError;
use crate::service::{CustomExercise, CustomExerciseRequest, GuidanceService};
use crate::types::{ExercisePlan, Script, StressLevel};

/// Allowed number of steps in a generated exercise.
pub const STEP_RANGE: std::ops::RangeInclusive<usize> = 4..=8;

/// Music categories the store knows about.
pub const MUSIC_CATEGORIES: [&str; 4] = ["background", "nature", "feelings", "health"];

/// Delegates to the remote exercise generator and validates the result.
///
/// Never fabricates a plan: a refused credential becomes
/// `PlanError::Unauthenticated`, any other remote failure or unusable payload
/// becomes `PlanError::GenerationFailed`.
pub struct CustomPlanGenerator {
    service: Arc<dyn GuidanceService>,
}

impl CustomPlanGenerator {
    pub fn new(service: Arc<dyn GuidanceService>) -> Self {
        Self { service }
    }

    pub async fn plan(&self, mood_text: &str, display_name: &str) -> Result<ExercisePlan, PlanError> {
        let mood_text = mood_text.trim();
        if mood_text.is_empty() {
            return Err(PlanError::EmptyMood);
        }
        let request = CustomExerciseRequest {
            mood_text: mood_text.to_string(),
            first_name: display_name.to_string(),
        };
        let exercise = self
            .service
            .generate_custom_exercise(&request)
            .await
            .map_err(|e| {
                warn!(error = %e, "Custom exercise request failed");
                if e.is_auth_failure() {
                    PlanError::Unauthenticated {
                        message: e.message(),
                    }
                } else {
                    PlanError::GenerationFailed {
                        message: e.message(),
                    }
                }
            })?;
        let plan = validate(exercise)?;
        info!(
            exercise = %plan.display_name,
            mood = plan.interpreted_mood.as_deref().unwrap_or_default(),
            steps = plan.segment_count(),
            "Generated custom exercise"
        );
        Ok(plan)
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, PlanError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PlanError::GenerationFailed {
            message: format!("response is missing {field}"),
        })
}

/// Turn a raw payload into a plan, rejecting anything malformed.
pub fn validate(exercise: CustomExercise) -> Result<ExercisePlan, PlanError> {
    let interpreted_mood = required("interpretedMood", exercise.interpreted_mood)?;
    let name = required("exerciseName", exercise.exercise_name)?;
    let intro = required("introductoryGuidance", exercise.introductory_guidance)?;
    let completion = required("completionGuidance", exercise.completion_guidance)?;

    let score = exercise
        .stress_score
        .as_ref()
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64)))
        .ok_or_else(|| PlanError::GenerationFailed {
            message: "response is missing stressScore".to_string(),
        })?;
    let score = StressLevel::new(score).map_err(|e| PlanError::GenerationFailed {
        message: e.to_string(),
    })?;

    if !STEP_RANGE.contains(&exercise.pattern.len()) {
        return Err(PlanError::GenerationFailed {
            message: format!(
                "pattern has {} steps, expected {} to {}",
                exercise.pattern.len(),
                STEP_RANGE.start(),
                STEP_RANGE.end()
            ),
        });
    }
    if let Some((i, _)) = exercise
        .pattern
        .iter()
        .enumerate()
        .find(|(_, s)| !s.is_well_formed())
    {
        return Err(PlanError::GenerationFailed {
            message: format!("pattern step {i} is malformed"),
        });
    }

    let mut plan = ExercisePlan::new(
        Script::Phases(exercise.pattern),
        name,
        intro,
        completion,
        score,
    )?
    .with_interpreted_mood(interpreted_mood);

    match exercise.music_category.map(|c| c.trim().to_lowercase()) {
        Some(category) if MUSIC_CATEGORIES.contains(&category.as_str()) => {
            plan = plan.with_music_category(category);
        }
        Some(category) if !category.is_empty() => {
            warn!(category = %category, "Ignoring unknown music category");
        }
        _ => {}
    }
    Ok(plan)
}

#[async_trait]
impl PlanGenerator for CustomPlanGenerator {
    async fn generate(&self, request: &PlanRequest) -> Result<ExercisePlan, PlanError> {
        match request {
            PlanRequest::Mood { text, display_name } => self.plan(text, display_name).await,
            other => Err(PlanError::GenerationFailed {
                message: format!("custom generator cannot handle {}", other.kind()),
            }),
        }
    }

    fn name(&self) -> &str {
        "custom"
    }
}
