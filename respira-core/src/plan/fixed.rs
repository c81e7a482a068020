//! Stress level → staged guided session.

use async_trait::async_trait;

use super::{PlanGenerator, PlanRequest};
use crate::error::PlanError;
use crate::types::{ExercisePlan, Script, Stage, StressLevel};

/// Canonical stage of a guided session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTemplate {
    pub key: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

/// The full eight-stage session; shorter sessions use a prefix.
pub const BASE_STAGES: [StageTemplate; 8] = [
    StageTemplate {
        key: "opening_preparation",
        label: "Welcome & Preparation",
        description: "Getting comfortable and ready to begin",
    },
    StageTemplate {
        key: "grounding_breathwork",
        label: "Grounding Breath",
        description: "Simple breathing to center yourself",
    },
    StageTemplate {
        key: "body_awareness",
        label: "Body Scan",
        description: "Releasing tension throughout your body",
    },
    StageTemplate {
        key: "breathing_with_intention",
        label: "Deep Breathing",
        description: "Focused breathing for relaxation",
    },
    StageTemplate {
        key: "guided_visualization",
        label: "Peaceful Imagery",
        description: "Calming mental visualization",
    },
    StageTemplate {
        key: "deep_stillness",
        label: "Quiet Meditation",
        description: "Resting in peaceful stillness",
    },
    StageTemplate {
        key: "affirmations",
        label: "Positive Affirmations",
        description: "Reinforcing your well-being",
    },
    StageTemplate {
        key: "closing",
        label: "Gentle Return",
        description: "Coming back to full awareness",
    },
];

/// Scale applied to the first and last stage.
pub const EDGE_STAGE_FACTOR: f64 = 0.6;

/// Session shape for one stress level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelProfile {
    pub stage_count: usize,
    pub base_secs: u32,
    pub multiplier: f64,
    pub label: &'static str,
}

impl LevelProfile {
    pub fn for_level(level: StressLevel) -> Self {
        let (stage_count, base_secs, multiplier, label) = match level.get() {
            1 => (4, 45, 1.0, "Quick Relief"),
            2 => (5, 60, 1.2, "Moderate Relief"),
            3 => (6, 75, 1.4, "Deep Relief"),
            4 => (7, 90, 1.6, "Extended Relief"),
            _ => (8, 105, 1.8, "Complete Relief"),
        };
        Self {
            stage_count,
            base_secs,
            multiplier,
            label,
        }
    }

    /// Duration of the stage at `index`.
    pub fn stage_secs(&self, index: usize) -> u32 {
        let edge = index == 0 || index + 1 == self.stage_count;
        let factor = if edge { EDGE_STAGE_FACTOR } else { 1.0 };
        (self.base_secs as f64 * self.multiplier * factor).round() as u32
    }
}

/// Stages for a stress level, in session order.
pub fn stages_for(level: StressLevel) -> Vec<Stage> {
    let profile = LevelProfile::for_level(level);
    BASE_STAGES
        .iter()
        .take(profile.stage_count)
        .enumerate()
        .map(|(i, t)| Stage {
            key: t.key.to_string(),
            label: t.label.to_string(),
            description: t.description.to_string(),
            duration_secs: profile.stage_secs(i),
        })
        .collect()
}

pub fn completion_line(display_name: Option<&str>) -> String {
    format!(
        "{}, you've done something wonderful for yourself. Carry this peace with you.",
        display_name.unwrap_or("You")
    )
}

/// Pure table lookup; never fails for a valid level.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPlanGenerator;

impl FixedPlanGenerator {
    pub fn plan(&self, level: StressLevel, display_name: Option<&str>) -> ExercisePlan {
        let profile = LevelProfile::for_level(level);
        // The first stage's guidance opens the session.
        ExercisePlan::assemble(
            Script::Stages(stages_for(level)),
            profile.label,
            String::new(),
            completion_line(display_name),
            level,
        )
    }
}

#[async_trait]
impl PlanGenerator for FixedPlanGenerator {
    async fn generate(&self, request: &PlanRequest) -> Result<ExercisePlan, PlanError> {
        match request {
            PlanRequest::Level {
                level,
                display_name,
            } => Ok(self.plan(*level, display_name.as_deref())),
            other => Err(PlanError::GenerationFailed {
                message: format!("fixed generator cannot handle {}", other.kind()),
            }),
        }
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn level(n: i64) -> StressLevel {
        StressLevel::new(n).unwrap()
    }

    #[test]
    fn test_level_three_durations() {
        let durations: Vec<u32> = stages_for(level(3)).iter().map(|s| s.duration_secs).collect();
        assert_eq!(durations, vec![63, 105, 105, 105, 105, 63]);
    }

    #[test]
    fn test_stage_counts_per_level() {
        let counts: Vec<usize> = StressLevel::all().map(|l| stages_for(l).len()).collect();
        assert_eq!(counts, vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_stages_are_a_prefix_ending_with_last_taken() {
        let stages = stages_for(level(1));
        let keys: Vec<&str> = stages.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "opening_preparation",
                "grounding_breathwork",
                "body_awareness",
                "breathing_with_intention"
            ]
        );
        // Level 1 edge stages: round(45 * 0.6)
        assert_eq!(stages[0].duration_secs, 27);
        assert_eq!(stages[3].duration_secs, 27);
        assert_eq!(stages[1].duration_secs, 45);
    }

    #[test]
    fn test_plan_labels_and_completion() {
        let plan = FixedPlanGenerator.plan(level(5), Some("Ada"));
        assert_eq!(plan.display_name, "Complete Relief");
        assert_eq!(plan.segment_count(), 8);
        assert!(plan.completion_narration.starts_with("Ada, you've done"));
        assert!(plan.intro_narration.is_empty());

        let anonymous = FixedPlanGenerator.plan(level(2), None);
        assert!(anonymous.completion_narration.starts_with("You, you've done"));
    }

    #[test]
    fn test_total_matches_stage_sum() {
        for l in StressLevel::all() {
            let plan = FixedPlanGenerator.plan(l, None);
            let sum: u32 = stages_for(l).iter().map(|s| s.duration_secs).sum();
            assert_eq!(plan.total_duration_secs(), sum);
        }
    }

    #[tokio::test]
    async fn test_rejects_other_requests() {
        let err = FixedPlanGenerator
            .generate(&PlanRequest::mood("tired", "Ada"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::GenerationFailed { .. }));
    }
}
