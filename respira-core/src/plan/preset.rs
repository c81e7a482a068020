//! Mood buckets with canned breathing patterns.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

use super::{PlanGenerator, PlanRequest};
use crate::error::PlanError;
use crate::types::{ExercisePlan, PhaseStep, Script, StressLevel};

/// A fixed mood bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoodPreset {
    Anxious,
    Stressed,
    Tired,
    Sad,
    Angry,
    Calm,
    Energized,
}

impl MoodPreset {
    pub const ALL: [MoodPreset; 7] = [
        MoodPreset::Anxious,
        MoodPreset::Stressed,
        MoodPreset::Tired,
        MoodPreset::Sad,
        MoodPreset::Angry,
        MoodPreset::Calm,
        MoodPreset::Energized,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MoodPreset::Anxious => "Anxious",
            MoodPreset::Stressed => "Stressed",
            MoodPreset::Tired => "Tired",
            MoodPreset::Sad => "Sad",
            MoodPreset::Angry => "Angry",
            MoodPreset::Calm => "Calm",
            MoodPreset::Energized => "Energized",
        }
    }

    pub fn exercise_name(&self) -> &'static str {
        match self {
            MoodPreset::Anxious => "4-7-8 Breathing",
            MoodPreset::Stressed => "Box Breathing",
            MoodPreset::Tired => "Energizing Breath",
            MoodPreset::Sad => "Coherent Breathing",
            MoodPreset::Angry => "Calming Breath",
            MoodPreset::Calm => "Equal Breathing",
            MoodPreset::Energized => "Power Breath",
        }
    }

    /// One cycle of the pattern.
    pub fn pattern(&self) -> Vec<PhaseStep> {
        use PhaseStep as P;
        match self {
            MoodPreset::Anxious => vec![P::inhale(4), P::hold(7), P::exhale(8)],
            MoodPreset::Stressed => vec![P::inhale(4), P::hold(4), P::exhale(4), P::hold(4)],
            MoodPreset::Tired => vec![
                P::inhale(4),
                P::exhale(2),
                P::inhale(4),
                P::exhale(2),
                P::inhale(4),
                P::exhale(2),
            ],
            MoodPreset::Sad => vec![P::inhale(5), P::exhale(5)],
            MoodPreset::Angry => vec![P::inhale(4), P::exhale(8)],
            MoodPreset::Calm => vec![P::inhale(4), P::exhale(4)],
            MoodPreset::Energized => vec![P::inhale(6), P::hold(2), P::exhale(4)],
        }
    }

    pub fn introduction(&self) -> &'static str {
        match self {
            MoodPreset::Anxious => {
                "This is a powerful technique for calming your nervous system. Let's begin."
            }
            MoodPreset::Stressed => {
                "It will help you regulate your breath and clear your mind. Let us start."
            }
            MoodPreset::Tired => {
                "This rhythmic breathing will help awaken your senses. Let's get started."
            }
            MoodPreset::Sad => {
                "This gentle rhythm can help create a sense of balance and peace. Let us begin."
            }
            MoodPreset::Angry => {
                "Focusing on a longer exhale can help soothe feelings of anger. Let us start."
            }
            MoodPreset::Calm => {
                "This simple practice will help maintain your peaceful state. Let us begin."
            }
            MoodPreset::Energized => "This technique can help you focus your energy. Let's begin.",
        }
    }

    pub fn reassurance(&self) -> &'static str {
        match self {
            MoodPreset::Anxious => "alleviate your anxiety",
            MoodPreset::Stressed => "relieve your stress",
            MoodPreset::Tired => "boost your energy",
            MoodPreset::Sad => "gently lift your mood",
            MoodPreset::Angry => "find a sense of calm",
            MoodPreset::Calm => "deepen your sense of peace",
            MoodPreset::Energized => "channel your positive energy",
        }
    }

    pub fn stress_score(&self) -> StressLevel {
        let score = match self {
            MoodPreset::Anxious | MoodPreset::Stressed => 4,
            MoodPreset::Tired | MoodPreset::Sad => 3,
            MoodPreset::Angry => 5,
            MoodPreset::Calm => 2,
            MoodPreset::Energized => 1,
        };
        StressLevel::saturating(score)
    }
}

impl fmt::Display for MoodPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MoodPreset {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoodPreset::ALL
            .into_iter()
            .find(|m| m.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PlanError::UnknownPreset {
                name: s.to_string(),
            })
    }
}

/// Expands a preset pattern into a fixed number of cycles.
#[derive(Debug, Clone, Copy)]
pub struct MoodPresetGenerator {
    cycles: u32,
}

impl Default for MoodPresetGenerator {
    fn default() -> Self {
        Self { cycles: 5 }
    }
}

impl MoodPresetGenerator {
    pub fn new(cycles: u32) -> Self {
        Self {
            cycles: cycles.max(1),
        }
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn plan(&self, preset: MoodPreset, display_name: &str) -> ExercisePlan {
        let cycle = preset.pattern();
        let steps: Vec<PhaseStep> = (0..self.cycles).flat_map(|_| cycle.iter().copied()).collect();
        let mood = preset.label().to_lowercase();
        ExercisePlan::assemble(
            Script::Phases(steps),
            preset.exercise_name(),
            format!(
                "Thank you for sharing, {display_name}. I understand you're feeling {mood}. \
                 I will guide you through a transformative meditation to help you {}. {}",
                preset.reassurance(),
                preset.introduction()
            ),
            format!(
                "Well done, {display_name}. Whenever you're ready, you may repeat this session or close the screen."
            ),
            preset.stress_score(),
        )
        .with_interpreted_mood(preset.label())
    }
}

#[async_trait]
impl PlanGenerator for MoodPresetGenerator {
    async fn generate(&self, request: &PlanRequest) -> Result<ExercisePlan, PlanError> {
        match request {
            PlanRequest::Preset {
                preset,
                display_name,
            } => Ok(self.plan(*preset, display_name)),
            other => Err(PlanError::GenerationFailed {
                message: format!("preset generator cannot handle {}", other.kind()),
            }),
        }
    }

    fn name(&self) -> &str {
        "preset"
    }
}
