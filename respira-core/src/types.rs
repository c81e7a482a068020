//! Core data model shared by the generator, drivers and sequencer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PlanError;

/// A subjective stress score on the 1..=5 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct StressLevel(u8);

impl StressLevel {
    pub const MIN: StressLevel = StressLevel(1);
    pub const MAX: StressLevel = StressLevel(5);

    /// Create a stress level, rejecting values outside 1..=5.
    pub fn new(level: i64) -> Result<Self, PlanError> {
        if (1..=5).contains(&level) {
            Ok(Self(level as u8))
        } else {
            Err(PlanError::InvalidStressLevel { level })
        }
    }

    /// Clamp any score into 1..=5.
    pub const fn saturating(level: u8) -> Self {
        if level < 1 {
            Self(1)
        } else if level > 5 {
            Self(5)
        } else {
            Self(level)
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// All levels in ascending order.
    pub fn all() -> impl Iterator<Item = StressLevel> {
        (1..=5).map(StressLevel)
    }
}

impl TryFrom<i64> for StressLevel {
    type Error = PlanError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StressLevel> for u8 {
    fn from(level: StressLevel) -> Self {
        level.0
    }
}

impl fmt::Display for StressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a single breathing phase.
///
/// `Unrecognized` holds any wire value that is not one of the three known
/// phases, so a defective plan can be carried to the sequencer and rejected
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Inhale,
    Hold,
    Exhale,
    Unrecognized,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Inhale => "inhale",
            PhaseKind::Hold => "hold",
            PhaseKind::Exhale => "exhale",
            PhaseKind::Unrecognized => "unrecognized",
        }
    }

    /// Capitalized instruction shown to the user.
    pub fn label(&self) -> &'static str {
        match self {
            PhaseKind::Inhale => "Inhale",
            PhaseKind::Hold => "Hold",
            PhaseKind::Exhale => "Exhale",
            PhaseKind::Unrecognized => "",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "inhale" => PhaseKind::Inhale,
            "hold" => PhaseKind::Hold,
            "exhale" => PhaseKind::Exhale,
            _ => PhaseKind::Unrecognized,
        }
    }
}

impl Serialize for PhaseKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PhaseKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(value
            .as_str()
            .map(PhaseKind::parse)
            .unwrap_or(PhaseKind::Unrecognized))
    }
}

/// One inhale/hold/exhale unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStep {
    #[serde(rename = "phase")]
    pub kind: PhaseKind,
    /// Duration in whole seconds. Non-numeric wire values decode as 0.
    #[serde(rename = "duration", deserialize_with = "lenient_seconds")]
    pub duration_secs: u32,
}

impl PhaseStep {
    pub fn new(kind: PhaseKind, duration_secs: u32) -> Self {
        Self {
            kind,
            duration_secs,
        }
    }

    pub fn inhale(secs: u32) -> Self {
        Self::new(PhaseKind::Inhale, secs)
    }

    pub fn hold(secs: u32) -> Self {
        Self::new(PhaseKind::Hold, secs)
    }

    pub fn exhale(secs: u32) -> Self {
        Self::new(PhaseKind::Exhale, secs)
    }

    /// A step the sequencer can run: a known phase with a positive duration.
    pub fn is_well_formed(&self) -> bool {
        self.kind != PhaseKind::Unrecognized && self.duration_secs > 0
    }
}

fn lenient_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(seconds_from_value(&value).unwrap_or(0))
}

/// Interpret a JSON value as a whole number of seconds, if it is one.
pub(crate) fn seconds_from_value(value: &serde_json::Value) -> Option<u32> {
    if let Some(n) = value.as_u64() {
        return u32::try_from(n).ok();
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f >= 0.0 => Some(f.round() as u32),
        _ => None,
    }
}

/// A multi-minute segment of a guided session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub key: String,
    pub label: String,
    pub description: String,
    #[serde(rename = "duration")]
    pub duration_secs: u32,
}

/// The ordered body of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "segments", rename_all = "snake_case")]
pub enum Script {
    Phases(Vec<PhaseStep>),
    Stages(Vec<Stage>),
}

impl Script {
    pub fn len(&self) -> usize {
        match self {
            Script::Phases(steps) => steps.len(),
            Script::Stages(stages) => stages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-segment durations in seconds, in order.
    pub fn durations(&self) -> Vec<u32> {
        match self {
            Script::Phases(steps) => steps.iter().map(|s| s.duration_secs).collect(),
            Script::Stages(stages) => stages.iter().map(|s| s.duration_secs).collect(),
        }
    }
}

/// The full ordered script generated for one session.
///
/// The script is fixed at construction, and so is its total duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "PlanWire")]
pub struct ExercisePlan {
    pub display_name: String,
    pub intro_narration: String,
    pub completion_narration: String,
    pub stress_score: StressLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreted_mood: Option<String>,
    script: Script,
    total_duration_secs: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanWire {
    display_name: String,
    intro_narration: String,
    completion_narration: String,
    stress_score: StressLevel,
    #[serde(default)]
    music_category: Option<String>,
    #[serde(default)]
    interpreted_mood: Option<String>,
    script: Script,
}

impl TryFrom<PlanWire> for ExercisePlan {
    type Error = PlanError;

    fn try_from(wire: PlanWire) -> Result<Self, Self::Error> {
        let mut plan = ExercisePlan::new(
            wire.script,
            wire.display_name,
            wire.intro_narration,
            wire.completion_narration,
            wire.stress_score,
        )?;
        plan.music_category = wire.music_category;
        plan.interpreted_mood = wire.interpreted_mood;
        Ok(plan)
    }
}

impl ExercisePlan {
    /// Build a plan. The script must contain at least one segment.
    pub fn new(
        script: Script,
        display_name: impl Into<String>,
        intro_narration: impl Into<String>,
        completion_narration: impl Into<String>,
        stress_score: StressLevel,
    ) -> Result<Self, PlanError> {
        if script.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        Ok(Self::assemble(
            script,
            display_name,
            intro_narration,
            completion_narration,
            stress_score,
        ))
    }

    /// Build a plan from a script known to be non-empty.
    pub(crate) fn assemble(
        script: Script,
        display_name: impl Into<String>,
        intro_narration: impl Into<String>,
        completion_narration: impl Into<String>,
        stress_score: StressLevel,
    ) -> Self {
        let total_duration_secs = script.durations().iter().sum();
        Self {
            display_name: display_name.into(),
            intro_narration: intro_narration.into(),
            completion_narration: completion_narration.into(),
            stress_score,
            music_category: None,
            interpreted_mood: None,
            script,
            total_duration_secs,
        }
    }

    pub fn with_music_category(mut self, category: impl Into<String>) -> Self {
        self.music_category = Some(category.into());
        self
    }

    pub fn with_interpreted_mood(mut self, mood: impl Into<String>) -> Self {
        self.interpreted_mood = Some(mood.into());
        self
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Sum of all segment durations.
    pub fn total_duration_secs(&self) -> u32 {
        self.total_duration_secs
    }

    /// Index of the first segment the sequencer cannot run.
    pub fn first_malformed(&self) -> Option<usize> {
        match &self.script {
            Script::Phases(steps) => steps.iter().position(|s| !s.is_well_formed()),
            Script::Stages(stages) => stages.iter().position(|s| s.duration_secs == 0),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.script.len()
    }

    pub fn is_stage_based(&self) -> bool {
        matches!(self.script, Script::Stages(_))
    }

    pub fn phases(&self) -> Option<&[PhaseStep]> {
        match &self.script {
            Script::Phases(steps) => Some(steps),
            Script::Stages(_) => None,
        }
    }

    pub fn stages(&self) -> Option<&[Stage]> {
        match &self.script {
            Script::Stages(stages) => Some(stages),
            Script::Phases(_) => None,
        }
    }

    /// Display label of the segment at `index`.
    pub fn segment_label(&self, index: usize) -> Option<String> {
        match &self.script {
            Script::Phases(steps) => steps.get(index).map(|s| s.kind.label().to_string()),
            Script::Stages(stages) => stages.get(index).map(|s| s.label.clone()),
        }
    }
}

/// Per-stage background music configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicSetting {
    #[serde(rename = "phase")]
    pub stage_key: String,
    pub stress_level: u8,
    #[serde(rename = "music_id", default)]
    pub music_track_id: Option<String>,
    #[serde(default)]
    pub volume: Option<f32>,
    #[serde(rename = "fade_in_duration", default)]
    pub fade_in_secs: Option<f32>,
    #[serde(rename = "fade_out_duration", default)]
    pub fade_out_secs: Option<f32>,
}

/// A background music asset owned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicTrack {
    pub id: String,
    pub name: String,
    pub file_url: String,
    #[serde(rename = "duration", default)]
    pub duration_secs: f64,
    pub is_active: bool,
}

/// A persisted wellness event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressEntry {
    pub user_id: String,
    pub stress_score: StressLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StressEntry {
    pub fn new(user_id: impl Into<String>, stress_score: StressLevel, notes: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            stress_score,
            notes,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle state of a breathing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Welcoming,
    AwaitingMoodInput,
    Analyzing,
    Running,
    Paused,
    Completing,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Welcoming => "welcoming",
            SessionState::AwaitingMoodInput => "awaiting mood input",
            SessionState::Analyzing => "analyzing",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narration voices offered by the speech service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Nova,
    Shimmer,
    Alloy,
    Echo,
    Fable,
    Onyx,
}

impl Voice {
    pub const ALL: [Voice; 6] = [
        Voice::Nova,
        Voice::Shimmer,
        Voice::Alloy,
        Voice::Echo,
        Voice::Fable,
        Voice::Onyx,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Voice::Nova => "nova",
            Voice::Shimmer => "shimmer",
            Voice::Alloy => "alloy",
            Voice::Echo => "echo",
            Voice::Fable => "fable",
            Voice::Onyx => "onyx",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Voice::Nova => "Nova (Female)",
            Voice::Shimmer => "Shimmer (Female)",
            Voice::Alloy => "Alloy (Neutral)",
            Voice::Echo => "Echo (Male)",
            Voice::Fable => "Fable (British Male)",
            Voice::Onyx => "Onyx (Deep Male)",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Voice::Nova => "Warm and engaging female voice",
            Voice::Shimmer => "Gentle and soothing female voice",
            Voice::Alloy => "Balanced and clear voice",
            Voice::Echo => "Clear and confident male voice",
            Voice::Fable => "Sophisticated British male voice",
            Voice::Onyx => "Deep and resonant male voice",
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Voice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Voice::ALL
            .into_iter()
            .find(|v| v.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown voice '{s}'"))
    }
}

/// UI-facing view of a session, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub plan_name: Option<String>,
    pub segment_index: usize,
    pub segment_count: usize,
    pub segment_label: Option<String>,
    pub instruction: String,
    pub guidance_text: String,
    pub animation_scale: f32,
    pub elapsed_secs: u32,
    pub remaining_secs: u32,
    pub total_secs: u32,
    pub music_track: Option<String>,
    pub notice: Option<String>,
}

impl SessionSnapshot {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            plan_name: None,
            segment_index: 0,
            segment_count: 0,
            segment_label: None,
            instruction: String::new(),
            guidance_text: String::new(),
            animation_scale: 1.0,
            elapsed_secs: 0,
            remaining_secs: 0,
            total_secs: 0,
            music_track: None,
            notice: None,
        }
    }

    /// Fraction of the plan completed, 0.0..=1.0.
    pub fn progress(&self) -> f32 {
        if self.total_secs == 0 {
            return 0.0;
        }
        (self.elapsed_secs as f32 / self.total_secs as f32).min(1.0)
    }
}
