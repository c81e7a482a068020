//! Property-based tests for plan generation and the session clock.

use proptest::prelude::*;

use respira_core::plan::custom::validate;
use respira_core::plan::{FixedPlanGenerator, MoodPreset, MoodPresetGenerator};
use respira_core::session::{Advance, SessionClock};
use respira_core::{MockVoiceService, PhaseStep, StressLevel};

// --- Fixed plans ---

proptest! {
    #[test]
    fn fixed_plan_shape(level in 1i64..=5) {
        let level = StressLevel::new(level).unwrap();
        let plan = FixedPlanGenerator.plan(level, None);
        let durations = plan.script().durations();

        prop_assert_eq!(plan.segment_count(), level.get() as usize + 3);
        prop_assert_eq!(durations.iter().sum::<u32>(), plan.total_duration_secs());
        prop_assert_eq!(durations.first(), durations.last());
        prop_assert!(durations[0] < durations[1]);
        prop_assert!(plan.intro_narration.is_empty());
    }

    #[test]
    fn fixed_plans_grow_with_level(a in 1i64..=5, b in 1i64..=5) {
        let (low, high) = (a.min(b), a.max(b));
        let strictly = low < high;
        let low = FixedPlanGenerator.plan(StressLevel::new(low).unwrap(), None);
        let high = FixedPlanGenerator.plan(StressLevel::new(high).unwrap(), None);
        prop_assert!(low.segment_count() <= high.segment_count());
        if strictly {
            prop_assert!(low.total_duration_secs() < high.total_duration_secs());
        } else {
            prop_assert_eq!(low.total_duration_secs(), high.total_duration_secs());
        }
    }

    #[test]
    fn out_of_range_levels_are_rejected(level in prop_oneof![i64::MIN..1i64, 6i64..i64::MAX]) {
        prop_assert!(StressLevel::new(level).is_err());
    }
}

// --- Generated and preset plans ---

proptest! {
    #[test]
    fn custom_pattern_length_is_bounded(steps in 0usize..12) {
        let mut exercise = MockVoiceService::sample_exercise();
        exercise.pattern = (0..steps)
            .map(|i| if i % 2 == 0 { PhaseStep::inhale(4) } else { PhaseStep::exhale(4) })
            .collect();
        prop_assert_eq!(validate(exercise).is_ok(), (4..=8).contains(&steps));
    }

    #[test]
    fn preset_plans_repeat_their_cycle(cycles in 1u32..10, index in 0usize..7) {
        let preset = MoodPreset::ALL[index];
        let plan = MoodPresetGenerator::new(cycles).plan(preset, "Ada");
        let cycle: u32 = preset.pattern().iter().map(|s| s.duration_secs).sum();
        prop_assert_eq!(plan.segment_count(), preset.pattern().len() * cycles as usize);
        prop_assert_eq!(plan.total_duration_secs(), cycle * cycles);
    }
}

// --- Session clock ---

proptest! {
    #[test]
    fn clock_visits_every_segment_once(durations in prop::collection::vec(1u32..20, 1..10)) {
        let mut clock = SessionClock::new(&durations);
        clock.start().unwrap();
        let mut ticks = 0u32;
        let mut entered = vec![0usize];
        loop {
            ticks += 1;
            match clock.tick() {
                Advance::Completed => break,
                Advance::SegmentAdvanced { index } => entered.push(index),
                Advance::NoChange => {}
            }
        }
        prop_assert_eq!(ticks, durations.iter().sum::<u32>());
        prop_assert_eq!(entered, (0..durations.len()).collect::<Vec<_>>());
    }

    #[test]
    fn paused_ticks_do_not_count(durations in prop::collection::vec(2u32..20, 1..6), idle in 0u32..50) {
        let mut clock = SessionClock::new(&durations);
        clock.start().unwrap();
        clock.tick();
        clock.pause().unwrap();
        for _ in 0..idle {
            prop_assert_eq!(clock.tick(), Advance::NoChange);
        }
        prop_assert_eq!(clock.elapsed(), 1);
    }
}
