//! End-to-end session tests on simulated time.
//!
//! Every test runs with a paused tokio clock, so a nine-minute plan finishes
//! instantly while ticks, narration playback and fades still happen in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use respira_core::config::RespiraConfig;
use respira_core::error::{ServiceError, SessionError};
use respira_core::session::INHALE_SCALE;
use respira_core::types::{MusicSetting, MusicTrack};
use respira_core::{
    AudioChannel, ExercisePlan, InMemoryStore, MockVoiceService, PhaseStep, Script,
    SessionDeps, SessionSequencer, SessionSnapshot, SessionState, SimulatedChannel, StressLevel,
    WelcomeFlow,
};

const USER: &str = "user-1";

struct Harness {
    seq: SessionSequencer,
    service: Arc<MockVoiceService>,
    store: Arc<InMemoryStore>,
    voice: Arc<SimulatedChannel>,
    music: Arc<SimulatedChannel>,
}

fn harness_with(store: InMemoryStore, signed_in: bool) -> Harness {
    let mut config = RespiraConfig::default();
    if signed_in {
        config.service.user_id = Some(USER.to_string());
    }
    let service = Arc::new(MockVoiceService::new());
    let store = Arc::new(store);
    let voice = Arc::new(SimulatedChannel::new("voice"));
    let music = Arc::new(SimulatedChannel::new("music"));
    let deps = SessionDeps::from_service(service.clone(), store.clone(), voice.clone(), music.clone());
    Harness {
        seq: SessionSequencer::new(&config, deps),
        service,
        store,
        voice,
        music,
    }
}

fn harness() -> Harness {
    harness_with(InMemoryStore::new().with_profile(USER, "Ada"), true)
}

fn level(n: i64) -> StressLevel {
    StressLevel::new(n).unwrap()
}

/// Collect every published snapshot until `target` is reached.
async fn collect_until(
    rx: &mut watch::Receiver<SessionSnapshot>,
    target: SessionState,
) -> Vec<SessionSnapshot> {
    let mut seen = vec![rx.borrow_and_update().clone()];
    while seen.last().map(|s| s.state) != Some(target) {
        tokio::time::timeout(Duration::from_secs(7200), rx.changed())
            .await
            .expect("session did not reach target state")
            .expect("sequencer dropped");
        seen.push(rx.borrow_and_update().clone());
    }
    seen
}

/// First elapsed second at which each segment index was shown while running.
fn segment_starts(snapshots: &[SessionSnapshot]) -> Vec<(usize, u32)> {
    let mut starts: Vec<(usize, u32)> = Vec::new();
    for snap in snapshots.iter().filter(|s| s.state == SessionState::Running) {
        if starts.last().map(|(i, _)| *i) != Some(snap.segment_index) {
            starts.push((snap.segment_index, snap.elapsed_secs));
        }
    }
    starts
}

fn phase_plan(steps: Vec<PhaseStep>) -> ExercisePlan {
    ExercisePlan::new(
        Script::Phases(steps),
        "Box Breathing",
        "Let's begin.",
        "All done.",
        level(2),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_level_three_session_boundaries_and_recording() {
    let h = harness();
    let mut rx = h.seq.subscribe();

    h.seq.start_level(level(3)).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    assert_eq!(
        segment_starts(&snapshots),
        vec![(0, 0), (1, 63), (2, 168), (3, 273), (4, 378), (5, 483)]
    );
    let last = snapshots.last().unwrap();
    assert_eq!(last.total_secs, 546);
    assert_eq!(last.elapsed_secs, 546);
    assert_eq!(last.remaining_secs, 0);
    assert_eq!(last.plan_name.as_deref(), Some("Deep Relief"));
    assert_eq!(
        last.guidance_text,
        "Ada, you've done something wonderful for yourself. Carry this peace with you."
    );

    // No music configured: the session runs silently.
    assert!(snapshots.iter().all(|s| s.music_track.is_none()));
    assert!(h.music.history().is_empty());

    assert_eq!(h.seq.wait_for_recording().await, Some(true));
    let entries = h.store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user_id, USER);
    assert_eq!(entries[0].stress_score, level(3));
    assert_eq!(
        entries[0].notes.as_deref(),
        Some("Completed a Deep Relief breathing session.")
    );

    let played = h.voice.history();
    assert_eq!(played.first().map(String::as_str), Some("Ada, guidance for opening_preparation."));
    assert!(played.iter().any(|t| t.starts_with("Ada, you've done something wonderful")));
    assert_eq!(h.service.guidance_calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_stop_rewinds_and_restart_runs_cleanly() {
    let h = harness();
    h.seq.start_level(level(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let snap = h.seq.snapshot();
    assert_eq!(snap.state, SessionState::Running);
    assert_eq!(snap.segment_index, 1);
    let generation = h.seq.generation();

    h.seq.stop().await.unwrap();
    let snap = h.seq.snapshot();
    assert_eq!(snap.state, SessionState::Idle);
    assert_eq!(snap.elapsed_secs, 0);
    assert_eq!(snap.remaining_secs, 144);
    assert_eq!(snap.plan_name.as_deref(), Some("Quick Relief"));
    assert_ne!(h.seq.generation(), generation);
    assert!(!h.voice.is_playing());

    // Nothing keeps ticking after a stop.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.seq.snapshot().elapsed_secs, 0);
    assert!(matches!(
        h.seq.stop().await,
        Err(SessionError::InvalidTransition { .. })
    ));

    let mut rx = h.seq.subscribe();
    h.seq.start_prepared().await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;
    assert_eq!(
        segment_starts(&snapshots),
        vec![(0, 0), (1, 27), (2, 72), (3, 117)]
    );
    assert_eq!(h.seq.wait_for_recording().await, Some(true));
    assert_eq!(h.store.entries().len(), 1);

    let openings = h
        .service
        .guidance_requests()
        .iter()
        .filter(|r| r.stage_key == "opening_preparation")
        .count();
    assert_eq!(openings, 2);
}

#[tokio::test(start_paused = true)]
async fn test_pause_freezes_elapsed_time() {
    let h = harness();
    let mut rx = h.seq.subscribe();
    let started = Instant::now();
    h.seq.start_level(level(1)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    h.seq.pause().await.unwrap();
    let frozen = h.seq.snapshot().elapsed_secs;
    assert!((9..=10).contains(&frozen), "elapsed {frozen}");
    assert!(matches!(
        h.seq.pause().await,
        Err(SessionError::InvalidTransition { .. })
    ));

    tokio::time::sleep(Duration::from_secs(100)).await;
    let snap = h.seq.snapshot();
    assert_eq!(snap.state, SessionState::Paused);
    assert_eq!(snap.elapsed_secs, frozen);

    h.seq.resume().await.unwrap();
    collect_until(&mut rx, SessionState::Completing).await;
    let wall = started.elapsed().as_secs();
    assert!((243..=246).contains(&wall), "finished after {wall}s");
}

#[tokio::test(start_paused = true)]
async fn test_late_guidance_for_a_past_stage_is_dropped() {
    let h = harness();
    h.service
        .set_guidance_delay("grounding_breathwork", Duration::from_secs(60));
    let mut rx = h.seq.subscribe();

    h.seq.start_level(level(1)).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    let late = "Ada, guidance for grounding_breathwork.";
    assert!(snapshots.iter().all(|s| s.guidance_text != late));
    assert!(!h.voice.history().iter().any(|t| t == late));

    let second_stage: Vec<_> = snapshots
        .iter()
        .filter(|s| s.state == SessionState::Running && s.segment_index == 1)
        .collect();
    assert!(!second_stage.is_empty());
    assert!(
        second_stage
            .iter()
            .all(|s| s.guidance_text == "Simple breathing to center yourself")
    );
    assert!(
        snapshots
            .iter()
            .any(|s| s.guidance_text == "Ada, guidance for body_awareness.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_guidance_failure_falls_back_to_static_text() {
    let h = harness();
    h.service.set_guidance_failure(Some(ServiceError::Unavailable {
        status: 503,
        message: "down".into(),
    }));
    let mut rx = h.seq.subscribe();
    h.seq.start_level(level(1)).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    let fallback: Vec<_> = snapshots
        .iter()
        .filter(|s| s.state == SessionState::Running && s.guidance_text.starts_with("Ada, "))
        .collect();
    assert!(!fallback.is_empty());
    assert!(fallback.iter().all(|s| !s.guidance_text.contains("guidance for")));
    assert!(h.voice.history().iter().any(|t| t.starts_with("Ada, ")));
    assert_eq!(h.seq.wait_for_recording().await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_voice_failure_keeps_the_timer_running() {
    let h = harness();
    h.service.set_speech_failure(Some(ServiceError::Connection {
        message: "offline".into(),
    }));
    let mut rx = h.seq.subscribe();
    h.seq.start_level(level(1)).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    assert!(snapshots.iter().any(|s| {
        s.notice.as_deref() == Some("Voice generation failed. Continuing with text guidance.")
    }));
    assert_eq!(snapshots.last().unwrap().elapsed_secs, 144);
    assert!(h.voice.history().is_empty());
    assert_eq!(h.seq.wait_for_recording().await, Some(true));
}

fn broken_step() -> PhaseStep {
    serde_json::from_str(r#"{"phase": "inhale", "duration": "four"}"#).unwrap()
}

async fn assert_ends_without_completion(h: &Harness, plan: ExercisePlan) {
    let mut rx = h.seq.subscribe();
    h.seq.start(plan).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    let last = snapshots.last().unwrap();
    assert_eq!(last.elapsed_secs, 0);
    assert!(last.notice.as_deref().unwrap_or_default().contains("invalid step"));
    assert!(!snapshots.iter().any(|s| s.state == SessionState::Completing));
    assert!(!h.seq.has_recording());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.seq.state(), SessionState::Completed);
    assert!(!h.voice.history().iter().any(|t| t == "All done." || t == "Let's begin."));
    assert!(h.store.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_step_ends_session_without_completion() {
    let h = harness();
    let plan = phase_plan(vec![PhaseStep::inhale(4), broken_step(), PhaseStep::inhale(4)]);
    assert_ends_without_completion(&h, plan).await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_last_step_ends_session_without_completion() {
    let h = harness();
    let plan = phase_plan(vec![PhaseStep::inhale(2), PhaseStep::exhale(2), broken_step()]);
    assert_ends_without_completion(&h, plan).await;
}

#[tokio::test(start_paused = true)]
async fn test_phase_plan_animation_and_repeat() {
    let h = harness();
    let plan = phase_plan(vec![
        PhaseStep::inhale(2),
        PhaseStep::hold(1),
        PhaseStep::exhale(2),
    ]);
    let mut rx = h.seq.subscribe();
    h.seq.start(plan).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    let running: Vec<_> = snapshots
        .iter()
        .filter(|s| s.state == SessionState::Running && !s.instruction.is_empty())
        .collect();
    assert!(running.iter().any(|s| s.instruction == "Inhale" && s.animation_scale == INHALE_SCALE));
    assert!(running.iter().any(|s| s.instruction == "Hold" && s.animation_scale == INHALE_SCALE));
    assert!(running.iter().any(|s| s.instruction == "Exhale" && s.animation_scale == 1.0));

    let played = h.voice.history();
    assert_eq!(played.first().map(String::as_str), Some("Let's begin."));
    assert!(played.iter().any(|t| t == "inhale"));
    assert!(played.iter().any(|t| t == "All done."));
    assert_eq!(h.seq.wait_for_recording().await, Some(true));

    h.seq.repeat().await.unwrap();
    collect_until(&mut rx, SessionState::Completed).await;
    let intros = h.voice.history().iter().filter(|t| *t == "Let's begin.").count();
    assert_eq!(intros, 1);
    assert_eq!(h.seq.wait_for_recording().await, Some(true));
    assert_eq!(h.store.entries().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mood_flow_retries_after_generation_failure() {
    let h = harness();
    h.seq.welcome(WelcomeFlow::Mood).await.unwrap();
    assert_eq!(h.seq.state(), SessionState::AwaitingMoodInput);
    assert!(h.voice.history()[0].starts_with("Welcome, Ada. How are you feeling today?"));

    assert_eq!(h.seq.submit_mood("   ").await, Err(SessionError::EmptyMood));
    assert_eq!(h.seq.state(), SessionState::AwaitingMoodInput);
    assert_eq!(h.service.custom_calls(), 0);

    h.service.set_custom_response(Err(ServiceError::Unavailable {
        status: 500,
        message: "model overloaded".into(),
    }));
    h.seq.submit_mood("I feel drained").await.unwrap();
    let snap = h.seq.snapshot();
    assert_eq!(snap.state, SessionState::AwaitingMoodInput);
    assert!(snap.notice.is_some());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.voice.history().iter().any(|t| t.starts_with("I'm sorry, Ada.")));

    h.service
        .set_custom_response(Ok(MockVoiceService::sample_exercise()));
    let mut rx = h.seq.subscribe();
    h.seq.submit_mood("I feel drained").await.unwrap();
    assert_eq!(h.seq.state(), SessionState::Running);
    assert_eq!(h.seq.snapshot().notice, None);
    collect_until(&mut rx, SessionState::Completed).await;

    assert!(
        h.voice
            .history()
            .iter()
            .any(|t| t.contains("This rhythmic breathing will help awaken your senses."))
    );
    assert_eq!(h.seq.wait_for_recording().await, Some(true));
    let entries = h.store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].notes.as_deref(),
        Some("Completed a Energizing Breath session for feeling tired.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_refused_credentials_end_the_mood_flow() {
    let h = harness();
    h.seq.welcome(WelcomeFlow::Mood).await.unwrap();
    h.service.set_custom_response(Err(ServiceError::AuthFailed {
        message: "Invalid JWT".into(),
    }));

    assert_eq!(
        h.seq.submit_mood("I feel drained").await,
        Err(SessionError::Unauthenticated)
    );
    let snap = h.seq.snapshot();
    assert_eq!(snap.state, SessionState::Idle);
    let notice = snap.notice.unwrap_or_default();
    assert!(notice.contains("sign in again"), "{notice}");
    assert!(!notice.contains("describe how you're feeling"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!h.voice.history().iter().any(|t| t.starts_with("I'm sorry")));
    assert!(matches!(
        h.seq.submit_mood("I feel drained").await,
        Err(SessionError::InvalidTransition { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_refused_credentials_while_running_keep_the_timer() {
    let h = harness();
    let refused = ServiceError::AuthFailed {
        message: "Unauthorized".into(),
    };
    h.service.set_guidance_failure(Some(refused.clone()));
    h.service.set_speech_failure(Some(refused));
    let mut rx = h.seq.subscribe();
    h.seq.start_level(level(1)).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    let running: Vec<_> = snapshots
        .iter()
        .filter(|s| s.state == SessionState::Running)
        .collect();
    assert!(running.iter().any(|s| {
        s.notice
            .as_deref()
            .is_some_and(|n| n.contains("sign in again"))
    }));
    assert!(!running.iter().any(|s| {
        s.notice.as_deref() == Some("Voice generation failed. Continuing with text guidance.")
    }));
    assert_eq!(snapshots.last().unwrap().elapsed_secs, 144);
    assert_eq!(h.seq.wait_for_recording().await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_third_stage_guidance_then_restart() {
    let h = harness();
    h.service
        .set_guidance_delay("body_awareness", Duration::from_secs(60));
    h.seq.start_level(level(1)).await.unwrap();

    // Third stage starts at 72 s; its guidance is still in flight at 80 s.
    tokio::time::sleep(Duration::from_secs(80)).await;
    assert_eq!(h.seq.snapshot().segment_index, 2);
    h.seq.stop().await.unwrap();

    h.service.set_guidance_delay("body_awareness", Duration::ZERO);
    let mut rx = h.seq.subscribe();
    h.seq.start_level(level(1)).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    assert_eq!(
        segment_starts(&snapshots),
        vec![(0, 0), (1, 27), (2, 72), (3, 117)]
    );
    let third = "Ada, guidance for body_awareness.";
    assert!(
        snapshots
            .iter()
            .filter(|s| s.guidance_text == third)
            .all(|s| s.state == SessionState::Running && s.segment_index == 2)
    );
    assert_eq!(h.voice.history().iter().filter(|t| *t == third).count(), 1);
    assert_eq!(h.seq.wait_for_recording().await, Some(true));
    assert_eq!(h.store.entries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_level_welcome_prepares_plan() {
    let h = harness();
    h.seq.welcome(WelcomeFlow::Level(level(2))).await.unwrap();

    assert_eq!(h.seq.state(), SessionState::Idle);
    let plan = h.seq.plan().unwrap();
    assert_eq!(plan.segment_count(), 5);
    assert_eq!(
        h.voice.history(),
        vec!["Welcome, Ada. Your Moderate Relief session is ready whenever you are.".to_string()]
    );

    h.seq.start_prepared().await.unwrap();
    assert_eq!(h.seq.state(), SessionState::Running);
    h.seq.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_user_is_greeted_generically_and_not_recorded() {
    let h = harness_with(InMemoryStore::new(), false);
    h.seq.welcome(WelcomeFlow::Mood).await.unwrap();
    assert!(h.voice.history()[0].starts_with("Welcome, there."));

    let mut rx = h.seq.subscribe();
    h.seq.submit_mood("a bit anxious").await.unwrap();
    collect_until(&mut rx, SessionState::Completed).await;
    assert_eq!(h.seq.wait_for_recording().await, None);
    assert_eq!(h.store.insert_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stage_music_follows_settings() {
    let setting = |stage: &str, track: Option<&str>| MusicSetting {
        stage_key: stage.to_string(),
        stress_level: 1,
        music_track_id: track.map(str::to_string),
        volume: Some(0.3),
        fade_in_secs: Some(1.0),
        fade_out_secs: Some(1.0),
    };
    let track = |id: &str, name: &str| MusicTrack {
        id: id.to_string(),
        name: name.to_string(),
        file_url: format!("https://cdn.example.com/{id}.mp3"),
        duration_secs: 120.0,
        is_active: true,
    };
    let store = InMemoryStore::new()
        .with_profile(USER, "Ada")
        .with_music_setting(setting("opening_preparation", Some("t1")))
        .with_music_setting(setting("grounding_breathwork", Some("t1")))
        .with_music_setting(setting("body_awareness", Some("t2")))
        .with_track(track("t1", "Forest"))
        .with_track(track("t2", "Rain"));
    let h = harness_with(store, true);

    let mut rx = h.seq.subscribe();
    h.seq.start_level(level(1)).await.unwrap();
    let snapshots = collect_until(&mut rx, SessionState::Completed).await;

    let forest = snapshots
        .iter()
        .any(|s| s.segment_index == 1 && s.music_track.as_deref() == Some("Forest"));
    let rain = snapshots
        .iter()
        .any(|s| s.segment_index == 2 && s.music_track.as_deref() == Some("Rain"));
    assert!(forest && rain);
    assert_eq!(h.music.history(), vec!["Forest".to_string(), "Rain".to_string()]);
    assert_eq!(snapshots.last().unwrap().music_track, None);
    assert!(!h.music.is_playing());
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_a_music_transition() {
    let setting = |stage: &str, track: &str| MusicSetting {
        stage_key: stage.to_string(),
        stress_level: 1,
        music_track_id: Some(track.to_string()),
        volume: Some(0.3),
        fade_in_secs: Some(3.0),
        fade_out_secs: Some(3.0),
    };
    let track = |id: &str| MusicTrack {
        id: id.to_string(),
        name: id.to_string(),
        file_url: format!("https://cdn.example.com/{id}.mp3"),
        duration_secs: 120.0,
        is_active: true,
    };
    let store = InMemoryStore::new()
        .with_profile(USER, "Ada")
        .with_music_setting(setting("opening_preparation", "t1"))
        .with_music_setting(setting("grounding_breathwork", "t2"))
        .with_track(track("t1"))
        .with_track(track("t2"));
    let h = harness_with(store, true);

    h.seq.start_level(level(1)).await.unwrap();
    // Just past the first boundary, while t1 is still fading out.
    tokio::time::sleep(Duration::from_millis(27_500)).await;
    h.seq.pause().await.unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.seq.state(), SessionState::Paused);
    assert!(!h.music.is_playing());
    assert_eq!(h.music.history(), vec!["t1".to_string()]);

    h.seq.resume().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.music.is_playing());
    assert_eq!(h.music.history(), vec!["t1".to_string(), "t2".to_string()]);
    assert_eq!(h.seq.snapshot().music_track.as_deref(), Some("t2"));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_releases_and_rejects_commands() {
    let h = harness();
    h.seq.start_level(level(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(40)).await;

    h.seq.teardown().await;
    assert_eq!(h.seq.state(), SessionState::Idle);
    assert!(!h.voice.is_playing());
    assert!(h.voice.released_count() > 0);
    assert_eq!(h.seq.start_prepared().await, Err(SessionError::TornDown));
    assert_eq!(h.seq.welcome(WelcomeFlow::Mood).await, Err(SessionError::TornDown));

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(h.seq.snapshot().elapsed_secs, 0);
    assert!(h.store.entries().is_empty());
}
