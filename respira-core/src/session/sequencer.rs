//! The session sequencer.
//!
//! Owns one session's state machine and drives it on tokio:
//! - a tick task on a fixed interval advances the `SessionClock`
//! - each new segment spawns its narration (and, for stages, guidance + music)
//! - UI state is published as `SessionSnapshot`s on a `watch` channel
//!
//! Every run gets a fresh generation number and `CancellationToken`. Async
//! continuations capture `(generation, segment index)` and re-check both under
//! the state lock before touching anything, so results that arrive after a
//! stop, skip or restart are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{Advance, SessionClock};
use crate::audio::AudioChannel;
use crate::config::RespiraConfig;
use crate::error::{NarrationError, PlanError, PlaybackError, SessionError};
use crate::guidance::{GuidanceSource, stage_guidance};
use crate::music::MusicDriver;
use crate::narration::NarrationDriver;
use crate::plan::{LevelProfile, PlanGenerator, PlanRequest, Planner};
use crate::recorder::{CompletionRecorder, session_notes};
use crate::service::{GuidanceRequest, GuidanceService, SpeechSynthesizer};
use crate::store::DataStore;
use crate::types::{
    ExercisePlan, PhaseKind, Script, SessionSnapshot, SessionState, StressLevel,
};

pub const INHALE_SCALE: f32 = 1.4;
pub const REST_SCALE: f32 = 1.0;

const NOTICE_VOICE_FAILED: &str = "Voice generation failed. Continuing with text guidance.";
const NOTICE_RETRY: &str =
    "We couldn't create an exercise from that description. Please describe how you're feeling again.";
const NOTICE_MALFORMED: &str = "This exercise contained an invalid step and was ended early.";
const NOTICE_SIGN_IN: &str = "Your sign-in has expired. Please sign in again to continue.";
const NOTICE_SIGN_IN_RUNNING: &str =
    "Your sign-in has expired. Continuing with text guidance until you sign in again.";
const STARTING_TEXT: &str = "Starting your personalized session...";

/// Collaborators a sequencer needs.
pub struct SessionDeps {
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub guidance: Arc<dyn GuidanceService>,
    pub store: Arc<dyn DataStore>,
    pub voice_channel: Arc<dyn AudioChannel>,
    pub music_channel: Arc<dyn AudioChannel>,
}

impl SessionDeps {
    /// Wire a backend that provides both speech and text generation.
    pub fn from_service<S>(
        service: Arc<S>,
        store: Arc<dyn DataStore>,
        voice_channel: Arc<dyn AudioChannel>,
        music_channel: Arc<dyn AudioChannel>,
    ) -> Self
    where
        S: SpeechSynthesizer + GuidanceService + 'static,
    {
        Self {
            synthesizer: service.clone(),
            guidance: service,
            store,
            voice_channel,
            music_channel,
        }
    }
}

/// Which variant a welcome leads into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelcomeFlow {
    /// Ask for a mood description, then generate a custom plan.
    Mood,
    /// Prepare the fixed plan for a stress level and wait for `start_prepared`.
    Level(StressLevel),
}

#[derive(Default)]
struct Shared {
    state: SessionState,
    display_name: Option<String>,
    plan: Option<Arc<ExercisePlan>>,
    clock: SessionClock,
    stepping_pending: bool,
    instruction: String,
    guidance_text: String,
    animation_scale: f32,
    notice: Option<String>,
    run_token: CancellationToken,
    tick_task: Option<JoinHandle<()>>,
    narration_task: Option<JoinHandle<()>>,
    background_task: Option<JoinHandle<()>>,
    recording: Option<JoinHandle<bool>>,
    torn_down: bool,
}

impl Shared {
    fn cancel_tasks(&mut self) {
        self.run_token.cancel();
        for handle in [
            self.tick_task.take(),
            self.narration_task.take(),
            self.background_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    fn clear_display(&mut self) {
        self.instruction.clear();
        self.guidance_text.clear();
        self.animation_scale = REST_SCALE;
        self.notice = None;
    }

    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.torn_down {
            Err(SessionError::TornDown)
        } else {
            Ok(())
        }
    }

    fn invalid(&self, action: &str) -> SessionError {
        SessionError::InvalidTransition {
            from: self.state.to_string(),
            action: action.to_string(),
        }
    }
}

struct Inner {
    session_id: Uuid,
    user_id: Option<String>,
    fallback_name: String,
    tick: Duration,
    narration: NarrationDriver,
    music: Arc<MusicDriver>,
    planner: Arc<dyn PlanGenerator>,
    guidance: Arc<dyn GuidanceService>,
    store: Arc<dyn DataStore>,
    recorder: CompletionRecorder,
    generation: AtomicU64,
    shared: Mutex<Shared>,
    snapshots: watch::Sender<SessionSnapshot>,
}

/// Drives one breathing session. Cheap to share behind an `Arc`.
pub struct SessionSequencer {
    inner: Arc<Inner>,
}

impl SessionSequencer {
    pub fn new(config: &RespiraConfig, deps: SessionDeps) -> Self {
        let session_id = Uuid::new_v4();
        let (snapshots, _) = watch::channel(SessionSnapshot::new(session_id));
        let planner: Arc<dyn PlanGenerator> = Arc::new(Planner::new(
            deps.guidance.clone(),
            config.session.preset_cycles,
        ));
        let inner = Inner {
            session_id,
            user_id: config.service.user_id.clone(),
            fallback_name: config.session.fallback_name.clone(),
            tick: config.session.tick(),
            narration: NarrationDriver::new(deps.synthesizer, deps.voice_channel, &config.voice),
            music: Arc::new(MusicDriver::new(
                deps.store.clone(),
                deps.music_channel,
                config.music.clone(),
            )),
            planner,
            guidance: deps.guidance,
            store: deps.store.clone(),
            recorder: CompletionRecorder::new(deps.store),
            generation: AtomicU64::new(0),
            shared: Mutex::new(Shared {
                animation_scale: REST_SCALE,
                ..Shared::default()
            }),
            snapshots,
        };
        info!(session_id = %session_id, "Session created");
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Receive a snapshot on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// The plan of the current (or last) run.
    pub fn plan(&self) -> Option<Arc<ExercisePlan>> {
        self.inner.lock().plan.clone()
    }

    /// Generation of the current run. Changes on every start, stop and teardown.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Greet the user, then either wait for a mood description or prepare the
    /// fixed plan for a level.
    pub async fn welcome(&self, flow: WelcomeFlow) -> Result<(), SessionError> {
        let inner = &self.inner;
        let generation = {
            let mut s = inner.lock();
            s.ensure_alive()?;
            if !matches!(s.state, SessionState::Idle | SessionState::Completed) {
                return Err(s.invalid("welcome"));
            }
            let generation = inner.bump_generation();
            s.cancel_tasks();
            s.clear_display();
            s.state = SessionState::Welcoming;
            inner.publish(&s);
            generation
        };
        info!(?flow, "Welcoming user");

        let name = inner.display_name().await;
        let addressed = name.clone().unwrap_or_else(|| inner.fallback_name.clone());
        let (line, prepared) = match flow {
            WelcomeFlow::Mood => (
                format!(
                    "Welcome, {addressed}. How are you feeling today? Please describe your mood or how you're feeling in your own words."
                ),
                None,
            ),
            WelcomeFlow::Level(level) => {
                let generated = inner
                    .planner
                    .generate(&PlanRequest::Level {
                        level,
                        display_name: name.clone(),
                    })
                    .await;
                let plan = match generated {
                    Ok(plan) => plan,
                    Err(e) => {
                        warn!(error = %e, "Fixed plan generation failed");
                        let mut s = inner.lock();
                        if inner.is_current(generation) {
                            s.state = SessionState::Idle;
                            inner.publish(&s);
                        }
                        return Err(SessionError::NoPlan);
                    }
                };
                (
                    format!(
                        "Welcome, {addressed}. Your {} session is ready whenever you are.",
                        LevelProfile::for_level(level).label
                    ),
                    Some(plan),
                )
            }
        };
        if !inner.is_current(generation) {
            return Ok(());
        }
        inner.lock().guidance_text = line.clone();
        inner.publish_now();

        inner.narration.speak_or_log(&line).await;

        let mut s = inner.lock();
        if !inner.is_current(generation) || s.state != SessionState::Welcoming {
            return Ok(());
        }
        match prepared {
            None => s.state = SessionState::AwaitingMoodInput,
            Some(plan) => {
                s.clock = SessionClock::new(&plan.script().durations());
                s.plan = Some(Arc::new(plan));
                s.state = SessionState::Idle;
            }
        }
        inner.publish(&s);
        Ok(())
    }

    /// Submit the user's mood description and generate a custom plan.
    ///
    /// On success the session starts running with the plan's introduction. On
    /// failure it returns to `AwaitingMoodInput` with a notice and an apology.
    /// Refused credentials end the flow instead: the session goes back to
    /// `Idle` with a sign-in notice and `SessionError::Unauthenticated`.
    pub async fn submit_mood(&self, text: &str) -> Result<(), SessionError> {
        let inner = &self.inner;
        let text = text.trim();
        let generation = {
            let mut s = inner.lock();
            s.ensure_alive()?;
            if s.state != SessionState::AwaitingMoodInput {
                return Err(s.invalid("submit a mood"));
            }
            if text.is_empty() {
                return Err(SessionError::EmptyMood);
            }
            if let Some(handle) = s.background_task.take() {
                handle.abort();
            }
            s.state = SessionState::Analyzing;
            s.notice = None;
            s.guidance_text = "Creating your personalized exercise...".to_string();
            inner.publish(&s);
            inner.generation.load(Ordering::SeqCst)
        };

        let name = inner.addressed_name().await;
        let result = inner
            .planner
            .generate(&PlanRequest::mood(text, name.clone()))
            .await;

        let mut s = inner.lock();
        if !inner.is_current(generation) || s.state != SessionState::Analyzing {
            debug!("Discarding stale plan result");
            return Ok(());
        }
        match result {
            Ok(plan) => {
                info!(exercise = %plan.display_name, "Custom plan ready");
                inner.begin_run(&mut s, Arc::new(plan), true);
            }
            Err(PlanError::Unauthenticated { message }) => {
                warn!(error = %message, "Custom plan refused, sign-in required");
                s.state = SessionState::Idle;
                s.guidance_text.clear();
                s.notice = Some(NOTICE_SIGN_IN.to_string());
                inner.publish(&s);
                return Err(SessionError::Unauthenticated);
            }
            Err(e) => {
                warn!(error = %e, "Custom plan generation failed, asking again");
                s.state = SessionState::AwaitingMoodInput;
                s.notice = Some(NOTICE_RETRY.to_string());
                let apology = format!(
                    "I'm sorry, {name}. I wasn't able to prepare an exercise just now. Could you describe how you're feeling once more?"
                );
                s.guidance_text = apology.clone();
                let task_inner = Arc::clone(inner);
                s.background_task = Some(tokio::spawn(async move {
                    task_inner.narration.speak_or_log(&apology).await;
                }));
                inner.publish(&s);
            }
        }
        Ok(())
    }

    /// Run `plan` from the beginning.
    pub async fn start(&self, plan: ExercisePlan) -> Result<(), SessionError> {
        if plan.segment_count() == 0 {
            return Err(SessionError::NoPlan);
        }
        let mut s = self.inner.lock();
        s.ensure_alive()?;
        if !matches!(
            s.state,
            SessionState::Idle | SessionState::Completed | SessionState::AwaitingMoodInput
        ) {
            return Err(s.invalid("start"));
        }
        self.inner.begin_run(&mut s, Arc::new(plan), true);
        Ok(())
    }

    /// Generate the fixed plan for `level` and run it.
    pub async fn start_level(&self, level: StressLevel) -> Result<(), SessionError> {
        {
            let s = self.inner.lock();
            s.ensure_alive()?;
            if !matches!(s.state, SessionState::Idle | SessionState::Completed) {
                return Err(s.invalid("start"));
            }
        }
        let name = self.inner.display_name().await;
        let plan = self
            .inner
            .planner
            .generate(&PlanRequest::Level {
                level,
                display_name: name,
            })
            .await
            .map_err(|_| SessionError::NoPlan)?;
        self.start(plan).await
    }

    /// Run the plan kept from `welcome` or a previous run.
    pub async fn start_prepared(&self) -> Result<(), SessionError> {
        let mut s = self.inner.lock();
        s.ensure_alive()?;
        if !matches!(s.state, SessionState::Idle | SessionState::Completed) {
            return Err(s.invalid("start"));
        }
        let plan = s.plan.clone().ok_or(SessionError::NoPlan)?;
        self.inner.begin_run(&mut s, plan, true);
        Ok(())
    }

    /// Run the completed plan again from the first segment.
    pub async fn repeat(&self) -> Result<(), SessionError> {
        let mut s = self.inner.lock();
        s.ensure_alive()?;
        if s.state != SessionState::Completed {
            return Err(s.invalid("repeat"));
        }
        let plan = s.plan.clone().ok_or(SessionError::NoPlan)?;
        self.inner.begin_run(&mut s, plan, false);
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        {
            let mut s = self.inner.lock();
            s.ensure_alive()?;
            if s.state != SessionState::Running {
                return Err(s.invalid("pause"));
            }
            s.state = SessionState::Paused;
            if let Some(handle) = s.tick_task.take() {
                handle.abort();
            }
            if s.clock.is_running()
                && let Err(e) = s.clock.pause()
            {
                debug!(error = %e, "Clock not paused");
            }
            self.inner.publish(&s);
        }
        info!(elapsed = self.snapshot().elapsed_secs, "Session paused");
        self.inner.narration.pause().await;
        self.inner.music.pause().await;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        {
            let mut s = self.inner.lock();
            s.ensure_alive()?;
            if s.state != SessionState::Paused {
                return Err(s.invalid("resume"));
            }
            let generation = self.inner.generation.load(Ordering::SeqCst);
            s.state = SessionState::Running;
            if s.stepping_pending {
                s.stepping_pending = false;
                self.inner.begin_stepping(&mut s, generation);
            } else if s.clock.is_running() {
                if let Err(e) = s.clock.resume() {
                    debug!(error = %e, "Clock not resumed");
                }
                self.inner.spawn_tick(&mut s, generation);
            }
            self.inner.publish(&s);
        }
        info!("Session resumed");
        self.inner.narration.resume().await;
        self.inner.music.resume().await;
        Ok(())
    }

    /// Cancel the run and rewind to zero, keeping the plan for a retake.
    pub async fn stop(&self) -> Result<(), SessionError> {
        {
            let mut s = self.inner.lock();
            s.ensure_alive()?;
            if s.state == SessionState::Idle {
                return Err(s.invalid("stop"));
            }
            self.inner.bump_generation();
            s.cancel_tasks();
            s.clock.reset();
            s.stepping_pending = false;
            s.clear_display();
            s.state = SessionState::Idle;
            self.inner.publish(&s);
        }
        info!("Session stopped");
        self.inner.narration.stop().await;
        self.inner.music.stop().await;
        self.inner.publish_now();
        Ok(())
    }

    /// Cancel everything and release audio. The sequencer rejects further
    /// commands afterwards.
    pub async fn teardown(&self) {
        {
            let mut s = self.inner.lock();
            if s.torn_down {
                return;
            }
            s.torn_down = true;
            self.inner.bump_generation();
            s.cancel_tasks();
            s.clock.reset();
            s.clear_display();
            s.state = SessionState::Idle;
            self.inner.publish(&s);
        }
        self.inner.narration.stop().await;
        let released = self.inner.narration.clear_cache();
        self.inner.narration.channel().unload().await;
        self.inner.music.stop().await;
        info!(released, "Session torn down");
    }

    /// Wait for the stress entry of the last completed run to be written.
    /// Returns `None` when nothing was recorded.
    pub async fn wait_for_recording(&self) -> Option<bool> {
        let handle = self.inner.lock().recording.take()?;
        handle.await.ok()
    }

    /// Whether the stress entry of the last completed run was scheduled.
    pub fn has_recording(&self) -> bool {
        self.inner.lock().recording.is_some()
    }
}

impl Drop for SessionSequencer {
    fn drop(&mut self) {
        let mut s = self.inner.lock();
        s.torn_down = true;
        s.cancel_tasks();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn segment_is_current(&self, s: &Shared, generation: u64, index: usize) -> bool {
        self.is_current(generation)
            && s.clock.index() == index
            && matches!(s.state, SessionState::Running | SessionState::Paused)
    }

    fn snapshot_of(&self, s: &Shared) -> SessionSnapshot {
        let mut snap = SessionSnapshot::new(self.session_id);
        snap.state = s.state;
        snap.segment_index = s.clock.index();
        snap.elapsed_secs = s.clock.elapsed();
        snap.remaining_secs = s.clock.remaining();
        snap.total_secs = s.clock.total();
        if let Some(plan) = &s.plan {
            snap.plan_name = Some(plan.display_name.clone());
            snap.segment_count = plan.segment_count();
            if s.clock.is_running() {
                snap.segment_label = plan.segment_label(s.clock.index());
            }
        }
        snap.instruction = s.instruction.clone();
        snap.guidance_text = s.guidance_text.clone();
        snap.animation_scale = s.animation_scale;
        snap.notice = s.notice.clone();
        snap.music_track = self.music.current_track();
        snap
    }

    fn publish(&self, s: &Shared) {
        self.snapshots.send_replace(self.snapshot_of(s));
    }

    fn publish_now(&self) {
        let s = self.lock();
        self.publish(&s);
    }

    /// Profile name of the configured user, looked up once per session.
    async fn display_name(&self) -> Option<String> {
        if let Some(name) = self.lock().display_name.clone() {
            return Some(name);
        }
        let user_id = self.user_id.as_deref()?;
        let name = match self.store.display_name(user_id).await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Profile lookup failed");
                None
            }
        };
        if let Some(name) = &name {
            self.lock().display_name = Some(name.clone());
        }
        name
    }

    async fn addressed_name(&self) -> String {
        self.display_name()
            .await
            .unwrap_or_else(|| self.fallback_name.clone())
    }

    /// Enter `Running` with a fresh generation. Called with the lock held.
    fn begin_run(self: &Arc<Self>, s: &mut Shared, plan: Arc<ExercisePlan>, with_intro: bool) {
        let generation = self.bump_generation();
        s.cancel_tasks();
        s.run_token = CancellationToken::new();
        s.clock = SessionClock::new(&plan.script().durations());
        s.stepping_pending = false;
        s.clear_display();
        s.state = SessionState::Running;
        self.music.set_level(plan.stress_score);

        let intro = plan.intro_narration.trim();
        let intro = (with_intro && !intro.is_empty()).then(|| intro.to_string());
        s.guidance_text = intro.clone().unwrap_or_else(|| STARTING_TEXT.to_string());
        s.plan = Some(Arc::clone(&plan));
        if let Some(index) = plan.first_malformed() {
            self.abort_malformed(s, index);
            return;
        }
        info!(
            generation,
            plan = %plan.display_name,
            segments = plan.segment_count(),
            total_secs = plan.total_duration_secs(),
            "Session running"
        );

        let inner = Arc::clone(self);
        let token = s.run_token.clone();
        s.background_task = Some(tokio::spawn(async move {
            inner.run_intro(generation, token, intro).await;
        }));
        self.publish(s);
    }

    async fn run_intro(self: Arc<Self>, generation: u64, token: CancellationToken, intro: Option<String>) {
        if let Some(intro) = intro {
            let spoken = tokio::select! {
                _ = token.cancelled() => return,
                spoken = self.narration.speak(&intro) => spoken,
            };
            if let Err(e) = spoken
                && !matches!(e, NarrationError::Playback(PlaybackError::Interrupted))
            {
                warn!(error = %e, "Introduction narration failed");
            }
        }
        let mut s = self.lock();
        if !self.is_current(generation) {
            return;
        }
        match s.state {
            SessionState::Running => self.begin_stepping(&mut s, generation),
            SessionState::Paused => s.stepping_pending = true,
            _ => {}
        }
    }

    /// Start the clock and enter the first segment. Called with the lock held.
    fn begin_stepping(self: &Arc<Self>, s: &mut Shared, generation: u64) {
        if let Err(e) = s.clock.start() {
            warn!(error = %e, "Cannot start session clock");
            return;
        }
        if let Some(plan) = s.plan.clone()
            && !plan.is_stage_based()
            && let Some(category) = &plan.music_category
        {
            self.music.start_for_stage(category);
        }
        self.spawn_tick(s, generation);
        self.enter_segment(s, generation, 0);
    }

    fn spawn_tick(self: &Arc<Self>, s: &mut Shared, generation: u64) {
        if let Some(handle) = s.tick_task.take() {
            handle.abort();
        }
        let inner = Arc::clone(self);
        let token = s.run_token.clone();
        let period = self.tick;
        s.tick_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !inner.on_tick(generation) {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Returns whether the tick loop should keep running.
    fn on_tick(self: &Arc<Self>, generation: u64) -> bool {
        let mut s = self.lock();
        if !self.is_current(generation) || s.state != SessionState::Running {
            return false;
        }
        match s.clock.tick() {
            Advance::NoChange => {
                self.publish(&s);
                true
            }
            Advance::SegmentAdvanced { index } => {
                self.enter_segment(&mut s, generation, index);
                self.is_current(generation)
            }
            Advance::Completed => {
                self.begin_completion(&mut s, generation);
                false
            }
        }
    }

    /// Apply segment `index`: display, animation, narration and music.
    fn enter_segment(self: &Arc<Self>, s: &mut Shared, generation: u64, index: usize) {
        let Some(plan) = s.plan.clone() else {
            return;
        };
        if let Some(handle) = s.narration_task.take() {
            handle.abort();
        }
        let inner = Arc::clone(self);
        match plan.script() {
            Script::Phases(steps) => {
                let Some(step) = steps.get(index).copied().filter(|st| st.is_well_formed()) else {
                    self.abort_malformed(s, index);
                    return;
                };
                s.instruction = step.kind.label().to_string();
                match step.kind {
                    PhaseKind::Inhale => s.animation_scale = INHALE_SCALE,
                    PhaseKind::Exhale => s.animation_scale = REST_SCALE,
                    _ => {}
                }
                debug!(segment = index, phase = step.kind.as_str(), secs = step.duration_secs, "Phase");
                s.narration_task = Some(tokio::spawn(async move {
                    inner
                        .narrate_segment(generation, index, step.kind.as_str())
                        .await;
                }));
            }
            Script::Stages(stages) => {
                let Some(stage) = stages.get(index).filter(|st| st.duration_secs > 0).cloned() else {
                    self.abort_malformed(s, index);
                    return;
                };
                s.instruction = stage.label.clone();
                s.guidance_text = stage.description.clone();
                s.animation_scale = REST_SCALE;
                info!(segment = index, stage = %stage.key, secs = stage.duration_secs, "Stage");
                self.music.start_for_stage(&stage.key);
                let level = plan.stress_score;
                s.narration_task = Some(tokio::spawn(async move {
                    inner.guide_stage(generation, index, level, stage.key).await;
                }));
            }
        }
        self.publish(s);
    }

    async fn guide_stage(
        self: Arc<Self>,
        generation: u64,
        index: usize,
        level: StressLevel,
        stage_key: String,
    ) {
        let name = self.display_name().await;
        let request = GuidanceRequest {
            stress_level: level,
            stage_key,
            user_name: name.clone().unwrap_or_else(|| self.fallback_name.clone()),
            current_step: index + 1,
        };
        let guidance = stage_guidance(self.guidance.as_ref(), &request, name.as_deref()).await;
        {
            let mut s = self.lock();
            if !self.segment_is_current(&s, generation, index) {
                debug!(segment = index, "Discarding stale guidance");
                return;
            }
            match guidance.source {
                GuidanceSource::Generated => {}
                GuidanceSource::Fallback => debug!(segment = index, "Using fallback guidance"),
                GuidanceSource::SignInRequired => {
                    s.notice = Some(NOTICE_SIGN_IN_RUNNING.to_string());
                }
            }
            s.guidance_text = guidance.text.clone();
            self.publish(&s);
        }
        self.narrate_segment(generation, index, &guidance.text).await;
    }

    async fn narrate_segment(&self, generation: u64, index: usize, text: &str) {
        {
            let s = self.lock();
            if !self.segment_is_current(&s, generation, index) || s.state != SessionState::Running {
                return;
            }
        }
        match self.narration.speak(text).await {
            Ok(()) | Err(NarrationError::Playback(PlaybackError::Interrupted)) => {}
            Err(e) => {
                warn!(segment = index, error = %e, "Narration failed, continuing on timer");
                let notice = if e.is_auth_failure() {
                    NOTICE_SIGN_IN_RUNNING
                } else {
                    NOTICE_VOICE_FAILED
                };
                let mut s = self.lock();
                if self.segment_is_current(&s, generation, index) {
                    s.notice = Some(notice.to_string());
                    self.publish(&s);
                }
            }
        }
    }

    /// A step that cannot run ends the session without completion narration.
    fn abort_malformed(self: &Arc<Self>, s: &mut Shared, index: usize) {
        warn!(segment = index, "Malformed step, ending session");
        self.bump_generation();
        s.cancel_tasks();
        s.clear_display();
        s.notice = Some(NOTICE_MALFORMED.to_string());
        s.state = SessionState::Completed;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.narration.stop().await;
            inner.music.stop().await;
        });
        self.publish(s);
    }

    fn begin_completion(self: &Arc<Self>, s: &mut Shared, generation: u64) {
        let Some(plan) = s.plan.clone() else {
            return;
        };
        // The tick loop ends on its own after this returns.
        s.tick_task.take();
        if let Some(handle) = s.narration_task.take() {
            handle.abort();
        }
        s.state = SessionState::Completing;
        s.instruction.clear();
        s.animation_scale = REST_SCALE;
        s.guidance_text = plan.completion_narration.clone();
        info!(plan = %plan.display_name, "Session completing");

        let inner = Arc::clone(self);
        let token = s.run_token.clone();
        s.background_task = Some(tokio::spawn(async move {
            inner.complete(generation, token, plan).await;
        }));
        self.publish(s);
    }

    async fn complete(self: Arc<Self>, generation: u64, token: CancellationToken, plan: Arc<ExercisePlan>) {
        let closing = async {
            self.narration.stop().await;
            self.music.fade_out().await;
            if self.is_current(generation) {
                self.narration.speak_or_log(&plan.completion_narration).await;
            }
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = closing => {}
        }

        let mut s = self.lock();
        if !self.is_current(generation) || s.state != SessionState::Completing {
            return;
        }
        match &self.user_id {
            Some(user_id) => {
                s.recording = Some(self.recorder.record(
                    user_id.clone(),
                    plan.stress_score,
                    Some(session_notes(&plan)),
                ));
            }
            None => debug!("No signed-in user, skipping stress entry"),
        }
        s.state = SessionState::Completed;
        self.publish(&s);
        info!(plan = %plan.display_name, "Session completed");
    }
}
