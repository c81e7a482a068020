//! Background music driver.
//!
//! Each stage may have a music setting for the session's stress level. On a
//! stage change the driver cross-fades to the configured track, retunes the
//! volume when the track stays the same, and fades out when the stage has no
//! (active) track. Only one transition runs at a time; starting a new one
//! aborts the previous. Pausing aborts an unfinished transition and resuming
//! replays it for the same stage. Playback problems are logged and treated as
//! silence.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{AudioChannel, AudioClip};
use crate::config::MusicConfig;
use crate::store::DataStore;
use crate::types::{MusicSetting, MusicTrack, StressLevel};

/// Number of volume steps in a fade.
pub const FADE_STEPS: u32 = 60;

/// Ramp the channel volume from `from` to `to` over `duration`.
///
/// A zero duration sets the target immediately.
pub async fn fade(channel: &dyn AudioChannel, from: f32, to: f32, duration: Duration) {
    let from = from.clamp(0.0, 1.0);
    let to = to.clamp(0.0, 1.0);
    let step = duration / FADE_STEPS;
    if step.is_zero() {
        channel.set_volume(to).await;
        return;
    }
    let mut ticker = tokio::time::interval(step);
    // The first tick completes immediately.
    ticker.tick().await;
    for i in 1..FADE_STEPS {
        ticker.tick().await;
        let volume = from + (to - from) * (i as f32 / FADE_STEPS as f32);
        channel.set_volume(volume).await;
    }
    ticker.tick().await;
    channel.set_volume(to).await;
}

fn secs(value: f32) -> Duration {
    Duration::from_secs_f32(value.max(0.0))
}

/// Resolved playback parameters for one stage.
#[derive(Debug, Clone, PartialEq)]
struct StageMusic {
    track: Option<MusicTrack>,
    volume: f32,
    fade_in: Duration,
    fade_out: Duration,
}

#[derive(Debug, Default)]
struct MusicState {
    level: Option<StressLevel>,
    current: Option<MusicTrack>,
    fade_out: Option<Duration>,
    transition: Option<JoinHandle<()>>,
    /// Stage of the latest transition.
    stage: Option<String>,
    paused: bool,
    /// A transition was cut short by `pause` and must run again on `resume`.
    replay: bool,
}

pub struct MusicDriver {
    store: Arc<dyn DataStore>,
    channel: Arc<dyn AudioChannel>,
    defaults: MusicConfig,
    state: Mutex<MusicState>,
}

impl MusicDriver {
    pub fn new(store: Arc<dyn DataStore>, channel: Arc<dyn AudioChannel>, defaults: MusicConfig) -> Self {
        Self {
            store,
            channel,
            defaults,
            state: Mutex::new(MusicState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MusicState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stress level used for setting lookups.
    pub fn set_level(&self, level: StressLevel) {
        self.lock().level = Some(level);
    }

    /// Name of the track currently loaded, if any.
    pub fn current_track(&self) -> Option<String> {
        self.lock().current.as_ref().map(|t| t.name.clone())
    }

    pub fn channel(&self) -> &Arc<dyn AudioChannel> {
        &self.channel
    }

    fn abort_transition(&self) {
        if let Some(handle) = self.lock().transition.take() {
            handle.abort();
        }
    }

    /// Begin the transition for `stage_key` in the background. While paused
    /// the transition is held until `resume`.
    pub fn start_for_stage(self: &Arc<Self>, stage_key: &str) {
        if !self.defaults.enabled {
            return;
        }
        self.abort_transition();
        let mut state = self.lock();
        state.stage = Some(stage_key.to_string());
        if state.paused {
            state.replay = true;
            return;
        }
        state.replay = false;
        let driver = Arc::clone(self);
        let stage_key = stage_key.to_string();
        state.transition = Some(tokio::spawn(async move {
            driver.apply_stage(&stage_key).await;
        }));
    }

    /// Wait for the in-flight transition, if any.
    pub async fn settle(&self) {
        let handle = self.lock().transition.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn resolve(&self, stage_key: &str, level: StressLevel) -> StageMusic {
        let setting: Option<MusicSetting> = match self.store.music_setting(stage_key, level).await {
            Ok(setting) => setting,
            Err(e) => {
                warn!(stage = stage_key, error = %e, "Music settings lookup failed");
                None
            }
        };
        let volume = setting
            .as_ref()
            .and_then(|s| s.volume)
            .unwrap_or(self.defaults.default_volume);
        let fade_in = secs(
            setting
                .as_ref()
                .and_then(|s| s.fade_in_secs)
                .unwrap_or(self.defaults.default_fade_in_secs),
        );
        let fade_out = secs(
            setting
                .as_ref()
                .and_then(|s| s.fade_out_secs)
                .unwrap_or(self.defaults.default_fade_out_secs),
        );

        let track = match setting.and_then(|s| s.music_track_id) {
            Some(id) => match self.store.music_track(&id).await {
                Ok(track) => track.filter(|t| t.is_active && !t.file_url.is_empty()),
                Err(e) => {
                    warn!(track = %id, error = %e, "Music track lookup failed");
                    None
                }
            },
            None => None,
        };
        StageMusic {
            track,
            volume,
            fade_in,
            fade_out,
        }
    }

    /// Run the transition for `stage_key` to completion.
    pub async fn apply_stage(&self, stage_key: &str) {
        let Some(level) = self.lock().level else {
            debug!(stage = stage_key, "No stress level set, skipping music");
            return;
        };
        let music = self.resolve(stage_key, level).await;
        let current = self.lock().current.clone();

        match (music.track, current) {
            (None, current) => {
                if current.is_some() {
                    debug!(stage = stage_key, "No music for stage, fading out");
                    self.fade_to_silence(music.fade_out).await;
                }
            }
            (Some(track), Some(current)) if current.id == track.id => {
                let retune = music.fade_in.max(music.fade_out);
                fade(self.channel.as_ref(), self.channel.volume(), music.volume, retune).await;
                if !self.channel.is_playing()
                    && let Err(e) = self.channel.resume().await
                {
                    warn!(error = %e, "Failed to resume music");
                }
                self.lock().fade_out = Some(music.fade_out);
            }
            (Some(track), current) => {
                if current.is_some() {
                    self.fade_to_silence(music.fade_out).await;
                }
                let clip = AudioClip::remote(track.name.clone(), track.file_url.clone())
                    .with_duration(secs(track.duration_secs as f32));
                let started = async {
                    self.channel.load(clip, true).await?;
                    self.channel.set_volume(0.0).await;
                    self.channel.start().await
                }
                .await;
                if let Err(e) = started {
                    warn!(track = %track.name, error = %e, "Music playback failed, continuing without music");
                    self.channel.unload().await;
                    return;
                }
                info!(stage = stage_key, track = %track.name, "Music started");
                {
                    let mut state = self.lock();
                    state.current = Some(track);
                    state.fade_out = Some(music.fade_out);
                }
                fade(self.channel.as_ref(), 0.0, music.volume, music.fade_in).await;
            }
        }
    }

    async fn fade_to_silence(&self, duration: Duration) {
        if self.channel.is_playing() {
            fade(self.channel.as_ref(), self.channel.volume(), 0.0, duration).await;
        }
        self.channel.stop().await;
        self.channel.unload().await;
        self.lock().current = None;
    }

    /// Fade the current track out and stop. Resolves when silent.
    pub async fn fade_out(&self) {
        self.abort_transition();
        let duration = {
            let state = self.lock();
            if state.current.is_none() {
                return;
            }
            state
                .fade_out
                .unwrap_or_else(|| secs(self.defaults.default_fade_out_secs))
        };
        self.fade_to_silence(duration).await;
    }

    /// Stop immediately.
    pub async fn stop(&self) {
        self.abort_transition();
        {
            let mut state = self.lock();
            state.paused = false;
            state.replay = false;
            state.stage = None;
        }
        self.channel.stop().await;
        self.channel.unload().await;
        self.lock().current = None;
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Pause playback and hold any unfinished transition.
    pub async fn pause(&self) {
        {
            let mut state = self.lock();
            state.paused = true;
            if let Some(handle) = state.transition.take()
                && !handle.is_finished()
            {
                handle.abort();
                state.replay = state.stage.is_some();
                debug!(stage = ?state.stage, "Music transition held while paused");
            }
        }
        self.channel.pause().await;
    }

    /// Resume playback and rerun a held transition.
    pub async fn resume(self: &Arc<Self>) {
        let (current, held) = {
            let mut state = self.lock();
            state.paused = false;
            let held = if std::mem::take(&mut state.replay) {
                state.stage.clone()
            } else {
                None
            };
            (state.current.is_some(), held)
        };
        if current && let Err(e) = self.channel.resume().await {
            warn!(error = %e, "Failed to resume music");
        }
        if let Some(stage) = held {
            self.start_for_stage(&stage);
        }
    }
}

impl Drop for MusicDriver {
    fn drop(&mut self) {
        self.abort_transition();
    }
}
