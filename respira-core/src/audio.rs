//! Audio playback channels.
//!
//! An `AudioChannel` is one logical output (the narration voice, the background
//! music bed). Playback is awaitable and cancellable: `wait_finished` resolves
//! when the loaded clip ends and fails with `PlaybackError::Interrupted` when the
//! channel is stopped or released first.
//!
//! `SimulatedChannel` is the built-in implementation. It keeps time with
//! `tokio::time`, estimating clip length from the encoded size, so sessions can
//! be driven headless and tested deterministically with a paused clock.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::PlaybackError;

/// Bit rate assumed when estimating the length of an encoded clip.
pub const ESTIMATE_BITRATE: u64 = 128_000;

/// A playable unit of audio: synthesized speech bytes or a remote music file.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Short human-readable label (the narrated text or the track name).
    pub label: String,
    /// Encoded audio. Empty for clips that stream from `url`.
    pub bytes: Bytes,
    pub mime_type: String,
    pub url: Option<String>,
    /// Known length, when the source reports one.
    pub duration_hint: Option<Duration>,
}

impl AudioClip {
    /// An MPEG clip held in memory.
    pub fn mpeg(label: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            label: label.into(),
            bytes: bytes.into(),
            mime_type: "audio/mpeg".to_string(),
            url: None,
            duration_hint: None,
        }
    }

    /// A clip streamed from a URL.
    pub fn remote(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bytes: Bytes::new(),
            mime_type: "audio/mpeg".to_string(),
            url: Some(url.into()),
            duration_hint: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_hint = Some(duration);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.url.is_none()
    }

    /// Playback length: the hint if present, else estimated from the byte size.
    pub fn estimated_duration(&self) -> Duration {
        if let Some(hint) = self.duration_hint {
            return hint;
        }
        let millis = self.bytes.len() as u64 * 8 * 1000 / ESTIMATE_BITRATE;
        Duration::from_millis(millis)
    }
}

/// One logical audio output.
#[async_trait]
pub trait AudioChannel: Send + Sync {
    /// Channel name used in logs and errors.
    fn name(&self) -> &str;

    /// Load a clip, replacing (and interrupting) whatever was loaded.
    async fn load(&self, clip: AudioClip, looping: bool) -> Result<(), PlaybackError>;

    /// Start playback of the loaded clip from its current position.
    async fn start(&self) -> Result<(), PlaybackError>;

    /// Resolve when the loaded clip plays to its end.
    async fn wait_finished(&self) -> Result<(), PlaybackError>;

    /// Pause, keeping the playback position.
    async fn pause(&self);

    /// Continue after `pause`. No-op when not paused.
    async fn resume(&self) -> Result<(), PlaybackError>;

    /// Stop and rewind. Pending `wait_finished` calls fail with `Interrupted`.
    async fn stop(&self);

    async fn set_volume(&self, volume: f32);

    fn volume(&self) -> f32;

    fn is_playing(&self) -> bool;

    fn is_paused(&self) -> bool;

    /// Label of the loaded clip, if any.
    fn current(&self) -> Option<String>;

    /// Release a clip's underlying resources (cache eviction, teardown).
    fn release(&self, clip: &AudioClip);

    /// Stop and unload everything.
    async fn unload(&self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Transport {
    Stopped,
    Playing { since: Instant, offset: Duration },
    Paused { offset: Duration },
    Ended,
}

#[derive(Debug)]
struct ChannelState {
    clip: Option<AudioClip>,
    looping: bool,
    volume: f32,
    transport: Transport,
    history: Vec<String>,
    released: usize,
    fail_next_start: Option<PlaybackError>,
}

/// A headless channel that keeps time without producing sound.
#[derive(Debug)]
pub struct SimulatedChannel {
    name: String,
    state: Mutex<ChannelState>,
    changed: watch::Sender<u64>,
}

impl SimulatedChannel {
    pub fn new(name: impl Into<String>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            name: name.into(),
            state: Mutex::new(ChannelState {
                clip: None,
                looping: false,
                volume: 1.0,
                transport: Transport::Stopped,
                history: Vec::new(),
                released: 0,
                fail_next_start: None,
            }),
            changed,
        }
    }

    /// Make the next `start` fail, e.g. to simulate a blocked autoplay.
    pub fn fail_next_start(&self, error: PlaybackError) {
        self.lock().fail_next_start = Some(error);
    }

    /// Labels of every clip started on this channel, in order.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// Number of clips released so far.
    pub fn released_count(&self) -> usize {
        self.lock().released
    }

    /// Whether the loaded clip loops.
    pub fn is_looping(&self) -> bool {
        self.lock().looping
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }
}

#[async_trait]
impl AudioChannel for SimulatedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, clip: AudioClip, looping: bool) -> Result<(), PlaybackError> {
        if clip.is_empty() {
            return Err(PlaybackError::Device {
                message: format!("clip '{}' has no audio", clip.label),
            });
        }
        {
            let mut state = self.lock();
            state.clip = Some(clip);
            state.looping = looping;
            state.transport = Transport::Stopped;
        }
        self.notify();
        Ok(())
    }

    async fn start(&self) -> Result<(), PlaybackError> {
        {
            let mut state = self.lock();
            if let Some(err) = state.fail_next_start.take() {
                return Err(err);
            }
            let Some(label) = state.clip.as_ref().map(|c| c.label.clone()) else {
                return Err(PlaybackError::NothingLoaded {
                    channel: self.name.clone(),
                });
            };
            let offset = match state.transport {
                Transport::Paused { offset } => offset,
                Transport::Playing { .. } => return Ok(()),
                Transport::Stopped | Transport::Ended => Duration::ZERO,
            };
            state.transport = Transport::Playing {
                since: Instant::now(),
                offset,
            };
            if offset.is_zero() {
                state.history.push(label);
            }
        }
        debug!(channel = %self.name, "Playback started");
        self.notify();
        Ok(())
    }

    async fn wait_finished(&self) -> Result<(), PlaybackError> {
        let mut changed = self.changed.subscribe();
        loop {
            let deadline = {
                let mut state = self.lock();
                let Some(length) = state.clip.as_ref().map(AudioClip::estimated_duration) else {
                    return Err(PlaybackError::Interrupted);
                };
                let transport = state.transport;
                match transport {
                    Transport::Ended => return Ok(()),
                    Transport::Stopped => return Err(PlaybackError::Interrupted),
                    Transport::Paused { .. } => None,
                    Transport::Playing { .. } if state.looping => None,
                    Transport::Playing { since, offset } => {
                        let remaining = length.saturating_sub(offset);
                        let deadline = since + remaining;
                        if Instant::now() >= deadline {
                            state.transport = Transport::Ended;
                            return Ok(());
                        }
                        Some(deadline)
                    }
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        res = changed.changed() => {
                            if res.is_err() {
                                return Err(PlaybackError::Interrupted);
                            }
                        }
                    }
                }
                None => {
                    if changed.changed().await.is_err() {
                        return Err(PlaybackError::Interrupted);
                    }
                }
            }
        }
    }

    async fn pause(&self) {
        {
            let mut state = self.lock();
            if let Transport::Playing { since, offset } = state.transport {
                state.transport = Transport::Paused {
                    offset: offset + since.elapsed(),
                };
            }
        }
        self.notify();
    }

    async fn resume(&self) -> Result<(), PlaybackError> {
        let paused = matches!(self.lock().transport, Transport::Paused { .. });
        if paused {
            self.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) {
        self.lock().transport = Transport::Stopped;
        self.notify();
    }

    async fn set_volume(&self, volume: f32) {
        self.lock().volume = volume.clamp(0.0, 1.0);
    }

    fn volume(&self) -> f32 {
        self.lock().volume
    }

    fn is_playing(&self) -> bool {
        matches!(self.lock().transport, Transport::Playing { .. })
    }

    fn is_paused(&self) -> bool {
        matches!(self.lock().transport, Transport::Paused { .. })
    }

    fn current(&self) -> Option<String> {
        self.lock().clip.as_ref().map(|c| c.label.clone())
    }

    fn release(&self, clip: &AudioClip) {
        debug!(channel = %self.name, clip = %clip.label, "Released clip");
        self.lock().released += 1;
    }

    async fn unload(&self) {
        {
            let mut state = self.lock();
            state.clip = None;
            state.transport = Transport::Stopped;
        }
        self.notify();
    }
}
