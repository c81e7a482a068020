//! Narration driver.
//!
//! Turns text into speech on the voice channel. Synthesized clips are kept in
//! a bounded LRU cache keyed by voice and the first 50 characters of the text,
//! so repeated lines (phase words, repeated sessions) are synthesized once.
//! The cache belongs to the driver; `clear_cache` releases every clip.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::{AudioChannel, AudioClip};
use crate::config::VoiceConfig;
use crate::error::NarrationError;
use crate::service::{SpeechRequest, SpeechSynthesizer};
use crate::types::Voice;

/// Number of leading characters that identify a text in the cache.
pub const CACHE_KEY_CHARS: usize = 50;

type CacheKey = (Voice, String);

fn cache_key(voice: Voice, text: &str) -> CacheKey {
    (voice, text.chars().take(CACHE_KEY_CHARS).collect())
}

pub struct NarrationDriver {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    channel: Arc<dyn AudioChannel>,
    cache: Mutex<LruCache<CacheKey, AudioClip>>,
    voice: Voice,
    speed: f32,
    volume: f32,
    synthesis_timeout: Duration,
}

impl NarrationDriver {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        channel: Arc<dyn AudioChannel>,
        config: &VoiceConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            synthesizer,
            channel,
            cache: Mutex::new(LruCache::new(capacity)),
            voice: config.voice,
            speed: config.speed,
            volume: config.volume,
            synthesis_timeout: config.narration_timeout(),
        }
    }

    pub fn voice(&self) -> Voice {
        self.voice
    }

    pub fn channel(&self) -> &Arc<dyn AudioChannel> {
        &self.channel
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, AudioClip>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }

    /// Synthesize `text`, or reuse the cached clip.
    pub async fn prepare(&self, text: &str) -> Result<AudioClip, NarrationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(NarrationError::EmptyText);
        }
        let key = cache_key(self.voice, text);
        if let Some(clip) = self.cache().get(&key)
            && clip.label == text
        {
            debug!(voice = %self.voice, "Narration cache hit");
            return Ok(clip.clone());
        }

        let request = SpeechRequest::new(text)
            .with_voice(self.voice)
            .with_speed(self.speed);
        let clip = tokio::time::timeout(self.synthesis_timeout, self.synthesizer.synthesize(&request))
            .await
            .map_err(|_| NarrationError::TimedOut {
                timeout_secs: self.synthesis_timeout.as_secs(),
            })??;

        let evicted = self.cache().push(key, clip.clone());
        if let Some((_, old)) = evicted {
            self.channel.release(&old);
        }
        Ok(clip)
    }

    /// Narrate `text`, resolving when playback ends.
    pub async fn speak(&self, text: &str) -> Result<(), NarrationError> {
        let clip = self.prepare(text).await?;
        self.channel.load(clip, false).await?;
        self.channel.set_volume(self.volume).await;
        self.channel.start().await?;
        self.channel.wait_finished().await?;
        Ok(())
    }

    /// Like `speak`, logging failures instead of returning them.
    pub async fn speak_or_log(&self, text: &str) -> bool {
        match self.speak(text).await {
            Ok(()) => true,
            Err(NarrationError::Playback(crate::error::PlaybackError::Interrupted)) => false,
            Err(e) => {
                warn!(error = %e, "Narration failed");
                false
            }
        }
    }

    pub async fn pause(&self) {
        self.channel.pause().await;
    }

    pub async fn resume(&self) {
        if let Err(e) = self.channel.resume().await {
            warn!(error = %e, "Failed to resume narration");
        }
    }

    pub async fn stop(&self) {
        self.channel.stop().await;
    }

    /// Drop every cached clip, releasing it through the channel.
    pub fn clear_cache(&self) -> usize {
        let mut cache = self.cache();
        let count = cache.len();
        while let Some((_, clip)) = cache.pop_lru() {
            self.channel.release(&clip);
        }
        debug!(count, "Cleared narration cache");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SimulatedChannel;
    use crate::error::ServiceError;
    use crate::service::MockVoiceService;

    fn driver(
        capacity: usize,
    ) -> (NarrationDriver, Arc<MockVoiceService>, Arc<SimulatedChannel>) {
        let mock = Arc::new(MockVoiceService::new());
        let channel = Arc::new(SimulatedChannel::new("voice"));
        let config = VoiceConfig {
            cache_capacity: capacity,
            ..VoiceConfig::default()
        };
        let driver = NarrationDriver::new(mock.clone(), channel.clone(), &config);
        (driver, mock, channel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_avoids_resynthesis() {
        let (driver, mock, channel) = driver(8);
        driver.speak("Inhale").await.unwrap();
        driver.speak("Inhale").await.unwrap();
        assert_eq!(mock.speech_calls(), 1);
        assert_eq!(channel.history(), vec!["Inhale".to_string(), "Inhale".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_key_uses_prefix_and_voice() {
        let a = cache_key(Voice::Nova, &"a".repeat(80));
        let b = cache_key(Voice::Nova, &"a".repeat(60));
        let c = cache_key(Voice::Shimmer, &"a".repeat(60));
        assert_eq!(a, b);
        assert_ne!(b, c);
    }

    #[tokio::test]
    async fn test_shared_prefix_with_different_text_is_resynthesized() {
        let (driver, mock, _) = driver(8);
        let base = "x".repeat(CACHE_KEY_CHARS);
        driver.prepare(&format!("{base} one")).await.unwrap();
        let clip = driver.prepare(&format!("{base} two")).await.unwrap();
        assert!(clip.label.ends_with("two"));
        assert_eq!(mock.speech_calls(), 2);
    }

    #[tokio::test]
    async fn test_eviction_releases_clips() {
        let (driver, _, channel) = driver(2);
        driver.prepare("one").await.unwrap();
        driver.prepare("two").await.unwrap();
        driver.prepare("three").await.unwrap();
        assert_eq!(driver.cached_len(), 2);
        assert_eq!(channel.released_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_releases_all() {
        let (driver, _, channel) = driver(8);
        driver.prepare("one").await.unwrap();
        driver.prepare("two").await.unwrap();
        assert_eq!(driver.clear_cache(), 2);
        assert_eq!(driver.cached_len(), 0);
        assert_eq!(channel.released_count(), 2);
    }

    #[tokio::test]
    async fn test_synthesis_failure_surfaces() {
        let (driver, mock, channel) = driver(8);
        mock.set_speech_failure(Some(ServiceError::Unavailable {
            status: 502,
            message: "bad gateway".into(),
        }));
        let err = driver.speak("Exhale").await.unwrap_err();
        assert!(matches!(err, NarrationError::Synthesis(_)));
        assert!(channel.history().is_empty());
        assert!(!driver.speak_or_log("Exhale").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_timeout() {
        let (driver, mock, _) = driver(8);
        mock.set_speech_delay(Duration::from_secs(600));
        let err = driver.speak("Hold").await.unwrap_err();
        assert!(matches!(err, NarrationError::TimedOut { timeout_secs: 45 }));
    }

    #[tokio::test]
    async fn test_empty_text() {
        let (driver, mock, _) = driver(8);
        assert!(matches!(
            driver.speak("  ").await,
            Err(NarrationError::EmptyText)
        ));
        assert_eq!(mock.speech_calls(), 0);
    }
}
