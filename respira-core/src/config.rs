//! Configuration system for Respira.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/respira/config.toml` and/or `.respira/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::Voice;

/// Top-level configuration for the session engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RespiraConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub music: MusicConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Connection details for the hosted backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the serverless functions (`.../functions/v1`).
    pub functions_url: String,
    /// Base URL of the REST row store (`.../rest/v1`).
    pub rest_url: String,
    /// Public project key sent as the `apikey` header.
    #[serde(default)]
    pub anon_key: String,
    /// Bearer token of the signed-in user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Id of the signed-in user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Retries for transient (5xx / network) failures.
    pub max_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            functions_url: "http://localhost:54321/functions/v1".to_string(),
            rest_url: "http://localhost:54321/rest/v1".to_string(),
            anon_key: String::new(),
            access_token: None,
            user_id: None,
            request_timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Narration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Narration voice.
    pub voice: Voice,
    /// Speech speed multiplier sent to the synthesizer.
    pub speed: f32,
    /// Playback volume 0.0..=1.0.
    pub volume: f32,
    /// Upper bound on synthesizing one narration clip. Playback is not bounded.
    pub narration_timeout_secs: u64,
    /// Number of synthesized clips kept in the narration cache.
    pub cache_capacity: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: Voice::Nova,
            speed: 0.8,
            volume: 0.8,
            narration_timeout_secs: 45,
            cache_capacity: 64,
        }
    }
}

impl VoiceConfig {
    pub fn narration_timeout(&self) -> Duration {
        Duration::from_secs(self.narration_timeout_secs)
    }
}

/// Background music settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicConfig {
    pub enabled: bool,
    /// Volume used when a stage setting does not specify one.
    pub default_volume: f32,
    pub default_fade_in_secs: f32,
    pub default_fade_out_secs: f32,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_volume: 0.1,
            default_fade_in_secs: 2.0,
            default_fade_out_secs: 2.0,
        }
    }
}

/// Sequencer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Length of one elapsed-time tick in milliseconds.
    pub tick_millis: u64,
    /// How many times a mood preset pattern is repeated.
    pub preset_cycles: u32,
    /// Name used when the profile lookup fails.
    pub fallback_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            preset_cycles: 5,
            fallback_name: "there".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

impl RespiraConfig {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.voice.volume) {
            return Err(ConfigError::Invalid {
                message: format!("voice.volume must be within 0..=1, got {}", self.voice.volume),
            });
        }
        if !(0.25..=4.0).contains(&self.voice.speed) {
            return Err(ConfigError::Invalid {
                message: format!("voice.speed must be within 0.25..=4, got {}", self.voice.speed),
            });
        }
        if !(0.0..=1.0).contains(&self.music.default_volume) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "music.default_volume must be within 0..=1, got {}",
                    self.music.default_volume
                ),
            });
        }
        if self.music.default_fade_in_secs < 0.0 || self.music.default_fade_out_secs < 0.0 {
            return Err(ConfigError::Invalid {
                message: "music fade durations must not be negative".to_string(),
            });
        }
        if self.voice.cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "voice.cache_capacity must be at least 1".to_string(),
            });
        }
        if self.session.tick_millis == 0 {
            return Err(ConfigError::Invalid {
                message: "session.tick_millis must be at least 1".to_string(),
            });
        }
        if self.session.preset_cycles == 0 {
            return Err(ConfigError::Invalid {
                message: "session.preset_cycles must be at least 1".to_string(),
            });
        }
        for (field, url) in [
            ("service.functions_url", &self.service.functions_url),
            ("service.rest_url", &self.service.rest_url),
        ] {
            url::Url::parse(url).map_err(|e| ConfigError::Invalid {
                message: format!("{field} is not a valid URL: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RESPIRA_`)
/// 3. Workspace-local config (`.respira/config.toml`)
/// 4. User config (`~/.config/respira/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&RespiraConfig>,
) -> Result<RespiraConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RespiraConfig::default()));

    // User-level config
    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (RESPIRA_VOICE__SPEED, RESPIRA_SERVICE__ACCESS_TOKEN, etc.)
    figment = figment.merge(Env::prefixed("RESPIRA_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// `~/.config/respira/config.toml`, when a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "respira", "respira")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".respira").join("config.toml")
}

/// Write `config` to the workspace config file, creating `.respira/` if needed.
pub fn save_config(workspace: &Path, config: &RespiraConfig) -> Result<PathBuf, ConfigError> {
    let path = workspace_config_path(workspace);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::Invalid {
            message: format!("cannot create {}: {e}", dir.display()),
        })?;
    }
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    std::fs::write(&path, content).map_err(|e| ConfigError::Invalid {
        message: format!("cannot write {}: {e}", path.display()),
    })?;
    Ok(path)
}
