//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use respira_core::config::{RespiraConfig, load_config, save_config, workspace_config_path};
use respira_core::error::SessionError;
use respira_core::insights::StressStats;
use respira_core::plan::{FixedPlanGenerator, MoodPresetGenerator};
use respira_core::service::{SpeechRequest, StressAnalysisRequest};
use respira_core::{
    DataStore, FunctionsClient, GuidanceService, InMemoryStore, MockVoiceService, MoodPreset,
    RestDataStore, SessionDeps, SessionSequencer, SessionSnapshot, SessionState,
    SimulatedChannel, SpeechSynthesizer, StressLevel, Voice, WelcomeFlow,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::info;

type Input = Lines<BufReader<Stdin>>;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path, offline: bool) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return handle_config(action, workspace).await;
    }

    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.validate()?;

    match command {
        Commands::Session { level } => {
            let level = StressLevel::new(level)?;
            let backend = Backend::connect(&config, offline)?;
            let seq = SessionSequencer::new(&config, backend.session_deps());
            seq.start_level(level).await?;
            drive(&seq, &mut stdin_lines()).await
        }
        Commands::Mood { text } => handle_mood(&config, offline, text).await,
        Commands::Preset { name } => handle_preset(&config, offline, name).await,
        Commands::Plan { level, preset } => handle_plan(&config, level, preset),
        Commands::History { limit } => handle_history(&config, offline, limit).await,
        Commands::Insights { limit } => handle_insights(&config, offline, limit).await,
        Commands::Voices => {
            for voice in Voice::ALL {
                let marker = if voice == config.voice.voice { "*" } else { " " };
                println!(
                    "{} {:<8} {}",
                    marker,
                    voice.display_name(),
                    voice.description()
                );
            }
            Ok(())
        }
        Commands::Speak { text, voice } => handle_speak(&config, offline, text, voice).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Remote (or mock) collaborators for one command.
struct Backend {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    guidance: Arc<dyn GuidanceService>,
    store: Arc<dyn DataStore>,
}

impl Backend {
    fn connect(config: &RespiraConfig, offline: bool) -> anyhow::Result<Self> {
        if offline {
            info!("Using offline voice service");
            let service = Arc::new(MockVoiceService::new());
            return Ok(Self {
                synthesizer: service.clone(),
                guidance: service,
                store: Arc::new(InMemoryStore::new()),
            });
        }
        let client = Arc::new(FunctionsClient::from_config(&config.service)?);
        let store = RestDataStore::from_config(&config.service)?;
        info!(url = %client.base_url(), "Using hosted voice service");
        Ok(Self {
            synthesizer: client.clone(),
            guidance: client,
            store: Arc::new(store),
        })
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            synthesizer: self.synthesizer.clone(),
            guidance: self.guidance.clone(),
            store: self.store.clone(),
            voice_channel: Arc::new(SimulatedChannel::new("voice")),
            music_channel: Arc::new(SimulatedChannel::new("music")),
        }
    }

    async fn display_name(&self, config: &RespiraConfig) -> String {
        let name = match &config.service.user_id {
            Some(user_id) => self.store.display_name(user_id).await.ok().flatten(),
            None => None,
        };
        name.unwrap_or_else(|| config.session.fallback_name.clone())
    }
}

fn stdin_lines() -> Input {
    BufReader::new(tokio::io::stdin()).lines()
}

async fn handle_mood(config: &RespiraConfig, offline: bool, text: Option<String>) -> anyhow::Result<()> {
    let backend = Backend::connect(config, offline)?;
    let seq = SessionSequencer::new(config, backend.session_deps());
    let mut input = stdin_lines();

    seq.welcome(WelcomeFlow::Mood).await?;
    println!("{}", seq.snapshot().guidance_text);

    let mut pending = text;
    loop {
        let mood = match pending.take() {
            Some(mood) => mood,
            None => {
                print!("> ");
                std::io::stdout().flush()?;
                match input.next_line().await? {
                    Some(line) => line,
                    None => {
                        seq.teardown().await;
                        return Ok(());
                    }
                }
            }
        };
        println!("Creating your personalized exercise...");
        match seq.submit_mood(&mood).await {
            Ok(()) => {}
            Err(SessionError::EmptyMood) => {
                println!("Please describe how you're feeling in a few words.");
                continue;
            }
            Err(SessionError::Unauthenticated) => {
                seq.teardown().await;
                anyhow::bail!(
                    "Your sign-in has expired.\n\
                     Update service.access_token in .respira/config.toml or RESPIRA_SERVICE__ACCESS_TOKEN."
                );
            }
            Err(e) => return Err(e.into()),
        }
        if seq.state() != SessionState::AwaitingMoodInput {
            break;
        }
        if let Some(notice) = seq.snapshot().notice {
            println!("{}", notice);
        }
    }

    drive(&seq, &mut input).await
}

async fn handle_preset(config: &RespiraConfig, offline: bool, preset: MoodPreset) -> anyhow::Result<()> {
    let backend = Backend::connect(config, offline)?;
    let name = backend.display_name(config).await;
    let plan = MoodPresetGenerator::new(config.session.preset_cycles).plan(preset, &name);
    let seq = SessionSequencer::new(config, backend.session_deps());
    seq.start(plan).await?;
    drive(&seq, &mut stdin_lines()).await
}

fn handle_plan(
    config: &RespiraConfig,
    level: Option<i64>,
    preset: Option<MoodPreset>,
) -> anyhow::Result<()> {
    let plan = match (level, preset) {
        (Some(level), _) => FixedPlanGenerator.plan(StressLevel::new(level)?, None),
        (None, Some(preset)) => MoodPresetGenerator::new(config.session.preset_cycles)
            .plan(preset, &config.session.fallback_name),
        (None, None) => anyhow::bail!("Specify --level or --preset"),
    };
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn configured_user(config: &RespiraConfig) -> anyhow::Result<String> {
    config.service.user_id.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "No user configured.\n\
             Set service.user_id in .respira/config.toml or RESPIRA_SERVICE__USER_ID."
        )
    })
}

async fn handle_history(config: &RespiraConfig, offline: bool, limit: usize) -> anyhow::Result<()> {
    let user_id = configured_user(config)?;
    let backend = Backend::connect(config, offline)?;
    let (name, entries) = futures::try_join!(
        backend.store.display_name(&user_id),
        backend.store.stress_entries(&user_id, limit)
    )?;

    println!("Stress history for {}", name.unwrap_or(user_id));
    if entries.is_empty() {
        println!("  No entries yet.");
    }
    for entry in entries {
        println!(
            "  {}  {}/5  {}",
            entry
                .created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
            entry.stress_score,
            entry.notes.unwrap_or_default()
        );
    }
    Ok(())
}

async fn handle_insights(config: &RespiraConfig, offline: bool, limit: usize) -> anyhow::Result<()> {
    let user_id = configured_user(config)?;
    let backend = Backend::connect(config, offline)?;
    let entries = backend.store.stress_entries(&user_id, limit).await?;
    let Some(stats) = StressStats::from_entries(&entries) else {
        println!("No stress entries yet. Complete a session to start your history.");
        return Ok(());
    };
    for line in describe_stats(&stats) {
        println!("{}", line);
    }

    println!("Asking for personalized insights...");
    let request = StressAnalysisRequest {
        stress_entries: entries,
    };
    let analysis = backend
        .guidance
        .analyze_stress(&request)
        .await
        .map_err(|e| anyhow::anyhow!("Stress analysis failed: {}", e))?;
    println!();
    println!("{}", analysis.analysis.trim());
    Ok(())
}

fn describe_stats(stats: &StressStats) -> Vec<String> {
    vec![
        format!("Entries:        {}", stats.total),
        format!("Average stress: {:.1}/5", stats.average),
        format!(
            "High (4-5):     {} ({:.1}%)",
            stats.high_stress,
            stats.percent(stats.high_stress)
        ),
        format!(
            "Low (1-2):      {} ({:.1}%)",
            stats.low_stress,
            stats.percent(stats.low_stress)
        ),
        format!("Trend:          {} ({:+.1})", stats.direction(), stats.trend),
    ]
}

async fn handle_speak(
    config: &RespiraConfig,
    offline: bool,
    text: String,
    voice: Voice,
) -> anyhow::Result<()> {
    let backend = Backend::connect(config, offline)?;
    println!("Synthesizing: \"{}\" (voice: {})", text, voice.display_name());
    let request = SpeechRequest::new(&text)
        .with_voice(voice)
        .with_speed(config.voice.speed);
    let clip = backend
        .synthesizer
        .synthesize(&request)
        .await
        .map_err(|e| anyhow::anyhow!("Speech synthesis failed: {}", e))?;

    let out_path = std::env::temp_dir().join("respira_speech.mp3");
    std::fs::write(&out_path, &clip.bytes)?;
    println!("  Bytes:     {}", clip.bytes.len());
    println!("  Duration:  ~{:.1}s", clip.estimated_duration().as_secs_f32());
    println!("  Saved:     {}", out_path.display());
    Ok(())
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            let path = save_config(workspace, &RespiraConfig::default())?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// A keyboard command, resolved against the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Pause,
    Resume,
    StartAgain,
    Repeat,
    Stop,
    Quit,
    Nothing,
    Unknown(String),
}

fn action_for(state: SessionState, line: &str) -> Action {
    match line.trim() {
        "p" => Action::Pause,
        "r" => match state {
            SessionState::Idle => Action::StartAgain,
            SessionState::Completed => Action::Repeat,
            _ => Action::Resume,
        },
        "s" => Action::Stop,
        "q" => Action::Quit,
        "" => Action::Nothing,
        other => Action::Unknown(other.to_string()),
    }
}

/// Render snapshots and forward keyboard commands until the user quits.
async fn drive(seq: &SessionSequencer, input: &mut Input) -> anyhow::Result<()> {
    let mut rx = seq.subscribe();
    let mut last = rx.borrow_and_update().clone();
    for line in describe_changes(None, &last) {
        println!("{}", line);
    }
    println!("Commands: p = pause, r = resume / start again / repeat, s = stop, q = quit");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                info!("Interrupted");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                for line in describe_changes(Some(&last), &snapshot) {
                    println!("{}", line);
                }
                let finished = snapshot.state == SessionState::Completed
                    && last.state != SessionState::Completed;
                last = snapshot;
                if finished {
                    match seq.wait_for_recording().await {
                        Some(true) => println!("Saved to your stress history."),
                        Some(false) => println!("Could not save this session to your history."),
                        None => {}
                    }
                    if !input_open {
                        break;
                    }
                }
            }
            line = input.next_line(), if input_open => {
                let Some(line) = line? else {
                    input_open = false;
                    if seq.state() == SessionState::Completed {
                        break;
                    }
                    continue;
                };
                let result = match action_for(seq.state(), &line) {
                    Action::Pause => seq.pause().await,
                    Action::Resume => seq.resume().await,
                    Action::StartAgain => seq.start_prepared().await,
                    Action::Repeat => seq.repeat().await,
                    Action::Stop => seq.stop().await,
                    Action::Quit => break,
                    Action::Nothing => Ok(()),
                    Action::Unknown(other) => {
                        println!("Unknown command '{}'. Use p, r, s or q.", other);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    println!("{}", e);
                }
            }
        }
    }

    seq.teardown().await;
    Ok(())
}

fn clock(secs: u32) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Lines worth printing for the change from `prev` to `next`.
fn describe_changes(prev: Option<&SessionSnapshot>, next: &SessionSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    let state_changed = prev.is_none_or(|p| p.state != next.state);
    if state_changed {
        let name = next.plan_name.as_deref().unwrap_or("session");
        match next.state {
            SessionState::Running if prev.is_none_or(|p| p.state != SessionState::Paused) => {
                lines.push(format!("== {} ({}) ==", name, clock(next.total_secs)));
            }
            SessionState::Running => lines.push("Resumed.".to_string()),
            SessionState::Paused => lines.push(format!("Paused at {}.", clock(next.elapsed_secs))),
            SessionState::Idle if prev.is_some() => {
                lines.push("Stopped. Press r to start again or q to quit.".to_string());
            }
            SessionState::Completed => {
                lines.push(format!("== {} complete ==", name));
                lines.push("Press r to repeat or q to close.".to_string());
            }
            _ => {}
        }
    }

    let segment_changed = prev.is_none_or(|p| {
        p.segment_index != next.segment_index || p.instruction != next.instruction
    });
    if next.state == SessionState::Running && segment_changed && !next.instruction.is_empty() {
        lines.push(format!(
            "[{} / {}] {}",
            clock(next.elapsed_secs),
            clock(next.total_secs),
            next.instruction
        ));
    }

    if !next.guidance_text.is_empty() && prev.is_none_or(|p| p.guidance_text != next.guidance_text) {
        lines.push(format!("  {}", next.guidance_text));
    }
    if let Some(track) = &next.music_track
        && prev.is_none_or(|p| p.music_track.as_ref() != Some(track))
    {
        lines.push(format!("  ♪ {}", track));
    }
    if let Some(notice) = &next.notice
        && prev.is_none_or(|p| p.notice.as_ref() != Some(notice))
    {
        lines.push(format!("! {}", notice));
    }
    lines
}
