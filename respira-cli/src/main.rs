//! Respira CLI: guided breathing sessions in the terminal.
//!
//! Runs fixed-level, mood-based and preset sessions against the hosted voice
//! service (or fully offline with `--offline`), and inspects plans, voices,
//! stress history, history insights and configuration.

mod commands;

use clap::Parser;
use respira_core::{MoodPreset, Voice};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Respira: AI-guided breathing sessions
#[derive(Parser, Debug)]
#[command(name = "respira", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Use the built-in mock service and an in-memory store
    #[arg(long, global = true)]
    offline: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the fixed session for a stress level (1-5)
    Session {
        #[arg(short, long)]
        level: i64,
    },
    /// Describe your mood and run a generated exercise
    Mood {
        /// Mood description (prompted for when omitted)
        text: Option<String>,
    },
    /// Run a built-in mood preset (e.g. anxious, stressed, tired)
    Preset { name: MoodPreset },
    /// Print a plan as JSON without running it
    Plan {
        #[arg(short, long, conflicts_with = "preset")]
        level: Option<i64>,
        #[arg(short, long)]
        preset: Option<MoodPreset>,
    },
    /// Show recent stress entries
    History {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Summarize your stress history and ask for personalized insights
    Insights {
        #[arg(short, long, default_value = "30")]
        limit: usize,
    },
    /// List narration voices
    Voices,
    /// Synthesize a line of narration to an mp3 file
    Speak {
        text: String,
        #[arg(long, default_value = "nova")]
        voice: Voice,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config to the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "respira", "respira")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "respira.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.offline).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_session_level() {
        let cli = Cli::try_parse_from(["respira", "session", "--level", "3", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Session { level: 3 }));
    }

    #[test]
    fn test_cli_parses_preset_and_voice() {
        let cli = Cli::try_parse_from(["respira", "--offline", "preset", "anxious"]).unwrap();
        assert!(cli.offline);
        assert!(matches!(
            cli.command,
            Commands::Preset {
                name: MoodPreset::Anxious
            }
        ));

        let cli = Cli::try_parse_from(["respira", "speak", "Hello", "--voice", "shimmer"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Speak {
                voice: Voice::Shimmer,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parses_insights_limit() {
        let cli = Cli::try_parse_from(["respira", "insights"]).unwrap();
        assert!(matches!(cli.command, Commands::Insights { limit: 30 }));
        let cli = Cli::try_parse_from(["respira", "insights", "-l", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Insights { limit: 7 }));
    }

    #[test]
    fn test_cli_rejects_unknown_preset() {
        assert!(Cli::try_parse_from(["respira", "preset", "grumpy"]).is_err());
        assert!(Cli::try_parse_from(["respira", "plan", "--level", "2", "--preset", "sad"]).is_err());
    }
}
