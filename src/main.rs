//! `chatvault` maintenance CLI.
//!
//! Every command prints JSON on stdout. Failures print an error payload on
//! stderr and exit with status 1.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use chatvault_lib::config::{load_config, load_config_from};
use chatvault_lib::merge::{display_name, merged_summary};
use chatvault_lib::{AppState, CoreConfig, CoreError, ErrorPayload};

#[derive(Parser)]
#[command(name = "chatvault")]
#[command(about = "Inspect and maintain the chat export store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to ~/.chatvault/config.json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the result of the startup integrity check
    Health,
    /// Delete the database files and start empty
    Reset {
        /// Only flag the reset; it is applied on next startup
        #[arg(long)]
        on_next_start: bool,
    },
    /// List imported exports
    Exports,
    /// Delete an export and everything imported from it
    DeleteExport { id: i64 },
    /// List chats, most recent first
    Chats,
    /// Show auto-merge suggestions
    Suggest {
        /// Include dismissed suggestions
        #[arg(long)]
        all: bool,
    },
    /// Merge chats into the first id given
    Merge {
        #[arg(required = true, num_args = 2..)]
        ids: Vec<i64>,
    },
    /// Apply every suggestion that has not been dismissed
    AutoMerge,
    /// Remove canonical conversations with no raw conversation left
    Cleanup,
    /// Dismiss a suggestion by key
    Ignore { key: String },
    /// Restore a dismissed suggestion
    Unignore { key: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SuggestionView {
    key: String,
    name: String,
    target: i64,
    members: Vec<i64>,
    ignored: bool,
    merged: chatvault_lib::merge::MergedChatSummary,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let payload = ErrorPayload::from(&e);
            match serde_json::to_string_pretty(&payload) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{e}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CoreError> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(dir) = cli.data_dir {
        config = CoreConfig {
            data_dir: dir,
            ..config
        };
    }

    let state = AppState::open(config)?;

    match cli.command {
        Commands::Health => print_json(&state.health()),
        Commands::Reset { on_next_start } => {
            if on_next_start {
                state.request_reset()?;
            } else {
                state.reset_database()?;
            }
            print_json(&state.health())
        }
        Commands::Exports => print_json(&state.exports()?),
        Commands::DeleteExport { id } => print_json(&state.delete_export(id)?),
        Commands::Chats => print_json(&state.chats()?),
        Commands::Suggest { all } => {
            let prefs = state.preferences();
            let suggestions = if all {
                state.merge_suggestions()?
            } else {
                state.actionable_merge_suggestions()?
            };
            let views: Vec<SuggestionView> = suggestions
                .iter()
                .map(|s| SuggestionView {
                    key: s.key.clone(),
                    name: display_name(&s.target),
                    target: s.target.id,
                    members: s.member_ids(),
                    ignored: prefs.is_ignored(&s.key),
                    merged: merged_summary(&s.chats),
                })
                .collect();
            print_json(&views)
        }
        Commands::Merge { ids } => print_json(&state.merge_conversations(&ids)?),
        Commands::AutoMerge => print_json(&state.apply_auto_merge()?),
        Commands::Cleanup => print_json(&serde_json::json!({ "removed": state.cleanup()? })),
        Commands::Ignore { key } => {
            state.ignore_suggestion(&key)?;
            print_json(&state.preferences().snapshot())
        }
        Commands::Unignore { key } => {
            state.unignore_suggestion(&key)?;
            print_json(&state.preferences().snapshot())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::validation(format!("Failed to serialize output: {e}")))?;
    println!("{json}");
    Ok(())
}
