//! whisper-history-rs: transcription history, playback and Ollama summaries.

mod availability;
mod config;
mod error;
mod generator;
mod history;
mod notifier;
mod playback;
mod service;
mod summary;

use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::generator::GeneratorClient;
use crate::history::{format_duration, recording_duration, truncate, HistoryStore, JsonFileStore};
use crate::playback::{PlayOutcome, RodioBackend};
use crate::service::{HistoryEvent, HistoryHandle, HistoryService, ServiceOptions};
use crate::summary::{format_timestamp, SummaryPhase, SummaryState};

#[derive(Parser, Debug)]
#[command(name = "whisper-history-rs", about = "Transcription history and summaries")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored transcripts, oldest first
    List,
    /// Add a finished transcription with its recording
    Add {
        audio: PathBuf,
        #[arg(short, long)]
        text: String,
        /// Recording length in seconds (read from the WAV header if omitted)
        #[arg(short, long)]
        duration: Option<f64>,
    },
    /// Delete a transcript and its recording
    Delete { id: Uuid },
    /// Delete every transcript and recording
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Play a transcript's recording until it ends (Ctrl+C stops)
    Play { id: Uuid },
    /// Summarize transcripts with Ollama
    Summarize {
        /// Summarize every transcript
        #[arg(long)]
        all: bool,
        /// Regenerate up to this many times after a failure
        #[arg(long, default_value_t = 0)]
        retries: u32,
        /// Use this model instead of ollama.model
        #[arg(short, long)]
        model: Option<String>,
        ids: Vec<Uuid>,
    },
    /// Show Ollama availability and installed models
    Models,
    /// Keep running and report Ollama availability as it changes
    Watch,
    /// Copy a transcript's text to the clipboard
    Copy { id: Uuid },
    /// Turn history retention on or off (off deletes existing history)
    History {
        state: Toggle,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug,reqwest=info,hyper_util=info")
    } else {
        EnvFilter::new("warn,whisper_history_rs=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::Config::load(args.config.as_deref());
    let history_path = config.history.resolved_path();
    info!("History file: {}", history_path.display());

    let store = HistoryStore::load(Box::new(JsonFileStore::new(history_path)))?;
    let mut options = ServiceOptions::from_config(&config);
    if !matches!(args.command, Command::Watch) {
        options.availability_interval = None;
    }
    let handle = HistoryService::spawn(
        options,
        store,
        Arc::new(RodioBackend::new()),
        GeneratorClient::new(),
    );
    let notifier = notifier::Notifier::new(config.feedback.notifications);

    let result = run(&handle, &notifier, args.command).await;
    handle.flush().await?;
    result
}

async fn run(
    handle: &HistoryHandle,
    notifier: &notifier::Notifier,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::List => list(handle).await?,
        Command::Add {
            audio,
            text,
            duration,
        } => {
            let duration = duration
                .or_else(|| recording_duration(&audio))
                .unwrap_or(0.0);
            match handle.record(text, audio, duration).await? {
                Some(record) => println!("{}", record.id),
                None => println!("History is turned off; recording discarded."),
            }
        }
        Command::Delete { id } => {
            if !handle.delete(id).await? {
                println!("No transcript {id}");
            }
        }
        Command::Clear { yes } => {
            if !yes {
                println!("This deletes every transcript and recording. Re-run with --yes.");
                return Ok(());
            }
            let count = handle.delete_all().await?;
            println!("Deleted {count} transcripts.");
        }
        Command::Play { id } => play(handle, id).await?,
        Command::Summarize {
            all,
            retries,
            model,
            ids,
        } => summarize(handle, notifier, all, retries, model, ids).await?,
        Command::Watch => watch(handle).await?,
        Command::Models => {
            let available = handle.check_availability().await?;
            let settings = handle.settings().await?;
            if !available {
                println!("Ollama is not reachable at {}", settings.ollama_base_url);
                return Ok(());
            }
            println!("Ollama at {} (model: {})", settings.ollama_base_url, settings.ollama_model);
            for model in handle.availability().models {
                let marker = if model.name == settings.ollama_model { "*" } else { " " };
                println!(
                    "{marker} {:<30} {:>8.1} MB  {}",
                    model.name,
                    model.size_bytes as f64 / 1_000_000.0,
                    model.modified_at
                );
            }
        }
        Command::Copy { id } => {
            handle.copy_to_clipboard(id).await?;
            println!("Copied.");
        }
        Command::History { state, yes } => match state {
            Toggle::On => {
                handle.set_history_enabled(true).await?;
                println!("History enabled for this session; set history.save_transcription_history in config.yaml to keep it.");
            }
            Toggle::Off => {
                if !yes {
                    println!("Turning history off permanently deletes all existing transcripts and recordings. Re-run with --yes.");
                    return Ok(());
                }
                let count = handle.set_history_enabled(false).await?;
                println!("History disabled for this session; deleted {count} transcripts. Set history.save_transcription_history: false in config.yaml to keep it off.");
            }
        },
    }

    Ok(())
}

async fn list(handle: &HistoryHandle) -> Result<(), Box<dyn std::error::Error>> {
    let records = handle.records().await?;
    if records.is_empty() {
        println!("No transcriptions recorded.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  {:>7}  {}",
            record.id,
            format_timestamp(record.timestamp),
            format_duration(record.duration),
            truncate(&record.text, 60)
        );
    }
    Ok(())
}

async fn play(handle: &HistoryHandle, id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = handle.subscribe();
    if handle.play(id).await? == PlayOutcome::Stopped {
        return Ok(());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(HistoryEvent::PlaybackFinished(finished)) if finished == id => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if handle.playing().await? == Some(id) {
                    handle.stop_playback().await?;
                }
                break;
            }
        }
    }
    Ok(())
}

async fn summarize(
    handle: &HistoryHandle,
    notifier: &notifier::Notifier,
    all: bool,
    retries: u32,
    model: Option<String>,
    ids: Vec<Uuid>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = handle.settings().await?;
    if !settings.ollama_enabled {
        println!("Ollama is disabled. Set ollama.enabled: true in config.yaml.");
        return Ok(());
    }
    if let Some(model) = model {
        settings.ollama_model = model;
        handle.update_settings(settings.clone()).await?;
    }

    if all {
        handle.select_all().await?;
    } else {
        handle.toggle_selection_mode().await?;
        handle.deselect_all().await?;
        let ids: HashSet<Uuid> = ids.into_iter().collect();
        for &id in &ids {
            handle.toggle_selection(id).await?;
        }
        let selection = handle.selection().await?;
        for id in ids.difference(&selection) {
            warn!("No transcript {id}, skipping");
        }
    }

    let mut events = handle.subscribe();
    if !handle.generate_summary().await? {
        println!("Nothing to summarize. Pass transcript ids or --all.");
        return Ok(());
    }
    println!("Summarizing with {}...", settings.ollama_model);

    let mut state = wait_for_summary(&mut events).await;
    for attempt in 1..=retries {
        if state.phase != SummaryPhase::Failed {
            break;
        }
        warn!(
            "Summary failed ({}), retrying {attempt}/{retries}",
            state.error_message.as_deref().unwrap_or_default()
        );
        if !handle.regenerate_summary().await? {
            break;
        }
        state = wait_for_summary(&mut events).await;
    }
    notifier.summary_finished(&state);
    match state.phase {
        SummaryPhase::Succeeded => println!("\n{}", state.text.unwrap_or_default()),
        SummaryPhase::Failed => {
            eprintln!("{}", state.error_message.unwrap_or_default());
        }
        SummaryPhase::Idle | SummaryPhase::Generating => {}
    }
    handle.dismiss_summary().await?;
    Ok(())
}

async fn watch(handle: &HistoryHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = handle.subscribe();
    let mut last: Option<(bool, usize)> = None;
    println!("Watching Ollama availability (Ctrl+C to stop)");
    handle.check_availability().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(HistoryEvent::AvailabilityChanged(snapshot)) => {
                    let current = (snapshot.available, snapshot.models.len());
                    if last != Some(current) {
                        if snapshot.available {
                            println!("Ollama available, {} models installed", current.1);
                        } else {
                            println!("Ollama unavailable");
                        }
                        last = Some(current);
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn wait_for_summary(events: &mut broadcast::Receiver<HistoryEvent>) -> SummaryState {
    loop {
        match events.recv().await {
            Ok(HistoryEvent::SummaryChanged(state))
                if matches!(state.phase, SummaryPhase::Succeeded | SummaryPhase::Failed) =>
            {
                return state;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return SummaryState::default(),
        }
    }
}
