//! Summary workflow over selected transcripts.
//!
//! IDLE → GENERATING → SUCCEEDED | FAILED
//!
//! The orchestrator only tracks state and builds requests. The owner runs the
//! returned [`SummaryRequest`] against Ollama and feeds the outcome back via
//! [`SummaryOrchestrator::complete`]. Each request carries a generation
//! number so results that arrive after a dismiss are dropped.

use std::collections::HashSet;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::GeneratorError;
use crate::history::TranscriptRecord;

const PROMPT_HEADER: &str = "Please provide a concise summary of the following transcribed conversations. Focus on the key topics, decisions, and action items mentioned:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPhase {
    Idle,
    Generating,
    Succeeded,
    Failed,
}

impl std::fmt::Display for SummaryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Generating => write!(f, "GENERATING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryState {
    pub phase: SummaryPhase,
    pub prompt_source_ids: HashSet<Uuid>,
    pub text: Option<String>,
    pub error_message: Option<String>,
}

impl Default for SummaryState {
    fn default() -> Self {
        Self {
            phase: SummaryPhase::Idle,
            prompt_source_ids: HashSet::new(),
            text: None,
            error_message: None,
        }
    }
}

/// A completion the owner must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    pub generation: u64,
    pub prompt: String,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Default)]
pub struct SummaryOrchestrator {
    state: SummaryState,
    generation: u64,
}

impl SummaryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SummaryState {
        &self.state
    }

    /// Start a summary of `selection`.
    ///
    /// Returns `None` without touching state when the selection is empty,
    /// Ollama is disabled, or a summary is already being generated.
    pub fn generate(
        &mut self,
        selection: &HashSet<Uuid>,
        records: &[TranscriptRecord],
        settings: &Settings,
    ) -> Option<SummaryRequest> {
        if self.state.phase == SummaryPhase::Generating {
            debug!("Summary already generating, ignoring request");
            return None;
        }
        self.start(selection, records, settings)
    }

    /// Replace a finished summary with a fresh one.
    pub fn regenerate(
        &mut self,
        selection: &HashSet<Uuid>,
        records: &[TranscriptRecord],
        settings: &Settings,
    ) -> Option<SummaryRequest> {
        if !matches!(self.state.phase, SummaryPhase::Succeeded | SummaryPhase::Failed) {
            debug!("Nothing to regenerate in phase {}", self.state.phase);
            return None;
        }
        self.start(selection, records, settings)
    }

    fn start(
        &mut self,
        selection: &HashSet<Uuid>,
        records: &[TranscriptRecord],
        settings: &Settings,
    ) -> Option<SummaryRequest> {
        if selection.is_empty() || !settings.ollama_enabled {
            return None;
        }
        let prompt = build_prompt(selection, records)?;

        self.generation += 1;
        let previous = self.state.phase;
        self.state = SummaryState {
            phase: SummaryPhase::Generating,
            prompt_source_ids: selection.clone(),
            text: None,
            error_message: None,
        };
        info!(
            "Summary: {previous} → GENERATING ({} transcripts, model '{}')",
            selection.len(),
            settings.ollama_model
        );

        Some(SummaryRequest {
            generation: self.generation,
            prompt,
            model: settings.ollama_model.clone(),
            base_url: settings.ollama_base_url.clone(),
        })
    }

    /// Apply the outcome of request `generation`. Returns false if it was stale.
    pub fn complete(&mut self, generation: u64, result: Result<String, GeneratorError>) -> bool {
        if self.state.phase != SummaryPhase::Generating || generation != self.generation {
            debug!("Dropping stale summary result (generation {generation})");
            return false;
        }

        match result {
            Ok(text) => {
                info!("Summary: GENERATING → SUCCEEDED ({} chars)", text.len());
                self.state.phase = SummaryPhase::Succeeded;
                self.state.text = Some(text);
            }
            Err(e) => {
                info!("Summary: GENERATING → FAILED ({e})");
                self.state.phase = SummaryPhase::Failed;
                self.state.error_message = Some(e.to_string());
            }
        }
        true
    }

    /// Back to IDLE, discarding prompt, result and error.
    pub fn dismiss(&mut self) {
        if self.state.phase != SummaryPhase::Idle {
            info!("Summary: {} → IDLE", self.state.phase);
        }
        self.state = SummaryState::default();
    }
}

/// Build the summary prompt from the selected records, oldest first.
///
/// Returns `None` if no record matches the selection.
pub fn build_prompt(selection: &HashSet<Uuid>, records: &[TranscriptRecord]) -> Option<String> {
    let mut selected: Vec<&TranscriptRecord> =
        records.iter().filter(|r| selection.contains(&r.id)).collect();
    if selected.is_empty() {
        return None;
    }
    selected.sort_by_key(|r| r.timestamp);

    let combined = selected
        .iter()
        .map(|r| format!("[{}] {}", format_timestamp(r.timestamp), r.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    debug!("Combined transcript text: {} chars", combined.len());

    Some(format!("{PROMPT_HEADER}\n\n{combined}\n\nSummary:"))
}

/// Local time, e.g. `Jan 5, 2024 at 3:04 PM`.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%b %-d, %Y at %-I:%M %p")
        .to_string()
}
