//! Transcription history and batch selection.
//!
//! Records live in one JSON document that is always loaded and replaced
//! whole. Each record references a recording on disk; removing a record hands
//! its audio path back so the caller can clean it up best-effort.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::HistoryError;

/// One transcription with its recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub audio_path: PathBuf,
    /// Recording length in seconds.
    pub duration: f64,
}

impl TranscriptRecord {
    pub fn new(text: impl Into<String>, audio_path: impl Into<PathBuf>, duration: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            text: text.into(),
            audio_path: audio_path.into(),
            duration,
        }
    }
}

/// Records in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub history: Vec<TranscriptRecord>,
}

/// Whole-document persistence.
pub trait DocumentStore: Send {
    /// Current document; empty when nothing has been stored yet.
    fn load(&self) -> Result<HistoryDocument, HistoryError>;
    fn replace(&self, document: &HistoryDocument) -> Result<(), HistoryError>;
}

/// Stores the document as pretty JSON, swapping the file atomically.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl DocumentStore for JsonFileStore {
    fn load(&self) -> Result<HistoryDocument, HistoryError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(HistoryDocument::default()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HistoryDocument::default()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn replace(&self, document: &HistoryDocument) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!("Saved {} records to {}", document.history.len(), self.path.display());
        Ok(())
    }
}

/// Owns the record list and the selection set.
///
/// Not synchronized; the history service is its only owner.
pub struct HistoryStore {
    store: Box<dyn DocumentStore>,
    document: HistoryDocument,
    selection: HashSet<Uuid>,
    selection_mode: bool,
}

impl HistoryStore {
    pub fn load(store: Box<dyn DocumentStore>) -> Result<Self, HistoryError> {
        let document = store.load()?;
        info!("Loaded {} transcripts", document.history.len());
        Ok(Self {
            store,
            document,
            selection: HashSet::new(),
            selection_mode: false,
        })
    }

    pub fn records(&self) -> &[TranscriptRecord] {
        &self.document.history
    }

    pub fn get(&self, id: Uuid) -> Option<&TranscriptRecord> {
        self.document.history.iter().find(|r| r.id == id)
    }

    pub fn add(&mut self, record: TranscriptRecord) -> Result<(), HistoryError> {
        if self.get(record.id).is_some() {
            return Err(HistoryError::DuplicateId(record.id));
        }
        debug!("Adding transcript {}", record.id);
        self.document.history.push(record);
        self.persist();
        Ok(())
    }

    /// Remove one record. Returns its audio path, or `None` if it was absent.
    pub fn delete(&mut self, id: Uuid) -> Option<PathBuf> {
        let index = self.document.history.iter().position(|r| r.id == id)?;
        let record = self.document.history.remove(index);
        self.selection.remove(&id);
        self.persist();
        info!("Deleted transcript {id}");
        Some(record.audio_path)
    }

    /// Remove every record. Returns all audio paths.
    pub fn delete_all(&mut self) -> Vec<PathBuf> {
        let removed = std::mem::take(&mut self.document.history);
        self.selection.clear();
        self.persist();
        info!("Deleted all {} transcripts", removed.len());
        removed.into_iter().map(|r| r.audio_path).collect()
    }

    fn persist(&self) {
        if let Err(e) = self.store.replace(&self.document) {
            error!("Failed to save transcription history: {e}");
        }
    }

    // --- selection ---

    pub fn selection(&self) -> &HashSet<Uuid> {
        &self.selection
    }

    /// Leaving selection mode clears the selection; entering keeps it.
    pub fn toggle_selection_mode(&mut self) -> bool {
        self.selection_mode = !self.selection_mode;
        if !self.selection_mode {
            self.selection.clear();
        }
        self.selection_mode
    }

    /// Flip one record's membership. Unknown ids are ignored.
    pub fn toggle_selection(&mut self, id: Uuid) {
        if !self.selection.remove(&id) && self.get(id).is_some() {
            self.selection.insert(id);
        }
    }

    pub fn select_all(&mut self) {
        self.selection = self.document.history.iter().map(|r| r.id).collect();
    }

    pub fn deselect_all(&mut self) {
        self.selection.clear();
    }
}

/// Delete recordings, ignoring individual failures.
pub async fn remove_audio_files(paths: Vec<PathBuf>) {
    for path in paths {
        remove_audio_file(&path).await;
    }
}

async fn remove_audio_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed recording {}", path.display()),
        Err(e) => debug!("Could not remove recording {}: {e}", path.display()),
    }
}

/// Length of a WAV recording in seconds, read from its header.
pub fn recording_duration(path: &Path) -> Option<f64> {
    let reader = match hound::WavReader::open(path) {
        Ok(r) => r,
        Err(e) => {
            debug!("Cannot read WAV header of {}: {e}", path.display());
            return None;
        }
    };
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        let minutes = (seconds / 60.0) as u64;
        let secs = seconds % 60.0;
        if minutes < 60 {
            format!("{minutes}m {secs:.0}s")
        } else {
            format!("{}h {}m", minutes / 60, minutes % 60)
        }
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
