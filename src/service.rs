//! History service: the single owner of history, selection, playback and
//! summary state.
//!
//! All mutations go through one task that receives commands over a channel,
//! so they are applied one at a time. Network calls run on spawned tasks and
//! report back through internal channels; the loop itself only waits to open
//! an audio file.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::availability::{AvailabilityMonitor, AvailabilitySnapshot};
use crate::config::{Config, Settings};
use crate::error::{GeneratorError, ServiceError};
use crate::generator::GeneratorClient;
use crate::history::{remove_audio_files, HistoryStore, TranscriptRecord};
use crate::playback::{AudioBackend, PlayOutcome, PlaybackController, PlaybackFinished};
use crate::summary::{SummaryOrchestrator, SummaryRequest, SummaryState};

/// Notifications for whoever presents the history.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    HistoryChanged,
    PlaybackFinished(Uuid),
    SummaryChanged(SummaryState),
    AvailabilityChanged(AvailabilitySnapshot),
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub settings: Settings,
    pub playback_poll_interval: Duration,
    /// Period of background availability checks, if any.
    pub availability_interval: Option<Duration>,
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        let secs = config.availability.check_interval_secs;
        Self {
            settings: config.settings(),
            playback_poll_interval: Duration::from_millis(config.playback.poll_interval_ms.max(1)),
            availability_interval: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Records(Reply<Vec<TranscriptRecord>>),
    Get(Uuid, Reply<Option<TranscriptRecord>>),
    Record {
        text: String,
        audio_path: PathBuf,
        duration: f64,
        reply: Reply<Result<Option<TranscriptRecord>, ServiceError>>,
    },
    Delete(Uuid, Reply<bool>),
    DeleteAll(Reply<usize>),
    SetHistoryEnabled(bool, Reply<usize>),
    Settings(Reply<Settings>),
    UpdateSettings(Settings, Reply<usize>),
    Play(Uuid, Reply<Result<PlayOutcome, ServiceError>>),
    StopPlayback(Reply<()>),
    Playing(Reply<Option<Uuid>>),
    ToggleSelectionMode(Reply<bool>),
    ToggleSelection(Uuid, Reply<()>),
    SelectAll(Reply<()>),
    DeselectAll(Reply<()>),
    Selection(Reply<HashSet<Uuid>>),
    GenerateSummary(Reply<bool>),
    RegenerateSummary(Reply<bool>),
    DismissSummary(Reply<()>),
    Summary(Reply<SummaryState>),
    Flush(Reply<()>),
}

struct SummaryDone {
    generation: u64,
    result: Result<String, GeneratorError>,
}

pub struct HistoryService {
    settings: Settings,
    store: HistoryStore,
    playback: PlaybackController,
    summary: SummaryOrchestrator,
    client: GeneratorClient,
    monitor: AvailabilityMonitor,
    events: broadcast::Sender<HistoryEvent>,
    commands: mpsc::Receiver<Command>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackFinished>,
    summary_tx: mpsc::UnboundedSender<SummaryDone>,
    summary_rx: mpsc::UnboundedReceiver<SummaryDone>,
    cleanup: JoinSet<()>,
    availability_interval: Option<Duration>,
}

impl HistoryService {
    /// Start the service task and return a handle to it.
    pub fn spawn(
        options: ServiceOptions,
        store: HistoryStore,
        backend: Arc<dyn AudioBackend>,
        client: GeneratorClient,
    ) -> HistoryHandle {
        let (command_tx, commands) = mpsc::channel(32);
        let (events, _) = broadcast::channel(64);
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (summary_tx, summary_rx) = mpsc::unbounded_channel();
        let monitor = AvailabilityMonitor::new(client.clone());

        let service = Self {
            settings: options.settings,
            store,
            playback: PlaybackController::new(backend, options.playback_poll_interval, playback_tx),
            summary: SummaryOrchestrator::new(),
            client,
            monitor: monitor.clone(),
            events: events.clone(),
            commands,
            playback_rx,
            summary_tx,
            summary_rx,
            cleanup: JoinSet::new(),
            availability_interval: options.availability_interval,
        };
        tokio::spawn(service.run());

        HistoryHandle {
            commands: command_tx,
            events,
            monitor,
        }
    }

    async fn run(mut self) {
        let mut availability_ticker = self.availability_interval.map(tokio::time::interval);
        info!("History service ready");

        loop {
            let tick = async {
                match availability_ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => {
                            info!("All handles dropped, history service stopping");
                            break;
                        }
                    }
                }
                Some(finished) = self.playback_rx.recv() => {
                    if let Some(id) = self.playback.on_finished(finished) {
                        self.emit(HistoryEvent::PlaybackFinished(id));
                    }
                }
                Some(done) = self.summary_rx.recv() => {
                    if self.summary.complete(done.generation, done.result) {
                        self.emit(HistoryEvent::SummaryChanged(self.summary.state().clone()));
                    }
                }
                Some(joined) = self.cleanup.join_next(), if !self.cleanup.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Recording cleanup task failed: {e}");
                    }
                }
                _ = tick => self.spawn_availability_check(),
            }
        }

        self.playback.stop();
        self.drain_cleanup().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Records(reply) => {
                let _ = reply.send(self.store.records().to_vec());
            }
            Command::Get(id, reply) => {
                let _ = reply.send(self.store.get(id).cloned());
            }
            Command::Record {
                text,
                audio_path,
                duration,
                reply,
            } => {
                let _ = reply.send(self.record(text, audio_path, duration));
            }
            Command::Delete(id, reply) => {
                let _ = reply.send(self.delete(id));
            }
            Command::DeleteAll(reply) => {
                let _ = reply.send(self.delete_all());
            }
            Command::SetHistoryEnabled(enabled, reply) => {
                self.settings.save_transcription_history = enabled;
                let purged = if enabled {
                    0
                } else {
                    warn!("Transcription history disabled, deleting existing history");
                    self.delete_all()
                };
                let _ = reply.send(purged);
            }
            Command::Settings(reply) => {
                let _ = reply.send(self.settings.clone());
            }
            Command::UpdateSettings(settings, reply) => {
                let _ = reply.send(self.update_settings(settings));
            }
            Command::Play(id, reply) => {
                let _ = reply.send(self.play(id).await);
            }
            Command::StopPlayback(reply) => {
                self.playback.stop();
                let _ = reply.send(());
            }
            Command::Playing(reply) => {
                let _ = reply.send(self.playback.playing());
            }
            Command::ToggleSelectionMode(reply) => {
                let _ = reply.send(self.store.toggle_selection_mode());
            }
            Command::ToggleSelection(id, reply) => {
                self.store.toggle_selection(id);
                let _ = reply.send(());
            }
            Command::SelectAll(reply) => {
                self.store.select_all();
                let _ = reply.send(());
            }
            Command::DeselectAll(reply) => {
                self.store.deselect_all();
                let _ = reply.send(());
            }
            Command::Selection(reply) => {
                let _ = reply.send(self.store.selection().clone());
            }
            Command::GenerateSummary(reply) => {
                let request =
                    self.summary
                        .generate(self.store.selection(), self.store.records(), &self.settings);
                let _ = reply.send(self.start_summary(request));
            }
            Command::RegenerateSummary(reply) => {
                let request =
                    self.summary
                        .regenerate(self.store.selection(), self.store.records(), &self.settings);
                let _ = reply.send(self.start_summary(request));
            }
            Command::DismissSummary(reply) => {
                self.summary.dismiss();
                self.emit(HistoryEvent::SummaryChanged(self.summary.state().clone()));
                let _ = reply.send(());
            }
            Command::Summary(reply) => {
                let _ = reply.send(self.summary.state().clone());
            }
            Command::Flush(reply) => {
                self.drain_cleanup().await;
                let _ = reply.send(());
            }
        }
    }

    fn record(
        &mut self,
        text: String,
        audio_path: PathBuf,
        duration: f64,
    ) -> Result<Option<TranscriptRecord>, ServiceError> {
        if !self.settings.save_transcription_history {
            debug!("History disabled, discarding recording {}", audio_path.display());
            self.cleanup.spawn(remove_audio_files(vec![audio_path]));
            return Ok(None);
        }

        let record = TranscriptRecord::new(text, audio_path, duration);
        self.store.add(record.clone())?;
        self.emit(HistoryEvent::HistoryChanged);
        Ok(Some(record))
    }

    fn delete(&mut self, id: Uuid) -> bool {
        if self.playback.playing() == Some(id) {
            self.playback.stop();
        }
        let Some(audio_path) = self.store.delete(id) else {
            return false;
        };
        self.cleanup.spawn(remove_audio_files(vec![audio_path]));
        self.emit(HistoryEvent::HistoryChanged);
        true
    }

    fn delete_all(&mut self) -> usize {
        self.playback.stop();
        let paths = self.store.delete_all();
        let count = paths.len();
        self.cleanup.spawn(remove_audio_files(paths));
        self.emit(HistoryEvent::HistoryChanged);
        count
    }

    /// Swap the settings snapshot. Turning history off purges it; returns the
    /// number of records removed.
    fn update_settings(&mut self, settings: Settings) -> usize {
        let purge = self.settings.save_transcription_history && !settings.save_transcription_history;
        self.settings = settings;
        if purge {
            warn!("Transcription history disabled, deleting existing history");
            self.delete_all()
        } else {
            0
        }
    }

    async fn play(&mut self, id: Uuid) -> Result<PlayOutcome, ServiceError> {
        let path = self
            .store
            .get(id)
            .map(|r| r.audio_path.clone())
            .ok_or(ServiceError::NotFound(id))?;
        Ok(self.playback.play(id, &path).await?)
    }

    fn start_summary(&mut self, request: Option<SummaryRequest>) -> bool {
        let Some(request) = request else {
            return false;
        };
        self.emit(HistoryEvent::SummaryChanged(self.summary.state().clone()));

        let client = self.client.clone();
        let done = self.summary_tx.clone();
        tokio::spawn(async move {
            let result = client
                .complete(&request.prompt, &request.model, &request.base_url)
                .await;
            if let Err(e) = &result {
                warn!("Summary generation failed: {e}");
            }
            let _ = done.send(SummaryDone {
                generation: request.generation,
                result,
            });
        });
        true
    }

    /// Wait for every pending recording deletion.
    async fn drain_cleanup(&mut self) {
        if !self.cleanup.is_empty() {
            debug!("Waiting for {} recording cleanups", self.cleanup.len());
        }
        while let Some(joined) = self.cleanup.join_next().await {
            if let Err(e) = joined {
                warn!("Recording cleanup task failed: {e}");
            }
        }
    }

    fn spawn_availability_check(&self) {
        let monitor = self.monitor.clone();
        let events = self.events.clone();
        let base_url = self.settings.ollama_base_url.clone();
        tokio::spawn(async move {
            monitor.check_availability(&base_url).await;
            let _ = events.send(HistoryEvent::AvailabilityChanged(monitor.snapshot()));
        });
    }

    fn emit(&self, event: HistoryEvent) {
        let _ = self.events.send(event);
    }
}

/// Cloneable front door to the [`HistoryService`].
#[derive(Clone)]
pub struct HistoryHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<HistoryEvent>,
    monitor: AvailabilityMonitor,
}

impl HistoryHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    pub async fn records(&self) -> Result<Vec<TranscriptRecord>, ServiceError> {
        self.request(Command::Records).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TranscriptRecord>, ServiceError> {
        self.request(|reply| Command::Get(id, reply)).await
    }

    /// Store a finished transcription. Returns `None` when history is turned
    /// off, in which case the recording is deleted.
    pub async fn record(
        &self,
        text: impl Into<String>,
        audio_path: impl Into<PathBuf>,
        duration: f64,
    ) -> Result<Option<TranscriptRecord>, ServiceError> {
        let (text, audio_path) = (text.into(), audio_path.into());
        self.request(|reply| Command::Record {
            text,
            audio_path,
            duration,
            reply,
        })
        .await?
    }

    /// Delete one transcript and its recording. False if it did not exist.
    pub async fn delete(&self, id: Uuid) -> Result<bool, ServiceError> {
        self.request(|reply| Command::Delete(id, reply)).await
    }

    /// Delete every transcript and recording. Returns how many were removed.
    pub async fn delete_all(&self) -> Result<usize, ServiceError> {
        self.request(Command::DeleteAll).await
    }

    /// Turn history retention on or off.
    ///
    /// Turning it off permanently deletes all existing transcripts and their
    /// recordings, not just future ones. Returns how many were removed.
    pub async fn set_history_enabled(&self, enabled: bool) -> Result<usize, ServiceError> {
        self.request(|reply| Command::SetHistoryEnabled(enabled, reply))
            .await
    }

    pub async fn settings(&self) -> Result<Settings, ServiceError> {
        self.request(Command::Settings).await
    }

    /// Replace the settings snapshot. Switching history retention off purges
    /// it like [`HistoryHandle::set_history_enabled`].
    pub async fn update_settings(&self, settings: Settings) -> Result<usize, ServiceError> {
        self.request(|reply| Command::UpdateSettings(settings, reply))
            .await
    }

    /// Toggle playback of a transcript's recording.
    pub async fn play(&self, id: Uuid) -> Result<PlayOutcome, ServiceError> {
        self.request(|reply| Command::Play(id, reply)).await?
    }

    pub async fn stop_playback(&self) -> Result<(), ServiceError> {
        self.request(Command::StopPlayback).await
    }

    pub async fn playing(&self) -> Result<Option<Uuid>, ServiceError> {
        self.request(Command::Playing).await
    }

    pub async fn toggle_selection_mode(&self) -> Result<bool, ServiceError> {
        self.request(Command::ToggleSelectionMode).await
    }

    pub async fn toggle_selection(&self, id: Uuid) -> Result<(), ServiceError> {
        self.request(|reply| Command::ToggleSelection(id, reply))
            .await
    }

    pub async fn select_all(&self) -> Result<(), ServiceError> {
        self.request(Command::SelectAll).await
    }

    pub async fn deselect_all(&self) -> Result<(), ServiceError> {
        self.request(Command::DeselectAll).await
    }

    pub async fn selection(&self) -> Result<HashSet<Uuid>, ServiceError> {
        self.request(Command::Selection).await
    }

    /// Start summarizing the selection. False if nothing was started.
    pub async fn generate_summary(&self) -> Result<bool, ServiceError> {
        self.request(Command::GenerateSummary).await
    }

    pub async fn regenerate_summary(&self) -> Result<bool, ServiceError> {
        self.request(Command::RegenerateSummary).await
    }

    pub async fn dismiss_summary(&self) -> Result<(), ServiceError> {
        self.request(Command::DismissSummary).await
    }

    pub async fn summary(&self) -> Result<SummaryState, ServiceError> {
        self.request(Command::Summary).await
    }

    /// Wait until recordings of already deleted transcripts are gone from
    /// disk. Call before the runtime shuts down.
    pub async fn flush(&self) -> Result<(), ServiceError> {
        self.request(Command::Flush).await
    }

    /// Probe Ollama now, refreshing the model list when it answers.
    pub async fn check_availability(&self) -> Result<bool, ServiceError> {
        let settings = self.settings().await?;
        let available = self
            .monitor
            .check_availability(&settings.ollama_base_url)
            .await;
        let _ = self
            .events
            .send(HistoryEvent::AvailabilityChanged(self.monitor.snapshot()));
        Ok(available)
    }

    pub fn availability(&self) -> AvailabilitySnapshot {
        self.monitor.snapshot()
    }

    /// Put a transcript's text on the system clipboard.
    pub async fn copy_to_clipboard(&self, id: Uuid) -> Result<(), ServiceError> {
        let record = self.get(id).await?.ok_or(ServiceError::NotFound(id))?;
        tokio::task::spawn_blocking(move || {
            let mut clipboard = arboard::Clipboard::new()
                .map_err(|e| ServiceError::Clipboard(format!("Failed to open clipboard: {e}")))?;
            clipboard
                .set_text(record.text)
                .map_err(|e| ServiceError::Clipboard(format!("Failed to set clipboard: {e}")))
        })
        .await
        .map_err(|e| ServiceError::Clipboard(e.to_string()))?
    }
}
