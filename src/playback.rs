//! Single-slot audio playback for reviewing recordings.
//!
//! At most one session exists at a time. Starting a new one stops the old one
//! first; playing the current record again toggles it off. Natural completion
//! is detected by a watcher task that posts [`PlaybackFinished`] to the owner's
//! channel, so the owner applies it on its own task.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use rodio::{Decoder, OutputStreamBuilder, Sink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PlaybackError;

/// An opened, initially paused, playback resource.
pub trait PlaybackHandle: Send + Sync {
    fn start(&self);
    fn is_finished(&self) -> bool;
    /// Stop and release the underlying resource.
    fn stop(&self);
}

pub trait AudioBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn PlaybackHandle>, PlaybackError>;
}

/// Natural end of playback for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackFinished {
    pub session: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Started { session: u64 },
    /// The record was already playing and has been stopped.
    Stopped,
}

struct ActiveSession {
    record_id: Uuid,
    session: u64,
    handle: Arc<dyn PlaybackHandle>,
    watcher: JoinHandle<()>,
}

pub struct PlaybackController {
    backend: Arc<dyn AudioBackend>,
    poll_interval: Duration,
    finished_tx: mpsc::UnboundedSender<PlaybackFinished>,
    active: Option<ActiveSession>,
    next_session: u64,
}

impl PlaybackController {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        poll_interval: Duration,
        finished_tx: mpsc::UnboundedSender<PlaybackFinished>,
    ) -> Self {
        Self {
            backend,
            poll_interval,
            finished_tx,
            active: None,
            next_session: 0,
        }
    }

    /// Record currently playing, if any.
    pub fn playing(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.record_id)
    }

    /// Toggle playback of `record_id`.
    ///
    /// If `path` cannot be opened the controller keeps whatever it was doing.
    pub async fn play(&mut self, record_id: Uuid, path: &Path) -> Result<PlayOutcome, PlaybackError> {
        if self.playing() == Some(record_id) {
            self.stop();
            return Ok(PlayOutcome::Stopped);
        }

        let backend = self.backend.clone();
        let owned_path = path.to_path_buf();
        let handle = tokio::task::spawn_blocking(move || backend.open(&owned_path))
            .await
            .map_err(|e| PlaybackError::Output(e.to_string()))??;

        self.stop();

        self.next_session += 1;
        let session = self.next_session;
        handle.start();

        let watcher = {
            let handle = handle.clone();
            let tx = self.finished_tx.clone();
            let poll = self.poll_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll);
                loop {
                    ticker.tick().await;
                    if handle.is_finished() {
                        let _ = tx.send(PlaybackFinished { session });
                        break;
                    }
                }
            })
        };

        info!("Playback started: {record_id} ({})", path.display());
        self.active = Some(ActiveSession {
            record_id,
            session,
            handle,
            watcher,
        });
        Ok(PlayOutcome::Started { session })
    }

    /// Stop any active session. Idempotent.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.watcher.abort();
            active.handle.stop();
            info!("Playback stopped: {}", active.record_id);
        }
    }

    /// Apply a finish signal. Returns the record that finished, or `None` if
    /// the signal belongs to a session that was already stopped or replaced.
    pub fn on_finished(&mut self, event: PlaybackFinished) -> Option<Uuid> {
        let is_current = self
            .active
            .as_ref()
            .is_some_and(|a| a.session == event.session);
        if !is_current {
            debug!("Discarding finish signal for stale session {}", event.session);
            return None;
        }

        let active = self.active.take()?;
        active.handle.stop();
        info!("Playback finished: {}", active.record_id);
        Some(active.record_id)
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
    }
}

// --- rodio backend ---

struct OpenRequest {
    path: PathBuf,
    reply: std_mpsc::Sender<Result<Sink, PlaybackError>>,
}

/// Plays files on the default output device.
///
/// The rodio output stream lives on a dedicated thread, started on first
/// use; each `open` hands back a paused `Sink` connected to its mixer.
#[derive(Default)]
pub struct RodioBackend {
    requests: Mutex<Option<std_mpsc::Sender<OpenRequest>>>,
}

impl RodioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self) -> Result<std_mpsc::Sender<OpenRequest>, PlaybackError> {
        let mut guard = self
            .requests
            .lock()
            .map_err(|_| PlaybackError::Output("audio thread lock poisoned".into()))?;
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = std_mpsc::channel::<OpenRequest>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), PlaybackError>>();
        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || audio_thread(rx, ready_tx))
            .map_err(|e| PlaybackError::Output(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| PlaybackError::Output("audio thread exited".into()))??;
        *guard = Some(tx.clone());
        Ok(tx)
    }
}

fn audio_thread(
    requests: std_mpsc::Receiver<OpenRequest>,
    ready: std_mpsc::Sender<Result<(), PlaybackError>>,
) {
    let stream = match OutputStreamBuilder::open_default_stream() {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to open audio output: {e}");
            let _ = ready.send(Err(PlaybackError::Output(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!("Audio output stream opened");

    while let Ok(request) = requests.recv() {
        let result = open_sink(&stream, &request.path);
        let _ = request.reply.send(result);
    }
}

fn open_sink(stream: &rodio::OutputStream, path: &Path) -> Result<Sink, PlaybackError> {
    let file_open = |reason: String| PlaybackError::FileOpen {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|e| file_open(e.to_string()))?;
    let source = Decoder::new(BufReader::new(file)).map_err(|e| file_open(e.to_string()))?;

    let sink = Sink::connect_new(stream.mixer());
    sink.pause();
    sink.append(source);
    Ok(sink)
}

impl AudioBackend for RodioBackend {
    fn open(&self, path: &Path) -> Result<Arc<dyn PlaybackHandle>, PlaybackError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.sender()?
            .send(OpenRequest {
                path: path.to_path_buf(),
                reply: reply_tx,
            })
            .map_err(|_| PlaybackError::Output("audio thread exited".into()))?;
        let sink = reply_rx
            .recv()
            .map_err(|_| PlaybackError::Output("audio thread exited".into()))??;
        let handle: Arc<dyn PlaybackHandle> = Arc::new(SinkHandle {
            sink: Mutex::new(sink),
        });
        Ok(handle)
    }
}

struct SinkHandle {
    sink: Mutex<Sink>,
}

impl PlaybackHandle for SinkHandle {
    fn start(&self) {
        if let Ok(sink) = self.sink.lock() {
            sink.play();
        }
    }

    fn is_finished(&self) -> bool {
        self.sink.lock().map(|sink| sink.empty()).unwrap_or(true)
    }

    fn stop(&self) {
        if let Ok(sink) = self.sink.lock() {
            sink.stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub(crate) struct FakeHandle {
        pub started: AtomicBool,
        pub finished: AtomicBool,
        pub stopped: AtomicBool,
    }

    impl PlaybackHandle for FakeHandle {
        fn start(&self) {
            self.started.store(true, Ordering::SeqCst);
        }

        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Opens any existing path; keeps every handle it hands out.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub opened: Mutex<Vec<(PathBuf, Arc<FakeHandle>)>>,
    }

    impl FakeBackend {
        pub(crate) fn handle(&self, index: usize) -> Arc<FakeHandle> {
            self.opened.lock().unwrap()[index].1.clone()
        }

        pub(crate) fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl AudioBackend for FakeBackend {
        fn open(&self, path: &Path) -> Result<Arc<dyn PlaybackHandle>, PlaybackError> {
            if !path.exists() {
                return Err(PlaybackError::FileOpen {
                    path: path.to_path_buf(),
                    reason: "No such file or directory".into(),
                });
            }
            let handle = Arc::new(FakeHandle::default());
            self.opened
                .lock()
                .unwrap()
                .push((path.to_path_buf(), handle.clone()));
            Ok(handle as Arc<dyn PlaybackHandle>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeBackend;
    use super::*;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        a: PathBuf,
        b: PathBuf,
        backend: Arc<FakeBackend>,
        controller: PlaybackController,
        finished_rx: mpsc::UnboundedReceiver<PlaybackFinished>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();
        let backend = Arc::new(FakeBackend::default());
        let (tx, finished_rx) = mpsc::unbounded_channel();
        let controller = PlaybackController::new(backend.clone(), Duration::from_millis(5), tx);
        Fixture {
            _dir: dir,
            a,
            b,
            backend,
            controller,
            finished_rx,
        }
    }

    #[tokio::test]
    async fn playing_same_record_twice_toggles_off() {
        let mut f = fixture();
        let x = Uuid::new_v4();

        let outcome = f.controller.play(x, &f.a).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Started { .. }));
        assert_eq!(f.controller.playing(), Some(x));
        assert!(f.backend.handle(0).started.load(Ordering::SeqCst));

        let outcome = f.controller.play(x, &f.a).await.unwrap();
        assert_eq!(outcome, PlayOutcome::Stopped);
        assert_eq!(f.controller.playing(), None);
        assert!(f.backend.handle(0).stopped.load(Ordering::SeqCst));
        assert_eq!(f.backend.open_count(), 1);
    }

    #[tokio::test]
    async fn playing_another_record_replaces_session() {
        let mut f = fixture();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());

        f.controller.play(x, &f.a).await.unwrap();
        f.controller.play(y, &f.b).await.unwrap();

        assert_eq!(f.controller.playing(), Some(y));
        assert!(f.backend.handle(0).stopped.load(Ordering::SeqCst));
        assert!(f.backend.handle(1).started.load(Ordering::SeqCst));
        assert!(!f.backend.handle(1).stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unopenable_file_leaves_state_untouched() {
        let mut f = fixture();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        f.controller.play(x, &f.a).await.unwrap();

        let err = f
            .controller
            .play(y, Path::new("/definitely/missing.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::FileOpen { .. }));
        assert_eq!(f.controller.playing(), Some(x));
        assert!(!f.backend.handle(0).stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn natural_completion_is_reported_once() {
        let mut f = fixture();
        let x = Uuid::new_v4();
        f.controller.play(x, &f.a).await.unwrap();

        f.backend.handle(0).finished.store(true, Ordering::SeqCst);
        let event = f.finished_rx.recv().await.unwrap();

        assert_eq!(f.controller.on_finished(event), Some(x));
        assert_eq!(f.controller.playing(), None);
        assert_eq!(f.controller.on_finished(event), None);
    }

    #[tokio::test]
    async fn finish_signal_after_stop_is_discarded() {
        let mut f = fixture();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let PlayOutcome::Started { session } = f.controller.play(x, &f.a).await.unwrap() else {
            panic!("expected playback to start");
        };
        f.controller.stop();
        assert_eq!(f.controller.on_finished(PlaybackFinished { session }), None);

        f.controller.play(y, &f.b).await.unwrap();
        assert_eq!(f.controller.on_finished(PlaybackFinished { session }), None);
        assert_eq!(f.controller.playing(), Some(y));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut f = fixture();
        f.controller.stop();
        f.controller.play(Uuid::new_v4(), &f.a).await.unwrap();
        f.controller.stop();
        f.controller.stop();
        assert_eq!(f.controller.playing(), None);
    }
}
