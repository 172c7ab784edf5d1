//! Recording session controller.
//!
//! A [`Recorder`] owns everything one recording needs between `start()` and
//! the end of `finish()`: the arenas, the slot pool, the copy worker and
//! the disk writer. Between sessions it only holds the configuration, the
//! arena provider, the storage and the frame processor, which is handed
//! back by the worker thread and reused.
//!
//! ```text
//!   Idle ──start()──► Preparing ──► (PreRecording ──trigger()──►) Recording
//!    ▲                                                               │
//!    └────────────── Finishing ◄── stop() / buffer full / card full ─┘
//! ```

use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use crate::format::RecordingFormat;
use crate::memory::{ArenaProvider, ArenaSet, FrameGuess, SlotPool, guess_frames};
use crate::observability::{RecordingMetrics, span_recording, trace_state_change};
use crate::pipeline::{
    CaptureOutcome, CaptureTrigger, ChunkInfo, ChunkedOutput, Compressor, CopyWorker,
    CpuTransferEngine, DiagnosticsReport, DiskWriter, FrameProcessor, PendingWriteQueue,
    RawFrame, RleCompressor, Shared, StopReason, Throttle, TransferEngine, WorkerMessage,
    WriterOutcome,
};
use crate::storage::Storage;
use kanal::Sender;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::Span;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    /// No session resources held.
    Idle,
    /// Allocating and opening.
    Preparing,
    /// Buffering frames until [`Recorder::trigger`].
    PreRecording,
    /// Capturing and writing.
    Recording,
    /// Draining and closing.
    Finishing,
}

impl RecordingState {
    /// Name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Preparing => "preparing",
            RecordingState::PreRecording => "pre-recording",
            RecordingState::Recording => "recording",
            RecordingState::Finishing => "finishing",
        }
    }

    /// Whether frames are accepted.
    pub fn is_capturing(self) -> bool {
        matches!(self, RecordingState::PreRecording | RecordingState::Recording)
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished recording.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Frames written to storage.
    pub frames_written: u64,
    /// Bytes written, headers included.
    pub bytes_written: u64,
    /// Output files, in order. Empty when nothing was written.
    pub chunks: Vec<ChunkInfo>,
    /// Why recording ended.
    pub stop_reason: StopReason,
    /// Recording ran out of buffer while the writer was still catching up
    /// with bursts of more than two frames.
    pub early_stop: bool,
    /// Per-frame faults and drops.
    pub diagnostics: DiagnosticsReport,
    /// Frames accepted by the capture trigger.
    pub frames_captured: u32,
    /// Measured write speed in bytes per second.
    pub write_speed: Option<f64>,
    /// Time spent writing.
    pub writing_time: Duration,
    /// Time the writer spent between bursts.
    pub idle_time: Duration,
}

struct Session {
    shared: Arc<Shared>,
    arenas: Arc<ArenaSet>,
    trigger: CaptureTrigger,
    worker_tx: Sender<WorkerMessage>,
    worker: Option<JoinHandle<FrameProcessor>>,
    writer: Option<JoinHandle<WriterOutcome>>,
    span: Span,
}

/// Records frames from a sensor into chunked files.
///
/// # Example
///
/// ```rust
/// use rawrec::prelude::*;
///
/// let geometry = FrameGeometry::full_sensor(64, 16, 8);
/// let config = RecorderConfig::new("/card/M00-0000.RVF", geometry, 25.0);
/// let storage = MemoryStorage::new();
/// let provider = HeapArenaProvider::new(vec![64 * 1024]);
///
/// let mut recorder = Recorder::new(config, provider, storage.clone());
/// recorder.start().unwrap();
/// let sensor = vec![0x10u8; geometry.sensor_buffer_size()];
/// for _ in 0..4 {
///     recorder.on_frame(RawFrame::new(sensor.clone(), geometry).unwrap()).unwrap();
///     std::thread::sleep(std::time::Duration::from_millis(5));
/// }
/// let report = recorder.stop().unwrap();
/// assert_eq!(report.frames_written, 3);
/// ```
pub struct Recorder {
    config: RecorderConfig,
    provider: Box<dyn ArenaProvider>,
    storage: Arc<dyn Storage>,
    engine: Option<Box<dyn TransferEngine>>,
    compressor: Option<Box<dyn Compressor>>,
    metrics: RecordingMetrics,
    name: String,
    state: RecordingState,
    session: Option<Session>,
    guess: Option<FrameGuess>,
    measured_speed: Option<f64>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Create an idle recorder.
    pub fn new(
        config: RecorderConfig,
        provider: impl ArenaProvider + 'static,
        storage: impl Storage + 'static,
    ) -> Self {
        let name = config
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string());
        Self {
            metrics: RecordingMetrics::new(&name),
            name,
            config,
            provider: Box::new(provider),
            storage: Arc::new(storage),
            engine: None,
            compressor: None,
            state: RecordingState::Idle,
            session: None,
            guess: None,
            measured_speed: None,
        }
    }

    /// Use `engine` for uncompressed frames instead of the CPU copy.
    pub fn with_transfer_engine(mut self, engine: Box<dyn TransferEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Use `compressor` for compressed recordings.
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Current state.
    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Session configuration.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Frame count estimate made at the last `start()`, when a write speed
    /// was known.
    pub fn guess(&self) -> Option<FrameGuess> {
        self.guess
    }

    /// Write speed measured by the last finished session.
    pub fn measured_speed(&self) -> Option<f64> {
        self.measured_speed
    }

    /// Allocate the buffer, open the output and start the background
    /// threads.
    pub fn start(&mut self) -> Result<()> {
        if self.state != RecordingState::Idle {
            return Err(Error::InvalidState(format!(
                "cannot start while {}",
                self.state
            )));
        }
        self.set_state(RecordingState::Preparing);

        let session = match self.prepare() {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "recording could not start");
                self.set_state(RecordingState::Idle);
                return Err(e);
            }
        };
        let next = if session.trigger.is_pre_rolling() {
            RecordingState::PreRecording
        } else {
            RecordingState::Recording
        };
        self.session = Some(session);
        self.set_state(next);
        Ok(())
    }

    fn prepare(&mut self) -> Result<Session> {
        self.config.validate()?;
        let arenas = Arc::new(ArenaSet::new(self.provider.allocate()?));
        match self.build(&arenas) {
            Ok(session) => Ok(session),
            Err(e) => {
                self.release_arenas(arenas);
                Err(e)
            }
        }
    }

    fn build(&mut self, arenas: &Arc<ArenaSet>) -> Result<Session> {
        let span = span_recording(&self.name);
        let _guard = span.enter();
        let fps = self.config.fps;
        let compressed = self.config.compression.is_enabled();

        let pool = SlotPool::initialize(
            &arenas.regions(),
            self.config.layout,
            self.config.frame_size(),
        )?;
        let slot_size = pool.slot_size();
        tracing::info!(
            slots = pool.len(),
            slot_size,
            arenas = arenas.len(),
            memory = arenas.total_size(),
            "frame buffer ready"
        );

        let speed = self.measured_speed.or(self.config.throttle.initial_speed);
        self.guess = guess_frames(pool.arena_table(), slot_size, fps, speed);
        if let Some(guess) = &self.guess {
            tracing::info!(%guess, "recording length estimate");
        }

        let pre_roll_budget = self
            .config
            .pre_roll
            .map(|p| p.frame_budget(fps, pool.free_count(), slot_size))
            .filter(|&budget| {
                if budget == 0 {
                    tracing::warn!("no room for pre-roll frames, recording right away");
                }
                budget > 0
            });
        if let Some(budget) = pre_roll_budget {
            tracing::info!(frames = budget, "pre-recording");
        }

        let format = RecordingFormat::new(&self.config);
        let output = ChunkedOutput::open(
            Arc::clone(&self.storage),
            self.config.output.clone(),
            format.clone(),
            self.config.max_chunk_size,
            self.config.chunk_limit_known,
        )?
        .with_metrics(self.metrics.clone());

        let queue = PendingWriteQueue::new(pool.len() + 1);
        self.metrics.record_free_slots(pool.free_count());
        let shared = Arc::new(Shared::new(
            pool,
            queue,
            Arc::clone(arenas),
            format,
            self.metrics.clone(),
        ));

        let (worker_tx, worker_rx) = kanal::bounded(self.config.worker_queue_depth);
        let processor = if compressed {
            FrameProcessor::Compress(
                self.compressor
                    .take()
                    .unwrap_or_else(|| Box::new(RleCompressor::new()) as Box<dyn Compressor>),
            )
        } else {
            let engine: Box<dyn TransferEngine> = match self.engine.take() {
                Some(engine) => engine,
                None => match CpuTransferEngine::new() {
                    Ok(engine) => Box::new(engine),
                    Err(e) => {
                        self.remove_output();
                        return Err(e);
                    }
                },
            };
            FrameProcessor::Transfer(engine)
        };
        let worker = CopyWorker::new(
            Arc::clone(&shared),
            worker_rx,
            processor,
            self.config.transfer_timeout,
        );
        let worker = match worker.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.remove_output();
                return Err(e);
            }
        };

        let writer = DiskWriter::new(
            Arc::clone(&shared),
            output,
            Throttle::new(self.config.throttle, fps),
            self.config.poll_interval,
            compressed,
        );
        let writer = match writer.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                let _ = worker_tx.send(WorkerMessage::Shutdown);
                if let Ok(processor) = worker.join() {
                    self.restore_processor(processor);
                }
                self.remove_output();
                return Err(e);
            }
        };

        let trigger = CaptureTrigger::new(
            Arc::clone(&shared),
            worker_tx.clone(),
            compressed,
            pre_roll_budget,
        );
        drop(_guard);

        Ok(Session {
            shared,
            arenas: Arc::clone(arenas),
            trigger,
            worker_tx,
            worker: Some(worker),
            writer: Some(writer),
            span,
        })
    }

    /// Hand one sensor frame to the capture trigger.
    ///
    /// Never blocks. A frame that cannot be buffered ends the recording;
    /// call [`poll_finished`](Self::poll_finished) or [`stop`](Self::stop)
    /// to collect the report.
    pub fn on_frame(&mut self, frame: RawFrame) -> Result<CaptureOutcome> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::InvalidState("no recording in progress".into()));
        };
        if !self.state.is_capturing() {
            return Ok(CaptureOutcome::Stopped);
        }
        let outcome = {
            let _guard = session.span.enter();
            session.trigger.on_frame(frame)
        };
        if matches!(outcome, CaptureOutcome::BufferFull | CaptureOutcome::Stopped) {
            self.set_state(RecordingState::Finishing);
        }
        Ok(outcome)
    }

    /// Promote the pre-roll buffer: queue every buffered frame and start
    /// recording. Returns the number of frames promoted.
    pub fn trigger(&mut self) -> Result<u32> {
        if self.state != RecordingState::PreRecording {
            return Err(Error::InvalidState(format!(
                "cannot trigger while {}",
                self.state
            )));
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no recording in progress".into()))?;
        let promoted = {
            let _guard = session.span.enter();
            session.trigger.promote_preroll()?
        };
        self.set_state(RecordingState::Recording);
        Ok(promoted)
    }

    /// Stop recording, write everything buffered and close the output.
    pub fn stop(&mut self) -> Result<SessionReport> {
        let Some(session) = self.session.as_ref() else {
            return Err(Error::InvalidState("no recording in progress".into()));
        };
        session.shared.request_stop(StopReason::Requested);
        self.finish()
    }

    /// Finish the session if it ended on its own (buffer full, storage
    /// full, failure).
    pub fn poll_finished(&mut self) -> Result<Option<SessionReport>> {
        let Some(session) = self.session.as_ref() else {
            return Ok(None);
        };
        let writer_done = session.writer.as_ref().is_none_or(|h| h.is_finished());
        if session.shared.stop_requested() || writer_done {
            return self.finish().map(Some);
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<SessionReport> {
        let Some(session) = self.session.take() else {
            return Err(Error::InvalidState("no recording in progress".into()));
        };
        self.set_state(RecordingState::Finishing);
        let Session {
            shared,
            arenas,
            trigger,
            worker_tx,
            worker,
            writer,
            span,
        } = session;
        let _guard = span.enter();

        shared.request_stop(StopReason::Requested);
        let frames_captured = trigger.next_frame() - 1;
        drop(trigger);

        let _ = worker_tx.send(WorkerMessage::Shutdown);
        drop(worker_tx);
        match worker.map(JoinHandle::join) {
            Some(Ok(processor)) => self.restore_processor(processor),
            Some(Err(_)) => tracing::error!("copy worker panicked"),
            None => {}
        }

        shared.draining.store(true, Ordering::Release);
        shared.queue.set_flushing(true);
        let outcome = match writer.map(JoinHandle::join) {
            Some(Ok(outcome)) => Some(outcome),
            _ => {
                tracing::error!("disk writer panicked");
                None
            }
        };

        let stop_reason = shared.stop_reason().unwrap_or(StopReason::Requested);
        let diagnostics = shared.diagnostics().report();
        let mut result = Ok(());
        let mut report = SessionReport {
            frames_written: 0,
            bytes_written: 0,
            chunks: Vec::new(),
            stop_reason,
            early_stop: false,
            diagnostics,
            frames_captured,
            write_speed: None,
            writing_time: Duration::ZERO,
            idle_time: Duration::ZERO,
        };

        match outcome {
            Some(WriterOutcome {
                output,
                stats,
                early_stop,
            }) => {
                report.frames_written = stats.frames();
                report.bytes_written = stats.bytes_total();
                report.early_stop = early_stop;
                report.write_speed = stats.speed(self.config.throttle.min_sample_bytes);
                report.writing_time = stats.writing_time();
                report.idle_time = stats.idle_time();
                if report.write_speed.is_some() {
                    self.measured_speed = report.write_speed;
                }
                match output.finish() {
                    Ok(chunks) => report.chunks = chunks,
                    Err(e) => {
                        tracing::error!(error = %e, "closing the recording failed");
                        result = Err(e);
                    }
                }
            }
            None => {
                result = Err(Error::InvalidState("disk writer panicked".into()));
            }
        }

        if report.frames_written == 0 {
            let paths: Vec<_> = report.chunks.drain(..).map(|c| c.path).collect();
            for path in paths {
                tracing::info!(path = %path.display(), "removing empty recording");
                if let Err(e) = self.storage.remove(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "could not remove empty recording"
                    );
                }
            }
        }

        shared.pool().teardown();
        drop(shared);
        self.release_arenas(arenas);
        drop(_guard);

        tracing::info!(
            frames = report.frames_written,
            bytes = report.bytes_written,
            chunks = report.chunks.len(),
            reason = ?report.stop_reason,
            "recording finished"
        );
        self.set_state(RecordingState::Idle);
        result.map(|()| report)
    }

    fn set_state(&mut self, next: RecordingState) {
        if self.state != next {
            trace_state_change(&self.name, self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    fn restore_processor(&mut self, processor: FrameProcessor) {
        match processor {
            FrameProcessor::Transfer(engine) => self.engine = Some(engine),
            FrameProcessor::Compress(compressor) => self.compressor = Some(compressor),
        }
    }

    fn remove_output(&self) {
        let _ = self.storage.remove(&self.config.output);
    }

    fn release_arenas(&mut self, arenas: Arc<ArenaSet>) {
        match Arc::try_unwrap(arenas) {
            Ok(set) => self.provider.release(set.into_segments()),
            Err(_) => tracing::warn!("arenas still in use, not returned to the provider"),
        }
    }

    fn shared(&self) -> Option<&Shared> {
        self.session.as_ref().map(|s| s.shared.as_ref())
    }

    /// Free slots, while a session is active.
    pub fn free_slots(&self) -> Option<usize> {
        self.shared().map(|s| s.pool().free_count())
    }

    /// Number of slots, while a session is active.
    pub fn slot_count(&self) -> Option<usize> {
        self.shared().map(|s| s.pool().len())
    }

    /// Frames waiting to be written, while a session is active.
    pub fn queue_len(&self) -> Option<usize> {
        self.shared().map(|s| s.queue.len())
    }

    /// Whether a frame is still being copied or compressed.
    pub fn is_busy(&self) -> bool {
        self.shared()
            .is_some_and(|s| s.busy.load(Ordering::Acquire))
    }

    /// Diagnostics collected so far, while a session is active.
    pub fn diagnostics(&self) -> Option<DiagnosticsReport> {
        self.shared().map(|s| s.diagnostics().report())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.session.is_some()
            && let Err(e) = self.stop()
        {
            tracing::error!(error = %e, "recording did not finish cleanly");
        }
    }
}
