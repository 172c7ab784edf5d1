//! End-to-end recording tests.
//!
//! These tests run whole sessions against simulated storage: buffer
//! exhaustion, pre-roll, chunk rotation, a full card, compression,
//! transfers that never finish, and a real filesystem.

use rawrec::format::{FRAME_SENTINEL, summarize};
use rawrec::memory::SlotLayout;
use rawrec::pipeline::transfer::{CompleteCallback, ErrorCallback, TransferTarget};
use rawrec::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const MIB: usize = 1024 * 1024;

/// Log to the test output, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_geometry() -> FrameGeometry {
    FrameGeometry::full_sensor(64, 16, 8)
}

/// Sensor buffer with a pattern that never contains the sentinel byte.
fn sensor_frame(geometry: FrameGeometry, seed: u8) -> RawFrame {
    let data: Vec<u8> = (0..geometry.sensor_buffer_size())
        .map(|i| ((i / 7) as u8).wrapping_add(seed) & 0x7F)
        .collect();
    RawFrame::new(data, geometry).unwrap()
}

fn slot_size(geometry: FrameGeometry) -> usize {
    SlotLayout::default().slot_size(geometry.frame_size())
}

fn wait_idle(recorder: &Recorder) {
    let start = Instant::now();
    while recorder.is_busy() && start.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(1));
    }
}

/// Feed `count` ticks, letting every transfer land before the next.
fn feed(recorder: &mut Recorder, geometry: FrameGeometry, count: usize) -> Vec<CaptureOutcome> {
    (0..count)
        .map(|i| {
            let outcome = recorder.on_frame(sensor_frame(geometry, i as u8)).unwrap();
            wait_idle(recorder);
            outcome
        })
        .collect()
}

fn chunk_data(storage: &MemoryStorage, chunks: &[PathBuf]) -> Vec<Vec<u8>> {
    chunks
        .iter()
        .map(|p| storage.contents(p).unwrap())
        .collect()
}

// ============================================================================
// Buffer Exhaustion
// ============================================================================

#[test]
fn test_fifth_frame_dropped_with_four_slots() {
    init_tracing();
    let geometry = FrameGeometry::full_sensor(1024, 1024, 8);
    assert_eq!(geometry.frame_size(), MIB);
    let storage = MemoryStorage::new();
    let config = RecorderConfig::new("/card/FULL.RVF", geometry, 25.0);
    let provider = HeapArenaProvider::new(vec![4 * slot_size(geometry) + 64]);
    let mut recorder = Recorder::new(config, provider, storage.clone());
    recorder.start().unwrap();
    assert_eq!(recorder.free_slots(), Some(4));

    storage.pause();
    let outcomes = feed(&mut recorder, geometry, 6);
    assert_eq!(outcomes[0], CaptureOutcome::Discarded);
    for (i, outcome) in outcomes[1..5].iter().enumerate() {
        assert!(
            matches!(outcome, CaptureOutcome::Captured { frame, .. } if *frame == i as u32 + 1),
            "{outcome:?}"
        );
    }
    assert_eq!(outcomes[5], CaptureOutcome::BufferFull);
    assert_eq!(recorder.queue_len(), Some(4));
    assert_eq!(recorder.state(), RecordingState::Finishing);

    // frames after the drop are ignored
    assert_eq!(
        recorder.on_frame(sensor_frame(geometry, 9)).unwrap(),
        CaptureOutcome::Stopped
    );

    storage.resume();
    let report = recorder.poll_finished().unwrap().expect("session ended");
    assert_eq!(report.stop_reason, StopReason::BufferFull);
    assert_eq!(report.frames_written, 4);
    assert_eq!(report.diagnostics.dropped_frames, 1);
    assert!(report.diagnostics.faults.is_empty());
    assert_eq!(recorder.state(), RecordingState::Idle);

    let file = storage.contents(Path::new("/card/FULL.RVF")).unwrap();
    let summary = summarize([file.as_slice()]).unwrap();
    assert_eq!(summary.frames, vec![0, 1, 2, 3]);
    assert_eq!(summary.files[0].video_frame_count, 4);
}

// ============================================================================
// Pre-roll
// ============================================================================

#[test]
fn test_pre_roll_promotes_sixty_frames_in_order() {
    init_tracing();
    let geometry = small_geometry();
    let storage = MemoryStorage::new();
    let config = RecorderConfig::new("/card/PRE.RVF", geometry, 30.0)
        .with_pre_roll(PreRollConfig::new(Duration::from_secs(2)).with_headroom(0));
    let provider = HeapArenaProvider::new(vec![70 * slot_size(geometry) + 64]);
    let mut recorder = Recorder::new(config, provider, storage.clone());
    recorder.start().unwrap();
    assert_eq!(recorder.state(), RecordingState::PreRecording);

    let outcomes = feed(&mut recorder, geometry, 81);
    assert!(
        outcomes[1..]
            .iter()
            .all(|o| matches!(o, CaptureOutcome::Buffered { .. }))
    );
    // never more than the budget, numbered from 1
    assert!(matches!(
        outcomes[80],
        CaptureOutcome::Buffered { frame: 60, .. }
    ));
    assert_eq!(recorder.queue_len(), Some(0));

    assert_eq!(recorder.trigger().unwrap(), 60);
    assert_eq!(recorder.state(), RecordingState::Recording);
    assert!(recorder.trigger().is_err());

    let report = recorder.stop().unwrap();
    assert_eq!(report.frames_written, 60);
    assert!(report.diagnostics.faults.is_empty());

    let file = storage.contents(Path::new("/card/PRE.RVF")).unwrap();
    let summary = summarize([file.as_slice()]).unwrap();
    assert_eq!(summary.frames, (0..60).collect::<Vec<u32>>());
}

// ============================================================================
// Chunk Rotation
// ============================================================================

#[test]
fn test_known_limit_splits_mid_burst() {
    init_tracing();
    let geometry = small_geometry();
    let slot = slot_size(geometry) as u64;
    let limit = 512 + 3 * slot + 100;
    let storage = MemoryStorage::new();
    let config = RecorderConfig::new("/card/SPLIT.RVF", geometry, 25.0)
        .with_max_chunk_size(Some(limit));
    let provider = HeapArenaProvider::new(vec![64 * 1024]);
    let mut recorder = Recorder::new(config, provider, storage.clone());
    recorder.start().unwrap();

    // let frames pile up so they go out as one burst
    storage.pause();
    feed(&mut recorder, geometry, 9);
    storage.resume();
    let report = recorder.stop().unwrap();

    assert_eq!(report.frames_written, 8);
    assert!(report.chunks.len() >= 3);
    assert_eq!(report.chunks[0].path, PathBuf::from("/card/SPLIT.RVF"));
    assert_eq!(report.chunks[1].path, PathBuf::from("/card/SPLIT.R00"));
    assert_eq!(report.chunks[0].frames, 3);
    let total: u32 = report.chunks.iter().map(|c| c.frames).sum();
    assert_eq!(total, 8);

    let paths: Vec<_> = report.chunks.iter().map(|c| c.path.clone()).collect();
    let data = chunk_data(&storage, &paths);
    for chunk in &data {
        assert!(chunk.len() as u64 <= limit);
    }
    let summary = summarize(data.iter().map(Vec::as_slice)).unwrap();
    assert_eq!(summary.frames, (0..8).collect::<Vec<u32>>());
    for (file, info) in summary.files.iter().zip(&report.chunks) {
        assert_eq!(file.video_frame_count, info.frames);
    }
    assert!(summary.raw_info.is_some());
}

#[test]
fn test_unknown_limit_rotates_on_short_write() {
    init_tracing();
    let geometry = small_geometry();
    let slot = slot_size(geometry) as u64;
    let limit = 512 + 5 * slot + 700;
    let storage = MemoryStorage::new().with_file_size_limit(limit);
    let config = RecorderConfig::new("/card/SHORT.RVF", geometry, 25.0)
        .with_max_chunk_size(Some(limit))
        .with_chunk_limit_known(false)
        .with_poll_interval(Duration::from_millis(2));
    let provider = HeapArenaProvider::new(vec![64 * 1024]);
    let mut recorder = Recorder::new(config, provider, storage.clone());
    recorder.start().unwrap();

    for i in 0..13 {
        recorder.on_frame(sensor_frame(geometry, i)).unwrap();
        wait_idle(&recorder);
        thread::sleep(Duration::from_millis(15));
    }
    let report = recorder.stop().unwrap();
    assert_eq!(report.stop_reason, StopReason::Requested);
    assert_eq!(report.frames_written, 12);
    assert!(report.chunks.len() >= 2);

    let first = storage.contents(Path::new("/card/SHORT.RVF")).unwrap();
    assert_eq!(first.len() as u64, limit);

    let paths: Vec<_> = report.chunks.iter().map(|c| c.path.clone()).collect();
    let data = chunk_data(&storage, &paths);
    let summary = summarize(data.iter().map(Vec::as_slice)).unwrap();
    assert_eq!(summary.frames, (0..12).collect::<Vec<u32>>());
    assert_eq!(summary.frames_per_chunk[0], report.chunks[0].frames);
}

// ============================================================================
// Storage Exhaustion
// ============================================================================

#[test]
fn test_card_full_stops_recording() {
    init_tracing();
    let geometry = small_geometry();
    let slot = slot_size(geometry) as u64;
    let storage = MemoryStorage::new().with_capacity(512 + 4 * slot + 200);
    let config = RecorderConfig::new("/card/CARD.RVF", geometry, 25.0)
        .with_poll_interval(Duration::from_millis(2));
    let provider = HeapArenaProvider::new(vec![64 * 1024]);
    let mut recorder = Recorder::new(config, provider, storage.clone());
    recorder.start().unwrap();

    let mut report = None;
    for i in 0..30 {
        if recorder.state().is_capturing() {
            recorder.on_frame(sensor_frame(geometry, i)).unwrap();
            wait_idle(&recorder);
        }
        thread::sleep(Duration::from_millis(5));
        if let Some(r) = recorder.poll_finished().unwrap() {
            report = Some(r);
            break;
        }
    }

    let report = report.expect("card never filled up");
    assert!(matches!(report.stop_reason, StopReason::StorageExhausted(_)));
    assert!(report.frames_written <= 4);
    assert!(report.frames_written > 0);
    assert_eq!(report.chunks.len(), 1);
    assert_eq!(report.chunks[0].frames as u64, report.frames_written);

    // the frame count in the header matches what made it to the card
    let file = storage.contents(Path::new("/card/CARD.RVF")).unwrap();
    let header = rawrec::format::FileBlock::decode(&file).unwrap();
    assert_eq!(header.video_frame_count as u64, report.frames_written);
}

// ============================================================================
// Compression
// ============================================================================

#[test]
fn test_compressed_recording_is_smaller() {
    init_tracing();
    let geometry = small_geometry();
    let storage = MemoryStorage::new();
    let config = RecorderConfig::new("/card/RLE.RVF", geometry, 25.0)
        .with_compression(CompressionMode::Lossless);
    let provider = HeapArenaProvider::new(vec![64 * 1024]);
    let mut recorder = Recorder::new(config, provider, storage.clone());
    recorder.start().unwrap();

    // flat frames compress to almost nothing
    for _ in 0..11 {
        let flat = RawFrame::new(vec![0x20u8; geometry.sensor_buffer_size()], geometry).unwrap();
        recorder.on_frame(flat).unwrap();
        wait_idle(&recorder);
    }
    let report = recorder.stop().unwrap();
    assert_eq!(report.frames_written, 10);
    assert!(report.diagnostics.faults.is_empty());
    assert!(report.bytes_written < 512 + 10 * slot_size(geometry) as u64);

    let file = storage.contents(Path::new("/card/RLE.RVF")).unwrap();
    let summary = summarize([file.as_slice()]).unwrap();
    assert_eq!(summary.frames, (0..10).collect::<Vec<u32>>());
    // lossless
    assert_eq!(summary.raw_info.unwrap().compression, 1);
}

// ============================================================================
// Transfer Timeouts
// ============================================================================

/// Engine that accepts transfers and never finishes them.
struct StuckEngine {
    held: Arc<Mutex<Vec<(CompleteCallback, ErrorCallback)>>>,
}

impl TransferEngine for StuckEngine {
    fn start_async_copy(
        &mut self,
        _src: RawFrame,
        _dst: TransferTarget,
        on_error: ErrorCallback,
        on_complete: CompleteCallback,
    ) -> Result<()> {
        self.held.lock().unwrap().push((on_complete, on_error));
        Ok(())
    }
}

#[test]
fn test_transfer_timeout_keeps_recording() {
    init_tracing();
    let geometry = small_geometry();
    let storage = MemoryStorage::new();
    let config = RecorderConfig::new("/card/STUCK.RVF", geometry, 25.0)
        .with_transfer_timeout(Duration::from_millis(20));
    let provider = HeapArenaProvider::new(vec![64 * 1024]);
    let held = Arc::new(Mutex::new(Vec::new()));
    let mut recorder = Recorder::new(config, provider, storage.clone())
        .with_transfer_engine(Box::new(StuckEngine { held: held.clone() }));
    recorder.start().unwrap();

    let outcomes = feed(&mut recorder, geometry, 4);
    assert!(
        outcomes[1..]
            .iter()
            .all(|o| matches!(o, CaptureOutcome::Captured { .. }))
    );
    assert_eq!(held.lock().unwrap().len(), 3);

    let report = recorder.stop().unwrap();
    assert_eq!(report.stop_reason, StopReason::Requested);
    assert_eq!(report.diagnostics.transfer_timeouts, 3);
    assert_eq!(report.frames_written, 3);
    // a written slot may be picked again, so only the frames are fixed
    let frames: Vec<u32> = report
        .diagnostics
        .faults
        .iter()
        .map(|fault| match fault {
            IntegrityFault::Incomplete { frame, .. } => *frame,
            other => panic!("unexpected fault {other:?}"),
        })
        .collect();
    assert_eq!(frames, vec![1, 2, 3]);

    // the unfinished payloads still carry the end marker
    let file = storage.contents(Path::new("/card/STUCK.RVF")).unwrap();
    let marker = FRAME_SENTINEL.to_le_bytes();
    assert!(file.windows(4).any(|w| w == marker));
}

// ============================================================================
// Filesystem
// ============================================================================

#[test]
fn test_records_to_filesystem() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("M00-0001.RVF");
    let geometry = small_geometry();
    let config = RecorderConfig::new(&output, geometry, 25.0);
    let provider = HeapArenaProvider::new(vec![64 * 1024]);
    let mut recorder = Recorder::new(config, provider, FsStorage::new());

    recorder.start().unwrap();
    feed(&mut recorder, geometry, 6);
    let report = recorder.stop().unwrap();
    assert_eq!(report.frames_written, 5);

    let file = std::fs::read(&output).unwrap();
    assert_eq!(file.len() as u64, report.bytes_written);
    let summary = summarize([file.as_slice()]).unwrap();
    assert_eq!(summary.frames, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_empty_recording_deleted_from_filesystem() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("M00-0002.RVF");
    let config = RecorderConfig::new(&output, small_geometry(), 25.0);
    let provider = HeapArenaProvider::new(vec![64 * 1024]);
    let mut recorder = Recorder::new(config, provider, FsStorage::new());

    recorder.start().unwrap();
    assert!(output.exists());
    // only the discarded first tick
    recorder
        .on_frame(sensor_frame(small_geometry(), 0))
        .unwrap();
    let report = recorder.stop().unwrap();
    assert_eq!(report.frames_written, 0);
    assert!(!output.exists());
}
