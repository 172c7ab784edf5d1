//! State shared by the three execution contexts of a session.

use super::queue::PendingWriteQueue;
use crate::error::IntegrityFault;
use crate::format::RecordingFormat;
use crate::memory::{ArenaSet, SlotPool};
use crate::observability::{RecordingMetrics, trace_integrity_fault};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Why a recording ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped on request.
    Requested,
    /// No free slot for a new frame, or the previous frame was still being
    /// processed.
    BufferFull,
    /// Storage refused further data.
    StorageExhausted(String),
    /// A session-level error in a background context.
    Failed(String),
}

/// Everything the capture trigger, the copy worker and the disk writer
/// share.
#[derive(Debug)]
pub struct Shared {
    /// Slot pool; every mutation happens under this lock.
    pub pool: Mutex<SlotPool>,
    /// Slots waiting to be written.
    pub queue: PendingWriteQueue,
    /// Arena memory.
    pub arenas: Arc<ArenaSet>,
    /// Block layout of this session.
    pub format: RecordingFormat,
    /// Session metrics.
    pub metrics: RecordingMetrics,
    /// A frame is being copied or compressed.
    pub busy: AtomicBool,
    /// The writer should drain the queue and exit.
    pub draining: AtomicBool,
    /// Frames are buffered but not queued until the trigger.
    pub pre_rolling: AtomicBool,
    transfer_generation: AtomicU64,
    stop_requested: AtomicBool,
    stop_reason: Mutex<Option<StopReason>>,
    abandoned: Mutex<HashSet<usize>>,
    diagnostics: Diagnostics,
}

impl Shared {
    /// Bundle the session state.
    pub fn new(
        pool: SlotPool,
        queue: PendingWriteQueue,
        arenas: Arc<ArenaSet>,
        format: RecordingFormat,
        metrics: RecordingMetrics,
    ) -> Self {
        Self {
            pool: Mutex::new(pool),
            queue,
            arenas,
            format,
            metrics,
            busy: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            pre_rolling: AtomicBool::new(false),
            transfer_generation: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
            abandoned: Mutex::new(HashSet::new()),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Lock the slot pool.
    pub fn pool(&self) -> MutexGuard<'_, SlotPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask every context to stop; the first reason wins.
    pub fn request_stop(&self, reason: StopReason) {
        let mut current = self
            .stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            tracing::info!(reason = ?reason, "recording stop requested");
            *current = Some(reason);
        }
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Whether any context asked to stop.
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// The first stop reason, if any.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tag a new transfer. Callbacks of older transfers become stale.
    pub fn begin_transfer(&self) -> u64 {
        self.transfer_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Completion of transfer `generation`: clears `busy` and returns true,
    /// unless the transfer was retired or superseded in the meantime.
    pub fn finish_transfer(&self, generation: u64) -> bool {
        let retired = self.transfer_generation.compare_exchange(
            generation,
            generation + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if retired.is_err() {
            return false;
        }
        self.busy.store(false, Ordering::Release);
        true
    }

    /// Stop listening to the transfer in flight.
    pub fn retire_transfer(&self) {
        self.transfer_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Give up waiting for a slot's transfer; the writer takes it as is.
    pub fn abandon(&self, slot: usize) {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot);
    }

    /// Whether a slot was abandoned.
    pub fn is_abandoned(&self, slot: usize) -> bool {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&slot)
    }

    /// Forget an abandoned slot once it is written.
    pub fn clear_abandoned(&self, slot: usize) -> bool {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot)
    }

    /// Per-frame diagnostics.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Record an integrity fault (logged, counted, kept for the report).
    pub fn record_fault(&self, fault: IntegrityFault) {
        trace_integrity_fault(&fault);
        self.metrics.record_integrity_fault();
        self.diagnostics.push_fault(fault);
    }
}

/// Per-frame problems collected during a session.
#[derive(Debug, Default)]
pub struct Diagnostics {
    faults: Mutex<Vec<IntegrityFault>>,
    transfer_timeouts: AtomicU64,
    dropped_frames: AtomicU64,
}

impl Diagnostics {
    fn push_fault(&self, fault: IntegrityFault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fault);
    }

    /// Count a transfer timeout.
    pub fn record_transfer_timeout(&self) {
        self.transfer_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dropped frame.
    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot.
    pub fn report(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            faults: self
                .faults
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            transfer_timeouts: self.transfer_timeouts.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

/// Diagnostics at the end of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsReport {
    /// Integrity faults in the order they were found.
    pub faults: Vec<IntegrityFault>,
    /// Transfers that never completed.
    pub transfer_timeouts: u64,
    /// Frames dropped at the capture trigger.
    pub dropped_frames: u64,
}
