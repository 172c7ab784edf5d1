//! Disk writer.
//!
//! Waits for the head of the pending-write queue to be completely
//! transferred, groups as many physically contiguous queued slots as it can
//! into one burst, optionally shortens the burst when the buffer is about to
//! overflow, writes it, verifies every frame and gives the slots back.

use super::chunk::ChunkedOutput;
use super::shared::{Shared, StopReason};
use super::throttle::{Throttle, WriteStats};
use crate::error::{Error, IntegrityFault, Result};
use crate::format::{FrameCheck, check};
use crate::memory::{FrameSlot, SlotPool, SlotStatus};
use crate::observability::span_disk_writer;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What the writer hands back when it exits.
#[derive(Debug)]
pub struct WriterOutcome {
    /// The output, still open.
    pub output: ChunkedOutput,
    /// Write counters.
    pub stats: WriteStats,
    /// The buffer ran out while the last burst held more than two frames.
    pub early_stop: bool,
}

/// The disk writer.
#[derive(Debug)]
pub struct DiskWriter {
    shared: Arc<Shared>,
    output: ChunkedOutput,
    throttle: Throttle,
    stats: WriteStats,
    poll_interval: Duration,
    header_size: usize,
    compressed: bool,
    draining: bool,
    last_frame: u32,
    saw_buffer_full: bool,
    early_stop: bool,
}

impl DiskWriter {
    /// Create a writer.
    pub fn new(
        shared: Arc<Shared>,
        output: ChunkedOutput,
        throttle: Throttle,
        poll_interval: Duration,
        compressed: bool,
    ) -> Self {
        let header_size = shared.pool().layout().header_size;
        let mut stats = WriteStats::new();
        let mut output = output;
        stats.record_overhead(output.take_overhead());
        Self {
            shared,
            output,
            throttle,
            stats,
            poll_interval,
            header_size,
            compressed,
            draining: false,
            last_frame: 0,
            saw_buffer_full: false,
            early_stop: false,
        }
    }

    /// Run on a new thread.
    pub fn spawn(self) -> Result<JoinHandle<WriterOutcome>> {
        let span = span_disk_writer(self.shared.metrics.name());
        let handle = thread::Builder::new()
            .name("rawrec-writer".to_string())
            .spawn(move || {
                let _guard = span.enter();
                self.run()
            })?;
        Ok(handle)
    }

    /// Write until drained or stopped by storage.
    pub fn run(mut self) -> WriterOutcome {
        tracing::debug!("disk writer started");
        loop {
            // the worker is gone once draining, every queued frame is final
            self.draining = self.shared.draining.load(Ordering::Acquire);
            match self.shared.stop_reason() {
                // nothing more fits; anything else still drains the queue
                Some(StopReason::StorageExhausted(_)) => break,
                Some(StopReason::BufferFull) if !self.saw_buffer_full => {
                    self.saw_buffer_full = true;
                    let last = self.stats.last_burst_frames();
                    self.early_stop = last > 2;
                    if self.early_stop {
                        tracing::warn!(
                            last_burst = last,
                            "early stop, did not reach the estimated record time"
                        );
                    }
                }
                _ => {}
            }

            let Some(head) = self.shared.queue.peek_timeout(self.poll_interval) else {
                if self.draining && self.shared.queue.is_empty() {
                    break;
                }
                continue;
            };

            if !self.ready(head) {
                thread::sleep(self.poll_interval);
                continue;
            }

            if let Err(e) = self.write_burst() {
                let reason = match e {
                    Error::StorageExhausted(msg) => StopReason::StorageExhausted(msg),
                    other => StopReason::Failed(other.to_string()),
                };
                tracing::error!(reason = ?reason, "disk writer stopping");
                let dropped = self.shared.queue.clear();
                if dropped > 0 {
                    tracing::warn!(frames = dropped, "frames not written");
                }
                self.shared.request_stop(reason);
                break;
            }
        }
        tracing::debug!(
            frames = self.stats.frames(),
            bytes = self.stats.bytes_total(),
            "disk writer stopped"
        );
        WriterOutcome {
            output: self.output,
            stats: self.stats,
            early_stop: self.early_stop,
        }
    }

    fn ready(&self, index: usize) -> bool {
        let pool = self.shared.pool();
        self.slot_ready(&pool, index)
    }

    fn slot_ready(&self, pool: &SlotPool, index: usize) -> bool {
        if self.compressed || self.draining || self.shared.is_abandoned(index) {
            return true;
        }
        pool.slot(index).is_none_or(|slot| {
            !matches!(
                check(&self.shared.arenas, slot, self.header_size),
                Ok(FrameCheck::Incomplete)
            )
        })
    }

    fn write_burst(&mut self) -> Result<()> {
        let (burst, queue_len) = {
            let mut pool = self.shared.pool();
            let queued = self.shared.queue.snapshot(self.shared.queue.capacity());
            let head = queued.first().and_then(|&i| pool.slot(i).map(|s| (i, s.status)));
            if let Some((index, status)) = head
                && status != SlotStatus::Full
            {
                self.shared
                    .record_fault(IntegrityFault::UnexpectedStatus { slot: index });
                self.shared.queue.consume(1);
                return Ok(());
            }

            let mut burst: Vec<(usize, FrameSlot)> = Vec::new();
            for &index in &queued {
                let Some(slot) = pool.slot(index).copied() else {
                    break;
                };
                if let Some(&(_, prev)) = burst.last()
                    && (!prev.is_followed_by(&slot)
                        || slot.status != SlotStatus::Full
                        || !self.slot_ready(&pool, index))
                {
                    break;
                }
                burst.push((index, slot));
            }

            if !self.draining && !self.saw_buffer_full {
                let bytes: usize = burst.iter().map(|(_, s)| s.total_size).sum();
                let speed = self.throttle.write_speed(&self.stats);
                let limit = self
                    .throttle
                    .limit(burst.len(), bytes, pool.free_count(), speed);
                burst.truncate(limit);
            }
            if burst.len() == queued.len() {
                pool.request_new_buffer();
            }

            for &(index, _) in &burst {
                pool.mark_writing(index)?;
            }
            (burst, queued.len())
        };

        let Some(&(_, first)) = burst.first() else {
            return Ok(());
        };
        let sizes: Vec<usize> = burst.iter().map(|(_, s)| s.total_size).collect();
        let bytes: usize = sizes.iter().sum();
        tracing::trace!(frames = burst.len(), bytes, queued = queue_len, "writing burst");

        let started = self.stats.begin_burst();
        {
            // SAFETY: every slot of the burst is WRITING; capture and the
            // worker never touch such slots until they are freed below.
            let data = unsafe { self.shared.arenas.slice(first.address, bytes)? };
            self.output.write_burst(data, &sizes)?;
        }
        let elapsed = self.stats.end_burst(started, bytes, burst.len());
        let overhead = self.output.take_overhead();
        self.stats.record_overhead(overhead);

        let metrics = &self.shared.metrics;
        metrics.record_burst(bytes, burst.len(), elapsed);
        metrics.record_bytes(overhead);
        if let Some(speed) = self.throttle.write_speed(&self.stats) {
            metrics.record_write_speed(speed);
        }

        self.release(&burst)
    }

    /// Verify and free the slots of a written burst.
    fn release(&mut self, burst: &[(usize, FrameSlot)]) -> Result<()> {
        let mut pool = self.shared.pool();
        for &(index, slot) in burst {
            let abandoned = self.shared.clear_abandoned(index);
            let status = if abandoned {
                FrameCheck::Incomplete
            } else {
                check(&self.shared.arenas, &slot, self.header_size)?
            };
            let counts = !self.compressed || status == FrameCheck::Overflow;
            if counts && let Some(fault) = status.fault(index, slot.frame_number) {
                self.shared.record_fault(fault);
            }

            let expected = self.last_frame + 1;
            if slot.frame_number != expected {
                self.shared.record_fault(IntegrityFault::OutOfOrder {
                    slot: index,
                    frame: slot.frame_number,
                    expected,
                });
            }
            self.last_frame = expected;

            pool.free(index)?;
        }
        self.shared.queue.consume(burst.len());
        self.shared.metrics.record_free_slots(pool.free_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameGeometry, RecorderConfig, ThrottleConfig};
    use crate::format::{RecordingFormat, add_checks, summarize};
    use crate::memory::{ArenaProvider, ArenaSet, HeapArenaProvider, SlotLayout};
    use crate::observability::RecordingMetrics;
    use crate::pipeline::PendingWriteQueue;
    use crate::storage::MemoryStorage;
    use std::path::Path;

    fn geometry() -> FrameGeometry {
        FrameGeometry::full_sensor(64, 16, 8)
    }

    fn setup(slots: usize, storage: &MemoryStorage) -> (DiskWriter, Arc<Shared>) {
        let config = RecorderConfig::new("/card/W.RVF", geometry(), 25.0);
        let layout = SlotLayout::default();
        let slot_size = layout.slot_size(config.frame_size());
        let mut provider = HeapArenaProvider::new(vec![slot_size * slots + 64]);
        let arenas = Arc::new(ArenaSet::new(provider.allocate().unwrap()));
        let pool = SlotPool::initialize(&arenas.regions(), layout, config.frame_size()).unwrap();
        let format = RecordingFormat::new(&config);
        let output = ChunkedOutput::open(
            Arc::new(storage.clone()),
            "/card/W.RVF",
            format.clone(),
            None,
            false,
        )
        .unwrap();
        let shared = Arc::new(Shared::new(
            pool,
            PendingWriteQueue::new(slots + 1),
            arenas,
            format,
            RecordingMetrics::new("writer-test"),
        ));
        let writer = DiskWriter::new(
            shared.clone(),
            output,
            Throttle::new(ThrottleConfig::disabled(), 25.0),
            Duration::from_millis(2),
            false,
        );
        (writer, shared)
    }

    /// Capture and complete frame `frame` into `index`.
    fn fill(shared: &Shared, index: usize, frame: u32, complete: bool) {
        let mut pool = shared.pool();
        let slot = pool.claim(index, frame).unwrap();
        let header = shared.format.frame_header(slot.total_size, frame);
        shared.arenas.write_at(slot.address, &header).unwrap();
        add_checks(&shared.arenas, &slot, 64).unwrap();
        if complete {
            shared.arenas.fill(slot.address + 64, slot.payload_size, 0x11).unwrap();
        }
        shared.queue.push(index).unwrap();
    }

    fn drain(shared: &Shared) {
        shared.draining.store(true, Ordering::Release);
        shared.queue.set_flushing(true);
    }

    #[test]
    fn test_writes_contiguous_burst() {
        let storage = MemoryStorage::new();
        let (writer, shared) = setup(4, &storage);
        for i in 0..3 {
            fill(&shared, i, i as u32 + 1, true);
        }
        drain(&shared);
        let outcome = writer.run();

        assert_eq!(outcome.stats.frames(), 3);
        assert_eq!(outcome.stats.bursts(), 1);
        assert!(!outcome.early_stop);
        assert!(shared.diagnostics().report().faults.is_empty());
        assert_eq!(shared.pool().count(SlotStatus::Free), 4);
        assert!(shared.queue.is_empty());

        let chunks = outcome.output.finish().unwrap();
        assert_eq!(chunks[0].frames, 3);
        let file = storage.contents(Path::new("/card/W.RVF")).unwrap();
        let summary = summarize([file.as_slice()]).unwrap();
        assert_eq!(summary.frames, vec![0, 1, 2]);
    }

    #[test]
    fn test_waits_for_incomplete_head() {
        let storage = MemoryStorage::new();
        let (writer, shared) = setup(4, &storage);
        fill(&shared, 0, 1, false);
        let handle = writer.spawn().unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(shared.queue.len(), 1);
        assert_eq!(shared.pool().slot(0).unwrap().status, SlotStatus::Full);

        // the transfer lands
        let slot = *shared.pool().slot(0).unwrap();
        shared.arenas.fill(slot.address + 64, slot.payload_size, 0x22).unwrap();
        drain(&shared);
        let outcome = handle.join().unwrap();
        assert_eq!(outcome.stats.frames(), 1);
        assert!(shared.diagnostics().report().faults.is_empty());
    }

    #[test]
    fn test_abandoned_slot_written_with_fault() {
        let storage = MemoryStorage::new();
        let (writer, shared) = setup(4, &storage);
        fill(&shared, 0, 1, false);
        shared.abandon(0);
        drain(&shared);
        let outcome = writer.run();

        assert_eq!(outcome.stats.frames(), 1);
        let faults = shared.diagnostics().report().faults;
        assert_eq!(faults, vec![IntegrityFault::Incomplete { slot: 0, frame: 1 }]);
        assert!(!shared.is_abandoned(0));
    }

    #[test]
    fn test_order_check() {
        let storage = MemoryStorage::new();
        let (writer, shared) = setup(4, &storage);
        fill(&shared, 0, 1, true);
        fill(&shared, 1, 3, true);
        drain(&shared);
        writer.run();

        let faults = shared.diagnostics().report().faults;
        assert_eq!(
            faults,
            vec![IntegrityFault::OutOfOrder {
                slot: 1,
                frame: 3,
                expected: 2
            }]
        );
    }

    #[test]
    fn test_failed_session_still_drains_queue() {
        let storage = MemoryStorage::new();
        let (writer, shared) = setup(4, &storage);
        fill(&shared, 0, 1, true);
        fill(&shared, 1, 2, true);
        shared.request_stop(StopReason::Failed("compressed frame overflowed".into()));
        drain(&shared);
        let outcome = writer.run();

        assert_eq!(outcome.stats.frames(), 2);
        assert!(shared.queue.is_empty());
        assert!(shared.diagnostics().report().faults.is_empty());
        let chunks = outcome.output.finish().unwrap();
        assert_eq!(chunks[0].frames, 2);
    }

    #[test]
    fn test_storage_exhausted_clears_queue() {
        let storage = MemoryStorage::new().with_capacity(512 + 100);
        let (writer, shared) = setup(4, &storage);
        fill(&shared, 0, 1, true);
        fill(&shared, 1, 2, true);
        let outcome = writer.run();

        assert!(matches!(
            shared.stop_reason(),
            Some(StopReason::StorageExhausted(_))
        ));
        assert!(shared.queue.is_empty());
        assert_eq!(outcome.stats.frames(), 0);
    }

    #[test]
    fn test_early_stop_detection() {
        let storage = MemoryStorage::new();
        let (writer, shared) = setup(4, &storage);
        for i in 0..3 {
            fill(&shared, i, i as u32 + 1, true);
        }
        let handle = writer.spawn().unwrap();
        let start = std::time::Instant::now();
        while !shared.queue.is_empty() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        shared.request_stop(StopReason::BufferFull);
        drain(&shared);
        let outcome = handle.join().unwrap();
        assert!(outcome.early_stop);
    }
}
