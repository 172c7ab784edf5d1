//! Capture trigger.
//!
//! Runs once per sensor frame tick and never blocks: it picks a slot,
//! stamps the frame header and the completion sentinels, and posts the
//! frame to the copy worker. While pre-rolling, frames stay FULL in the
//! pool instead of being queued, and the oldest one is dropped once the
//! pre-roll budget is reached.

use super::shared::{Shared, StopReason};
use super::transfer::RawFrame;
use crate::error::{Error, Result};
use crate::format::{FrameHeader, add_checks};
use crate::memory::{SlotPool, SlotStatus};
use kanal::Sender;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Message from the capture trigger to the copy worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Fill `slot` from `frame`.
    Process {
        /// Slot index.
        slot: usize,
        /// Sensor buffer.
        frame: RawFrame,
    },
    /// Exit after the messages already queued.
    Shutdown,
}

/// What the trigger did with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// First tick after start; it belongs to a partially exposed frame.
    Discarded,
    /// Captured and queued for writing (or queued once processed).
    Captured {
        /// Slot holding the frame.
        slot: usize,
        /// 1-based frame number.
        frame: u32,
    },
    /// Captured into the pre-roll buffer.
    Buffered {
        /// Slot holding the frame.
        slot: usize,
        /// 1-based frame number.
        frame: u32,
    },
    /// Dropped; the recording stops.
    BufferFull,
    /// The recording is stopping; nothing was done.
    Stopped,
}

/// The real-time half of the pipeline.
#[derive(Debug)]
pub struct CaptureTrigger {
    shared: Arc<Shared>,
    worker: Sender<WorkerMessage>,
    compressed: bool,
    frame_count: u32,
    capture_slot: Option<usize>,
    pre_roll_budget: Option<u32>,
}

impl CaptureTrigger {
    /// Create the trigger. `pre_roll_budget` is the number of frames kept
    /// before [`promote_preroll`](Self::promote_preroll), if pre-rolling; a
    /// budget of zero records right away.
    pub fn new(
        shared: Arc<Shared>,
        worker: Sender<WorkerMessage>,
        compressed: bool,
        pre_roll_budget: Option<u32>,
    ) -> Self {
        let pre_roll_budget = pre_roll_budget.filter(|&budget| budget > 0);
        shared
            .pre_rolling
            .store(pre_roll_budget.is_some(), Ordering::Release);
        Self {
            shared,
            worker,
            compressed,
            frame_count: 0,
            capture_slot: None,
            pre_roll_budget,
        }
    }

    /// Handle one sensor frame tick.
    pub fn on_frame(&mut self, frame: RawFrame) -> CaptureOutcome {
        if self.frame_count == 0 {
            self.frame_count = 1;
            return CaptureOutcome::Discarded;
        }
        if self.shared.stop_requested() {
            return CaptureOutcome::Stopped;
        }
        if self.shared.busy.load(Ordering::Acquire) {
            tracing::warn!(
                frame = self.frame_count,
                "frame skipped, previous one still processing"
            );
            return self.buffer_full();
        }

        let shared = Arc::clone(&self.shared);
        let mut pool = shared.pool();
        let header_size = pool.layout().header_size;
        if let Some(budget) = self.pre_roll_budget
            && self.frame_count - 1 >= budget
            && let Err(e) = self.drop_oldest(&mut pool)
        {
            tracing::error!(error = %e, "pre-roll discard failed");
        }

        let Some(index) = pool.choose_next_slot(self.capture_slot) else {
            drop(pool);
            tracing::info!(frame = self.frame_count, "no free slot left");
            return self.buffer_full();
        };

        let frame_number = self.frame_count;
        let slot = match pool.claim(index, frame_number) {
            Ok(slot) => slot,
            Err(e) => {
                drop(pool);
                return self.fail(e);
            }
        };

        let header = self.shared.format.frame_header(slot.total_size, frame_number);
        let stamped = self
            .shared
            .arenas
            .write_at(slot.address, &header)
            .and_then(|()| add_checks(&self.shared.arenas, &slot, header_size));
        if let Err(e) = stamped {
            let _ = pool.free(index);
            drop(pool);
            return self.fail(e);
        }

        self.shared.busy.store(true, Ordering::Release);
        let sent = self.worker.try_send(WorkerMessage::Process {
            slot: index,
            frame,
        });
        if !matches!(sent, Ok(true)) {
            let _ = pool.free(index);
            self.shared.busy.store(false, Ordering::Release);
            drop(pool);
            tracing::warn!(frame = frame_number, "copy worker not accepting frames");
            return self.buffer_full();
        }

        let pre_rolling = self.pre_roll_budget.is_some();
        if !pre_rolling && !self.compressed && self.shared.queue.push(index).is_err() {
            // the worker owns the frame now; it is written if it completes
            self.shared.abandon(index);
            drop(pool);
            return self.buffer_full();
        }

        self.shared.metrics.record_free_slots(pool.free_count());
        drop(pool);

        self.capture_slot = Some(index);
        self.frame_count += 1;
        self.shared.metrics.record_captured();
        if pre_rolling {
            CaptureOutcome::Buffered {
                slot: index,
                frame: frame_number,
            }
        } else {
            CaptureOutcome::Captured {
                slot: index,
                frame: frame_number,
            }
        }
    }

    /// Free frame 1 and shift every buffered frame down by one.
    fn drop_oldest(&mut self, pool: &mut SlotPool) -> Result<()> {
        let Some(oldest) = pool.find_full(1) else {
            return Ok(());
        };
        pool.free(oldest)?;
        self.shared.clear_abandoned(oldest);

        let buffered: Vec<usize> = (0..pool.len())
            .filter(|&i| pool.slot(i).is_some_and(|s| s.status == SlotStatus::Full))
            .collect();
        for index in buffered {
            let Some(slot) = pool.slot(index).copied() else {
                continue;
            };
            let renumbered = slot.frame_number - 1;
            pool.renumber(index, renumbered)?;
            // header frame numbers are 0-based
            self.shared.arenas.write_u32(
                slot.address + FrameHeader::FRAME_NUMBER_OFFSET,
                renumbered - 1,
            )?;
        }
        self.frame_count -= 1;
        tracing::trace!(slot = oldest, "pre-roll dropped oldest frame");
        Ok(())
    }

    /// End pre-roll: queue every buffered frame in order and start
    /// recording normally.
    pub fn promote_preroll(&mut self) -> Result<u32> {
        if self.pre_roll_budget.is_none() {
            return Err(Error::InvalidState("not pre-recording".into()));
        }
        let pool = self.shared.pool();
        self.shared.pre_rolling.store(false, Ordering::Release);
        self.pre_roll_budget = None;

        // a compressed frame still in the worker queues itself when done
        let in_flight = (self.compressed && self.shared.busy.load(Ordering::Acquire))
            .then_some(self.capture_slot)
            .flatten();
        let mut buffered: Vec<(u32, usize)> = pool
            .slots()
            .iter()
            .enumerate()
            .filter(|&(i, s)| s.status == SlotStatus::Full && Some(i) != in_flight)
            .map(|(i, s)| (s.frame_number, i))
            .collect();
        buffered.sort_unstable();
        let order: Vec<usize> = buffered.iter().map(|&(_, i)| i).collect();
        self.shared.queue.push_all(&order)?;
        drop(pool);

        tracing::info!(frames = order.len(), "pre-roll promoted to recording");
        Ok(order.len() as u32)
    }

    /// Whether frames are still held back as pre-roll.
    pub fn is_pre_rolling(&self) -> bool {
        self.pre_roll_budget.is_some()
    }

    /// Number of the next frame to capture (1-based).
    pub fn next_frame(&self) -> u32 {
        self.frame_count.max(1)
    }

    fn buffer_full(&mut self) -> CaptureOutcome {
        self.shared.metrics.record_dropped();
        self.shared.diagnostics().record_dropped();
        self.shared.request_stop(StopReason::BufferFull);
        CaptureOutcome::BufferFull
    }

    fn fail(&mut self, e: Error) -> CaptureOutcome {
        tracing::error!(error = %e, "capture failed");
        self.shared.request_stop(StopReason::Failed(e.to_string()));
        CaptureOutcome::Stopped
    }
}
