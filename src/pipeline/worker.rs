//! Copy/compress worker.
//!
//! A single background thread that takes capture requests in order. Without
//! compression it starts a hardware transfer into the slot and waits for
//! the completion callback; with compression it encodes the frame into the
//! slot, shrinks the slot to the encoded size and queues it for writing.

use super::capture::WorkerMessage;
use super::shared::{Shared, StopReason};
use super::transfer::{Compressor, RawFrame, TransferEngine, TransferTarget};
use crate::error::{Error, Result};
use crate::format::{FrameHeader, mark_complete};
use crate::observability::span_copy_worker;
use kanal::Receiver;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What the worker uses to fill slots.
pub enum FrameProcessor {
    /// Asynchronous crop copy.
    Transfer(Box<dyn TransferEngine>),
    /// Synchronous compression.
    Compress(Box<dyn Compressor>),
}

impl std::fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameProcessor::Transfer(_) => f.write_str("Transfer"),
            FrameProcessor::Compress(_) => f.write_str("Compress"),
        }
    }
}

/// The copy/compress worker.
#[derive(Debug)]
pub struct CopyWorker {
    shared: Arc<Shared>,
    messages: Receiver<WorkerMessage>,
    processor: FrameProcessor,
    transfer_timeout: Duration,
    header_size: usize,
}

impl CopyWorker {
    /// Create a worker reading from `messages`.
    pub fn new(
        shared: Arc<Shared>,
        messages: Receiver<WorkerMessage>,
        processor: FrameProcessor,
        transfer_timeout: Duration,
    ) -> Self {
        let header_size = shared.pool().layout().header_size;
        Self {
            shared,
            messages,
            processor,
            transfer_timeout,
            header_size,
        }
    }

    /// Run on a new thread; the handle gives the processor back.
    pub fn spawn(self) -> Result<JoinHandle<FrameProcessor>> {
        let span = span_copy_worker(self.shared.metrics.name());
        let handle = thread::Builder::new()
            .name("rawrec-copy".to_string())
            .spawn(move || {
                let _guard = span.enter();
                self.run()
            })?;
        Ok(handle)
    }

    /// Process messages until shutdown; returns the processor.
    pub fn run(mut self) -> FrameProcessor {
        tracing::debug!("copy worker started");
        while let Ok(message) = self.messages.recv() {
            let (slot, frame) = match message {
                WorkerMessage::Shutdown => break,
                WorkerMessage::Process { slot, frame } => (slot, frame),
            };
            if let Err(e) = self.process(slot, frame) {
                if e.is_fatal() {
                    tracing::error!(slot, error = %e, "copy worker failed");
                    self.shared.request_stop(StopReason::Failed(e.to_string()));
                } else {
                    tracing::warn!(slot, error = %e, "frame not processed");
                }
            }
        }
        tracing::debug!("copy worker stopped");
        self.processor
    }

    fn process(&mut self, slot: usize, frame: RawFrame) -> Result<()> {
        let result = match self.processor {
            FrameProcessor::Transfer(_) => self.transfer(slot, frame),
            FrameProcessor::Compress(_) => self.compress(slot, frame),
        };
        if result.is_err() {
            self.shared.busy.store(false, Ordering::Release);
        }
        result
    }

    fn transfer(&mut self, index: usize, frame: RawFrame) -> Result<()> {
        let FrameProcessor::Transfer(engine) = &mut self.processor else {
            return Err(Error::InvalidState("no transfer engine".into()));
        };
        let slot = self
            .shared
            .pool()
            .slot(index)
            .copied()
            .ok_or_else(|| Error::InvalidState(format!("no slot {index}")))?;

        // a transfer that outlives its timeout must not clear `busy` for
        // the frame after it
        let generation = self.shared.begin_transfer();
        let (done_tx, done_rx) = kanal::bounded::<Result<()>>(1);
        let error_tx = done_tx.clone();
        let on_complete = {
            let shared = Arc::clone(&self.shared);
            Box::new(move || {
                if shared.finish_transfer(generation) {
                    let _ = done_tx.send(Ok(()));
                } else {
                    tracing::debug!(generation, "late transfer completion ignored");
                }
            })
        };
        let on_error = {
            let shared = Arc::clone(&self.shared);
            Box::new(move |e: Error| {
                if shared.finish_transfer(generation) {
                    let _ = error_tx.send(Err(e));
                } else {
                    tracing::debug!(generation, error = %e, "late transfer error ignored");
                }
            })
        };

        let started = Instant::now();
        let target = TransferTarget {
            arenas: Arc::clone(&self.shared.arenas),
            address: slot.address + self.header_size,
        };
        if let Err(e) = engine.start_async_copy(frame, target, on_error, on_complete) {
            self.shared.retire_transfer();
            self.shared.abandon(index);
            return Err(e);
        }

        match done_rx.recv_timeout(self.transfer_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // the writer reports the slot through its sentinel
                self.shared.abandon(index);
                tracing::warn!(
                    slot = index,
                    frame = slot.frame_number,
                    error = %e,
                    "transfer failed"
                );
                Ok(())
            }
            Err(_) => {
                let waited = started.elapsed();
                self.shared.retire_transfer();
                self.shared.abandon(index);
                self.shared.diagnostics().record_transfer_timeout();
                self.shared.metrics.record_transfer_timeout();
                tracing::warn!(
                    slot = index,
                    frame = slot.frame_number,
                    waited_ms = waited.as_millis() as u64,
                    "hardware transfer timed out"
                );
                Err(Error::HardwareTransferTimeout {
                    slot: index,
                    waited,
                })
            }
        }
    }

    fn compress(&mut self, index: usize, frame: RawFrame) -> Result<()> {
        let FrameProcessor::Compress(compressor) = &mut self.processor else {
            return Err(Error::InvalidState("no compressor".into()));
        };
        let (slot, capacity) = {
            let pool = self.shared.pool();
            let slot = pool
                .slot(index)
                .copied()
                .ok_or_else(|| Error::InvalidState(format!("no slot {index}")))?;
            (slot, pool.layout().payload_capacity(slot.total_size))
        };

        // SAFETY: the slot is FULL and not queued, so nothing else touches
        // its payload until it is marked complete below.
        let dst = unsafe {
            self.shared
                .arenas
                .slice_mut(slot.address + self.header_size, capacity)?
        };
        let produced = compressor.compress(frame.data(), frame.geometry(), dst)?;

        let mut pool = self.shared.pool();
        let shrunk = pool.shrink(index, produced)?;
        let arenas = &self.shared.arenas;
        arenas.write_u32(
            shrunk.address + FrameHeader::SIZE_OFFSET,
            shrunk.total_size as u32,
        )?;
        mark_complete(arenas, &shrunk, self.header_size)?;
        if !self.shared.pre_rolling.load(Ordering::Acquire) {
            self.shared.queue.push(index)?;
        }
        self.shared.busy.store(false, Ordering::Release);
        drop(pool);

        tracing::trace!(
            slot = index,
            frame = shrunk.frame_number,
            produced,
            capacity,
            "frame compressed"
        );
        Ok(())
    }
}
