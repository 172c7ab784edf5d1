//! Error types for rawrec.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using rawrec's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for recording operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough usable memory to carve the minimum number of slots.
    #[error("slot allocation failed: {0}")]
    Allocation(String),

    /// A compressed payload did not fit in its slot.
    #[error("compressed frame overflowed its slot: {produced} bytes produced, {capacity} available")]
    CompressionOverflow {
        /// Bytes the compressor reported.
        produced: usize,
        /// Payload capacity of the slot.
        capacity: usize,
    },

    /// Sentinel or ordering check failed for one frame.
    #[error("frame integrity check failed: {0}")]
    Integrity(IntegrityFault),

    /// The storage device cannot take any more data.
    #[error("storage exhausted: {0}")]
    StorageExhausted(String),

    /// The hardware transfer for a slot never signalled completion.
    #[error("hardware transfer for slot {slot} timed out after {waited:?}")]
    HardwareTransferTimeout {
        /// Slot the transfer was targeting.
        slot: usize,
        /// How long we waited.
        waited: Duration,
    },

    /// Operation not valid in the current recording state.
    #[error("invalid recorder state: {0}")]
    InvalidState(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether this error ends the recording session.
    ///
    /// Per-frame faults (integrity, transfer timeout) are absorbed into
    /// diagnostics; everything else stops the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Integrity(_) | Error::HardwareTransferTimeout { .. }
        )
    }
}

/// A per-frame integrity fault detected by the disk writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFault {
    /// The sentinel after the payload was overwritten (transfer overran).
    Overflow {
        /// Slot index.
        slot: usize,
        /// Frame number stored in the slot.
        frame: u32,
    },
    /// The payload end sentinel is still present (transfer never finished).
    Incomplete {
        /// Slot index.
        slot: usize,
        /// Frame number stored in the slot.
        frame: u32,
    },
    /// Frames reached the writer out of sequence.
    OutOfOrder {
        /// Slot index.
        slot: usize,
        /// Frame number found.
        frame: u32,
        /// Frame number expected.
        expected: u32,
    },
    /// A slot in the queue was not in the FULL state.
    UnexpectedStatus {
        /// Slot index.
        slot: usize,
    },
}

impl std::fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityFault::Overflow { slot, frame } => {
                write!(f, "data corruption at slot {slot}, frame {frame}")
            }
            IntegrityFault::Incomplete { slot, frame } => {
                write!(f, "slot {slot}, frame {frame} not completely transferred")
            }
            IntegrityFault::OutOfOrder {
                slot,
                frame,
                expected,
            } => write!(
                f,
                "frame order error: slot {slot}, frame {frame}, expected {expected}"
            ),
            IntegrityFault::UnexpectedStatus { slot } => {
                write!(f, "slot {slot} queued for writing but not full")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(Error::Allocation("x".into()).is_fatal());
        assert!(Error::StorageExhausted("card full".into()).is_fatal());
        assert!(!Error::Integrity(IntegrityFault::UnexpectedStatus { slot: 1 }).is_fatal());
        assert!(
            !Error::HardwareTransferTimeout {
                slot: 0,
                waited: Duration::from_millis(5)
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_integrity_display() {
        let fault = IntegrityFault::OutOfOrder {
            slot: 3,
            frame: 9,
            expected: 8,
        };
        assert_eq!(
            fault.to_string(),
            "frame order error: slot 3, frame 9, expected 8"
        );
    }
}
