//! Latest encoded frame, shared between the cadence thread and readers.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

/// One published JPEG.
#[derive(Debug)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    /// Starts at 1 and increases by one per publish.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time since the frame was published.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.captured_at
    }
}

#[derive(Default)]
struct Slot {
    latest: Option<Arc<EncodedFrame>>,
    sequence: u64,
}

/// Single-writer, multi-reader holder of the most recent frame.
///
/// A frame is swapped in as a whole, so a reader always sees the bytes and
/// length of the same frame.
#[derive(Default)]
pub struct SharedFrameBuffer {
    slot: Mutex<Slot>,
}

impl SharedFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panicking reader cannot leave a half-written slot behind.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the current frame. Empty frames are dropped.
    pub fn publish(&self, data: Vec<u8>) -> Option<u64> {
        if data.is_empty() {
            return None;
        }
        let mut slot = self.lock();
        slot.sequence += 1;
        let frame = EncodedFrame {
            data,
            sequence: slot.sequence,
            captured_at: Utc::now(),
        };
        slot.latest = Some(Arc::new(frame));
        Some(slot.sequence)
    }

    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        self.lock().latest.clone()
    }

    /// Copy the latest frame into `dst`. Returns the copied size and the
    /// frame's sequence, or `None` when there is no frame or it does not fit.
    pub fn copy_into(&self, dst: &mut [u8]) -> Option<(usize, u64)> {
        let frame = self.latest()?;
        if frame.len() > dst.len() {
            return None;
        }
        dst[..frame.len()].copy_from_slice(&frame.data);
        Some((frame.len(), frame.sequence))
    }

    /// Number of frames published so far.
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Size of the latest frame, 0 if none.
    pub fn len(&self) -> usize {
        self.lock().latest.as_ref().map_or(0, |f| f.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
