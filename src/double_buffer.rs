//! The per-sensor double buffer and its swap protocol.
//!
//! Every sensor owns a [`DoubleBuffer`]: two fixed-capacity byte regions
//! allocated once at startup and reused for the whole recording. The
//! capture thread fills the *active* slot; the writer drains the other one
//! a whole buffer window later. Swapping is driven by the producer — by
//! fill level for fixed-size records ([`DoubleBuffer::maybe_swap`]) or by
//! frame count for variable-size frames ([`DoubleBuffer::swap`]) — and the
//! writer hands a slot back by clearing it after serialization.
//!
//! Each slot sits behind its own mutex, so a record write and a drain can
//! never tear each other, and the active index is an atomic. The protocol
//! still has no hard barrier: the writer relies on the grace period to
//! start draining only after the producer has moved on. If a producer ever
//! swaps into a slot the writer has not cleared yet, that is detected here
//! and logged rather than silently interleaving two windows of data.

use log::warn;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Returned when a record would run past the end of a buffer.
///
/// An overrun means the declared sensor rate and the observed rate
/// disagree; the recording is misconfigured and the run must abort. The
/// offending record is not written, not even partially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrunError {
    /// Size of the rejected record.
    pub requested: usize,
    /// Bytes left in the buffer.
    pub remaining: usize,
    /// Total buffer capacity.
    pub capacity: usize,
}

impl fmt::Display for OverrunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "buffer overrun: record of {} bytes with {} of {} remaining",
            self.requested, self.remaining, self.capacity
        )
    }
}

impl Error for OverrunError {}

/// One fixed-capacity byte region of a pair.
///
/// The allocation never grows or shrinks; the logical fill level is
/// tracked separately as `offset`.
#[derive(Debug)]
pub struct SampleBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl SampleBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            offset: 0,
        }
    }

    /// Allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current logical fill level in bytes.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.offset
    }

    /// Whether the buffer has reached exactly its capacity.
    pub fn is_full(&self) -> bool {
        self.offset == self.capacity()
    }

    /// Appends a record at the current offset.
    pub fn write(&mut self, record: &[u8]) -> Result<(), OverrunError> {
        if record.len() > self.remaining() {
            return Err(OverrunError {
                requested: record.len(),
                remaining: self.remaining(),
                capacity: self.capacity(),
            });
        }
        self.data[self.offset..self.offset + record.len()].copy_from_slice(record);
        self.offset += record.len();
        Ok(())
    }

    /// The filled prefix of the buffer.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.offset]
    }

    /// Replaces the filled prefix with `bytes` and sets the fill level to
    /// match. Capacity is untouched, so the slot can be refilled to full
    /// size next cycle. Used by the writer to compact the world camera
    /// buffer after downsampling.
    pub fn replace_filled(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.capacity());
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.offset = bytes.len();
    }

    /// Resets the fill level, handing the slot back to the producer side.
    pub fn clear(&mut self) {
        self.offset = 0;
    }
}

/// A pair of [`SampleBuffer`]s with producer-driven swapping.
///
/// Exactly one capture thread may act as the producer (calling
/// [`write`](Self::write) and the swap methods); the writer thread accesses
/// slots by index through [`lock_slot`](Self::lock_slot). Which slot is
/// which is tracked by parity, matching the writer's chunk numbering.
#[derive(Debug)]
pub struct DoubleBuffer {
    slots: [Mutex<SampleBuffer>; 2],
    active: AtomicUsize,
    capacity: usize,
}

impl DoubleBuffer {
    /// Allocates both slots at `capacity` bytes each.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: [
                Mutex::new(SampleBuffer::new(capacity)),
                Mutex::new(SampleBuffer::new(capacity)),
            ],
            active: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Capacity of each slot in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index of the slot currently owned by the producer.
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Fill level of the producer's active slot.
    pub fn active_offset(&self) -> usize {
        let index = self.active_index();
        self.slots[index].lock().unwrap().offset()
    }

    /// Appends a record to the active slot.
    pub fn write(&self, record: &[u8]) -> Result<(), OverrunError> {
        let index = self.active_index();
        self.slots[index].lock().unwrap().write(record)
    }

    /// Swaps if the active slot is exactly full. Producers with fixed-size
    /// records call this before every write. Returns whether a swap
    /// happened.
    pub fn maybe_swap(&self) -> bool {
        let index = self.active_index();
        let full = self.slots[index].lock().unwrap().is_full();
        if full {
            self.flip(index);
        }
        full
    }

    /// Swaps unconditionally. For producers whose records vary in size and
    /// therefore swap on frame count rather than fill level.
    pub fn swap(&self) {
        self.flip(self.active_index());
    }

    /// Locks one slot for the writer to drain or inspect.
    pub fn lock_slot(&self, index: usize) -> MutexGuard<'_, SampleBuffer> {
        self.slots[index].lock().unwrap()
    }

    fn flip(&self, from: usize) {
        let next = 1 - from;
        let pending = self.slots[next].lock().unwrap().offset();
        if pending != 0 {
            // The grace period should have let the writer drain this slot
            // long ago; producing into it anyway would interleave two
            // windows of data.
            warn!("swapping into a buffer with {pending} bytes not yet drained");
        }
        self.active.store(next, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrun_is_detected_and_writes_nothing() {
        let buffer = DoubleBuffer::new(4);
        buffer.write(&[1, 2, 3]).unwrap();

        let err = buffer.write(&[4, 5]).unwrap_err();
        assert_eq!(
            err,
            OverrunError {
                requested: 2,
                remaining: 1,
                capacity: 4
            }
        );
        // The failed write left the offset alone.
        assert_eq!(buffer.active_offset(), 3);
        assert_eq!(buffer.lock_slot(0).filled(), &[1, 2, 3]);
    }

    #[test]
    fn swaps_exactly_once_at_capacity() {
        let buffer = DoubleBuffer::new(6);

        // Producer protocol: check for a swap before every record.
        for record in [[1u8, 2], [3, 4], [5, 6]] {
            assert!(!buffer.maybe_swap());
            buffer.write(&record).unwrap();
        }
        assert_eq!(buffer.active_index(), 0);

        // The next check sees a full slot and flips.
        assert!(buffer.maybe_swap());
        assert_eq!(buffer.active_index(), 1);

        // The full slot keeps its contents and offset until the writer
        // clears it.
        assert_eq!(buffer.lock_slot(0).offset(), 6);
        assert_eq!(buffer.lock_slot(0).filled(), &[1, 2, 3, 4, 5, 6]);

        // The fresh slot is empty and does not flip again.
        assert!(!buffer.maybe_swap());
        buffer.write(&[7, 8]).unwrap();
        assert_eq!(buffer.lock_slot(1).filled(), &[7, 8]);
    }

    #[test]
    fn unconditional_swap_alternates_slots() {
        let buffer = DoubleBuffer::new(16);
        buffer.write(&[1]).unwrap();
        buffer.swap();
        assert_eq!(buffer.active_index(), 1);
        buffer.write(&[2]).unwrap();
        buffer.lock_slot(0).clear();
        buffer.swap();
        assert_eq!(buffer.active_index(), 0);
        // Cleared by the writer, so the slot starts over.
        assert_eq!(buffer.active_offset(), 0);
    }

    #[test]
    fn writer_clear_hands_slot_back() {
        let buffer = DoubleBuffer::new(2);
        buffer.write(&[1, 2]).unwrap();
        buffer.maybe_swap();

        {
            let mut slot = buffer.lock_slot(0);
            assert_eq!(slot.filled(), &[1, 2]);
            slot.clear();
        }

        // Fill the second slot; swapping back in finds a clean buffer.
        buffer.write(&[3, 4]).unwrap();
        assert!(buffer.maybe_swap());
        assert_eq!(buffer.active_index(), 0);
        assert_eq!(buffer.active_offset(), 0);
    }

    #[test]
    fn replace_filled_compacts_but_keeps_capacity() {
        let mut buffer = SampleBuffer::new(8);
        buffer.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        buffer.replace_filled(&[9, 9]);
        assert_eq!(buffer.filled(), &[9, 9]);
        assert_eq!(buffer.capacity(), 8);
        buffer.clear();
        assert_eq!(buffer.remaining(), 8);
    }
}
