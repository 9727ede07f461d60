//! Single-producer/single-consumer sample ring buffer
//!
//! Thin wrapper over an `rtrb` ring giving the slice-oriented contract the
//! rest of the pipeline works in: partial writes, non-destructive peeks and
//! copy-free skips. One writer, one reader, no locking; the coordinator
//! enforces the one-writer/one-reader discipline. Writes never overwrite
//! unread data and reads never block; shortfall handling (zero-filling on
//! underrun) is the caller's job.

use rtrb::chunks::ChunkError;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::types::Sample;

/// Fixed-capacity SPSC float ring buffer, split into its two endpoints.
pub struct SampleRing;

impl SampleRing {
    /// Create a ring with room for `capacity` samples and split it into
    /// writer and reader halves.
    pub fn with_capacity(capacity: usize) -> (RingWriter, RingReader) {
        let (producer, consumer) = RingBuffer::new(capacity);
        (RingWriter { producer }, RingReader { consumer })
    }
}

/// Write endpoint of a [`SampleRing`]. Held by the fill thread.
pub struct RingWriter {
    producer: Producer<Sample>,
}

impl RingWriter {
    /// Append as many of `data`'s samples as fit; returns how many were
    /// written. Never overwrites unread data.
    pub fn write(&mut self, data: &[Sample]) -> usize {
        let writable = self.producer.slots().min(data.len());
        if writable == 0 {
            return 0;
        }
        // Cannot fail: writable <= free slots and we are the only producer.
        let chunk = match self.producer.write_chunk_uninit(writable) {
            Ok(chunk) => chunk,
            Err(ChunkError::TooFewSlots(_)) => return 0,
        };
        let copied = chunk.fill_from_iter(data[..writable].iter().copied());
        debug_assert_eq!(copied, writable);
        copied
    }

    /// Number of samples that can currently be written without overwriting.
    pub fn write_space(&self) -> usize {
        self.producer.slots()
    }

    /// Total capacity of the ring in samples.
    pub fn capacity(&self) -> usize {
        self.producer.buffer().capacity()
    }

    /// Number of samples currently buffered (written but not yet read).
    pub fn buffered(&self) -> usize {
        self.capacity() - self.producer.slots()
    }
}

/// Read endpoint of a [`SampleRing`]. Held by the real-time reader.
pub struct RingReader {
    consumer: Consumer<Sample>,
}

impl RingReader {
    /// Remove up to `out.len()` samples into `out`; returns how many were
    /// copied. Does not touch the remainder of `out` on shortfall.
    pub fn read(&mut self, out: &mut [Sample]) -> usize {
        let readable = self.consumer.slots().min(out.len());
        if readable == 0 {
            return 0;
        }
        let chunk = match self.consumer.read_chunk(readable) {
            Ok(chunk) => chunk,
            Err(ChunkError::TooFewSlots(_)) => return 0,
        };
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..first.len() + second.len()].copy_from_slice(second);
        chunk.commit_all();
        readable
    }

    /// Copy up to `out.len()` samples into `out` without removing them.
    pub fn peek(&mut self, out: &mut [Sample]) -> usize {
        let readable = self.consumer.slots().min(out.len());
        if readable == 0 {
            return 0;
        }
        let chunk = match self.consumer.read_chunk(readable) {
            Ok(chunk) => chunk,
            Err(ChunkError::TooFewSlots(_)) => return 0,
        };
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..first.len() + second.len()].copy_from_slice(second);
        // Dropping the chunk without committing leaves the data in place.
        readable
    }

    /// Discard up to `count` samples without copying; returns how many were
    /// discarded.
    pub fn skip(&mut self, count: usize) -> usize {
        let readable = self.consumer.slots().min(count);
        if readable == 0 {
            return 0;
        }
        match self.consumer.read_chunk(readable) {
            Ok(chunk) => {
                chunk.commit_all();
                readable
            }
            Err(ChunkError::TooFewSlots(_)) => 0,
        }
    }

    /// Number of samples available to read.
    pub fn read_space(&self) -> usize {
        self.consumer.slots()
    }
}
