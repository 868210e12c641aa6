//! Byte ring buffer between the audio producer thread and the device callback.
//!
//! Single producer, single consumer. Positions grow monotonically; the index
//! into the backing storage is `position % capacity`, so occupancy is simply
//! `write - read`. A single mutex guards all mutations: the callback side only
//! performs a bounded copy under the lock, which keeps it realtime-safe.

use parking_lot::Mutex;

/// Minimum backing storage, matching the smallest useful device buffer.
pub const MIN_RING_BYTES: usize = 4096;

struct RingInner {
    buf: Box<[u8]>,
    read_pos: u64,
    write_pos: u64,
}

/// Fixed-capacity PCM byte ring. Does not allocate after construction.
pub struct PcmRing {
    inner: Mutex<RingInner>,
    capacity: usize,
}

impl PcmRing {
    /// Creates a ring of at least `bytes` capacity (clamped to
    /// [`MIN_RING_BYTES`]).
    pub fn new(bytes: usize) -> Self {
        let capacity = bytes.max(MIN_RING_BYTES);
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
            }),
            capacity,
        }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes up to `src.len()` bytes, returning how many were accepted
    /// (0 when full; never partial beyond the free space).
    pub fn push(&self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let cap = self.capacity as u64;

        let free = (cap - (inner.write_pos - inner.read_pos)) as usize;
        if free == 0 {
            return 0;
        }

        let to_write = src.len().min(free);
        let start = (inner.write_pos % cap) as usize;
        let first = to_write.min(self.capacity - start);
        inner.buf[start..start + first].copy_from_slice(&src[..first]);
        if first < to_write {
            inner.buf[..to_write - first].copy_from_slice(&src[first..to_write]);
        }

        inner.write_pos += to_write as u64;
        to_write
    }

    /// Reads up to `dst.len()` bytes, returning how many were produced
    /// (0 when empty).
    pub fn pop(&self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let cap = self.capacity as u64;

        let occupied = (inner.write_pos - inner.read_pos) as usize;
        if occupied == 0 {
            return 0;
        }

        let to_read = dst.len().min(occupied);
        let start = (inner.read_pos % cap) as usize;
        let first = to_read.min(self.capacity - start);
        dst[..first].copy_from_slice(&inner.buf[start..start + first]);
        if first < to_read {
            dst[first..to_read].copy_from_slice(&inner.buf[..to_read - first]);
        }

        inner.read_pos += to_read as u64;
        to_read
    }

    /// Resets both positions to zero and zeroes the backing storage.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.read_pos = 0;
        inner.write_pos = 0;
        inner.buf.fill(0);
    }

    /// Bytes currently buffered.
    pub fn occupancy(&self) -> usize {
        let inner = self.inner.lock();
        (inner.write_pos - inner.read_pos) as usize
    }

    /// Bytes that can be pushed before the ring is full.
    pub fn free_space(&self) -> usize {
        self.capacity - self.occupancy()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_clamped_to_minimum() {
        let ring = PcmRing::new(16);
        assert_eq!(ring.capacity(), MIN_RING_BYTES);
    }

    #[test]
    fn push_pop_round_trip() {
        let ring = PcmRing::new(MIN_RING_BYTES);
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(ring.push(&data), 256);
        assert_eq!(ring.occupancy(), 256);

        let mut out = [0u8; 256];
        assert_eq!(ring.pop(&mut out), 256);
        assert_eq!(&out[..], &data[..]);
        assert!(ring.is_empty());
    }

    #[test]
    fn push_is_bounded_by_free_space() {
        let ring = PcmRing::new(MIN_RING_BYTES);
        let big = vec![0xAB; MIN_RING_BYTES + 100];
        assert_eq!(ring.push(&big), MIN_RING_BYTES);
        assert_eq!(ring.free_space(), 0);
        assert_eq!(ring.push(&[1, 2, 3]), 0, "full ring accepts nothing");
    }

    #[test]
    fn pop_is_bounded_by_occupancy() {
        let ring = PcmRing::new(MIN_RING_BYTES);
        ring.push(&[1, 2, 3, 4]);
        let mut out = [0u8; 16];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(ring.pop(&mut out), 0, "empty ring produces nothing");
    }

    #[test]
    fn wrap_around_preserves_order() {
        let ring = PcmRing::new(MIN_RING_BYTES);
        let cap = ring.capacity();

        // Advance positions close to the end so the next writes wrap.
        let chunk = vec![0u8; cap - 8];
        assert_eq!(ring.push(&chunk), cap - 8);
        let mut sink = vec![0u8; cap - 8];
        assert_eq!(ring.pop(&mut sink), cap - 8);

        let data: Vec<u8> = (0..32).collect();
        assert_eq!(ring.push(&data), 32);
        let mut out = [0u8; 32];
        assert_eq!(ring.pop(&mut out), 32);
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn clear_resets_positions() {
        let ring = PcmRing::new(MIN_RING_BYTES);
        ring.push(&[9; 128]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.free_space(), ring.capacity());

        // Ring is usable again from position zero.
        ring.push(&[5, 6]);
        let mut out = [0u8; 2];
        assert_eq!(ring.pop(&mut out), 2);
        assert_eq!(out, [5, 6]);
    }
}
