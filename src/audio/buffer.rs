//! Lock-free byte ring buffer between the decode thread and the hardware callback
//!
//! Single-producer single-consumer. The writer only advances `tail`, the reader
//! only advances `head`; both indices run modulo `2 * capacity` so a full buffer
//! is distinguishable from an empty one without sacrificing a byte. Index
//! publication uses release stores paired with acquire loads, which is the only
//! synchronization between the two sides.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner {
    data: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    /// Read position in `[0, 2 * capacity)`
    head: CachePadded<AtomicUsize>,
    /// Write position in `[0, 2 * capacity)`
    tail: CachePadded<AtomicUsize>,
    /// Writes rejected for lack of space
    overflow_count: AtomicUsize,
}

// SAFETY: the byte storage is only touched through `RingWriter` (region
// `[tail, head + capacity)`) and `RingReader` (region `[head, tail)`). Each half
// is unique and not `Clone`, and the regions never overlap because each side
// publishes its index with `Release` only after it has finished with the bytes.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn data_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }

    #[inline]
    fn advance(&self, pos: usize, n: usize) -> usize {
        (pos + n) % (2 * self.capacity)
    }

    #[inline]
    fn used(&self, head: usize, tail: usize) -> usize {
        (tail + 2 * self.capacity - head) % (2 * self.capacity)
    }

    #[inline]
    fn offset(&self, pos: usize) -> usize {
        if pos >= self.capacity {
            pos - self.capacity
        } else {
            pos
        }
    }
}

/// Constructor namespace for the ring buffer halves
pub struct RingBuffer;

impl RingBuffer {
    /// Allocate a ring of `capacity` bytes and split it into its two halves.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> (RingWriter, RingReader) {
        assert!(capacity > 0, "Ring buffer capacity must be non-zero");

        let data: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        let inner = Arc::new(Inner {
            data,
            capacity,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            overflow_count: AtomicUsize::new(0),
        });

        (
            RingWriter {
                inner: inner.clone(),
            },
            RingReader { inner },
        )
    }
}

/// Producer half, owned by the decode side
pub struct RingWriter {
    inner: Arc<Inner>,
}

impl RingWriter {
    /// Write all of `bytes` or nothing.
    ///
    /// Returns false when there is not enough free space; the buffer is left
    /// untouched so the caller can drop or pace the packet.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        let inner = &*self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);
        let free = inner.capacity - inner.used(head, tail);

        if bytes.len() > free {
            inner.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if bytes.is_empty() {
            return true;
        }

        let start = inner.offset(tail);
        let first = bytes.len().min(inner.capacity - start);
        // SAFETY: `[tail, tail + len)` lies in the free region, which the reader
        // will not touch until the tail store below publishes it.
        unsafe {
            let base = inner.data_ptr();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), first);
            std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), base, bytes.len() - first);
        }

        inner
            .tail
            .store(inner.advance(tail, bytes.len()), Ordering::Release);
        true
    }

    /// Bytes that can currently be written
    pub fn available_write(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        self.inner.capacity - self.inner.used(head, tail)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of writes rejected because the ring was full
    pub fn overflow_count(&self) -> usize {
        self.inner.overflow_count.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the hardware callback side
pub struct RingReader {
    inner: Arc<Inner>,
}

impl RingReader {
    /// Zero-copy view of up to `max` readable bytes.
    ///
    /// The slice is contiguous, so it can be shorter than what is available when
    /// the readable region wraps. Nothing is consumed until [`commit_read`].
    ///
    /// [`commit_read`]: RingReader::commit_read
    pub fn read(&self, max: usize) -> &[u8] {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        let start = inner.offset(head);
        let len = max
            .min(inner.used(head, tail))
            .min(inner.capacity - start);

        // SAFETY: `[head, head + len)` was published by the writer's release
        // store and stays untouched until the reader advances `head`.
        unsafe { std::slice::from_raw_parts(inner.data_ptr().add(start), len) }
    }

    /// Consume `n` bytes previously observed through [`read`](RingReader::read).
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the readable byte count.
    pub fn commit_read(&mut self, n: usize) {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        assert!(n <= inner.used(head, tail), "commit past written data");
        inner.head.store(inner.advance(head, n), Ordering::Release);
    }

    /// Copy exactly `dst.len()` bytes out, or nothing if fewer are available
    pub fn pop_exact(&mut self, dst: &mut [u8]) -> bool {
        if self.available_read() < dst.len() {
            return false;
        }

        let mut copied = 0;
        while copied < dst.len() {
            let chunk = self.read(dst.len() - copied);
            let n = chunk.len();
            dst[copied..copied + n].copy_from_slice(chunk);
            self.commit_read(n);
            copied += n;
        }
        true
    }

    /// Drop everything currently readable
    pub fn discard_all(&mut self) {
        let n = self.available_read();
        self.commit_read(n);
    }

    /// Bytes that can currently be read
    pub fn available_read(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        self.inner.used(head, tail)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.available_read() as f32 / self.inner.capacity as f32
    }
}

/// Reinterpret interleaved samples as native-endian bytes for the ring
pub fn samples_as_bytes(samples: &[f32], out: &mut [u8]) -> usize {
    let n = samples.len() * 4;
    for (sample, chunk) in samples.iter().zip(out[..n].chunks_exact_mut(4)) {
        chunk.copy_from_slice(&sample.to_ne_bytes());
    }
    n
}

/// Decode native-endian bytes into samples; `bytes.len()` must be a multiple of 4
pub fn bytes_to_samples(bytes: &[u8], out: &mut [f32]) -> usize {
    debug_assert_eq!(bytes.len() % 4, 0);
    let mut written = 0;
    for (chunk, sample) in bytes.chunks_exact(4).zip(out.iter_mut()) {
        *sample = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn test_ring_buffer_basic() {
        let (mut writer, mut reader) = RingBuffer::with_capacity(8);

        assert!(writer.write(&[1, 2, 3]));
        assert!(writer.write(&[4, 5]));
        assert_eq!(reader.available_read(), 5);

        assert_eq!(reader.read(10), &[1, 2, 3, 4, 5]);
        reader.commit_read(3);
        assert_eq!(reader.read(10), &[4, 5]);
        reader.commit_read(2);

        assert_eq!(reader.available_read(), 0);
        assert_eq!(writer.available_write(), 8);
    }

    #[test]
    fn test_write_is_all_or_nothing() {
        let (mut writer, reader) = RingBuffer::with_capacity(8);

        assert!(writer.write(&[0; 6]));
        assert!(!writer.write(&[9; 3]));

        assert_eq!(reader.available_read(), 6);
        assert_eq!(writer.available_write(), 2);
        assert_eq!(writer.overflow_count(), 1);
        assert_eq!(reader.read(8), &[0; 6]);
    }

    #[test]
    fn test_full_capacity_usable() {
        let (mut writer, mut reader) = RingBuffer::with_capacity(4);

        assert!(writer.write(&[1, 2, 3, 4]));
        assert_eq!(writer.available_write(), 0);
        assert!(!writer.write(&[5]));

        let mut out = [0u8; 4];
        assert!(reader.pop_exact(&mut out));
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(writer.available_write(), 4);
    }

    #[test]
    fn test_wrapped_read_is_split() {
        let (mut writer, mut reader) = RingBuffer::with_capacity(8);

        assert!(writer.write(&[0; 6]));
        reader.commit_read(6);
        assert!(writer.write(&[1, 2, 3, 4]));

        // Contiguous view stops at the end of storage
        assert_eq!(reader.read(8), &[1, 2]);

        let mut out = [0u8; 4];
        assert!(reader.pop_exact(&mut out));
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_pop_exact_underrun_leaves_data() {
        let (mut writer, mut reader) = RingBuffer::with_capacity(8);
        assert!(writer.write(&[7, 7]));

        let mut out = [0u8; 4];
        assert!(!reader.pop_exact(&mut out));
        assert_eq!(reader.available_read(), 2);
    }

    #[test]
    fn test_sample_byte_conversion() {
        let samples = [0.25f32, -1.0, 0.5];
        let mut bytes = [0u8; 12];
        assert_eq!(samples_as_bytes(&samples, &mut bytes), 12);

        let mut out = [0.0f32; 3];
        assert_eq!(bytes_to_samples(&bytes, &mut out), 3);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        const TOTAL: usize = 200_000;
        let (mut writer, mut reader) = RingBuffer::with_capacity(1000);

        let producer = std::thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let len = 7.min(TOTAL - next);
                let chunk: Vec<u8> = (next..next + len).map(|i| (i % 251) as u8).collect();
                if writer.write(&chunk) {
                    next += len;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0usize;
        while expected < TOTAL {
            let chunk = reader.read(64);
            let n = chunk.len();
            for (i, byte) in chunk.iter().enumerate() {
                assert_eq!(*byte, ((expected + i) % 251) as u8);
            }
            reader.commit_read(n);
            expected += n;
            if n == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert_eq!(reader.available_read(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(Vec<u8>),
        Read(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec(any::<u8>(), 0..24).prop_map(Op::Write),
            (0usize..24).prop_map(Op::Read),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_fifo_model(capacity in 1usize..40, ops in prop::collection::vec(op_strategy(), 1..200)) {
            let (mut writer, mut reader) = RingBuffer::with_capacity(capacity);
            let mut model: VecDeque<u8> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Write(bytes) => {
                        let fits = model.len() + bytes.len() <= capacity;
                        prop_assert_eq!(writer.write(&bytes), fits);
                        if fits {
                            model.extend(bytes);
                        }
                    }
                    Op::Read(max) => {
                        let chunk = reader.read(max).to_vec();
                        prop_assert!(chunk.len() <= max.min(model.len()));
                        for byte in &chunk {
                            prop_assert_eq!(Some(*byte), model.pop_front());
                        }
                        reader.commit_read(chunk.len());
                    }
                }
                prop_assert_eq!(reader.available_read(), model.len());
                prop_assert_eq!(writer.available_write(), capacity - model.len());
            }
        }
    }
}
