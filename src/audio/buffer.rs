//! Lock-free ring buffer bridging two independently clocked callbacks
//!
//! Single producer (capture callback) and single consumer (render callback).
//! Each cursor is written only by its owning side and published with
//! release ordering; the other side observes it with acquire ordering, so
//! the sample copies always happen-before the cursor becomes visible.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// PCM sample types the bridge can carry
pub trait Sample: Copy + Send + Sync + 'static {
    /// The value written for digital silence
    const SILENCE: Self;
}

impl Sample for f32 {
    const SILENCE: Self = 0.0;
}

impl Sample for i16 {
    const SILENCE: Self = 0;
}

/// Fixed-capacity store of interleaved frames shared by the two halves
pub struct RingBuffer<T: Sample> {
    storage: Box<[UnsafeCell<T>]>,
    capacity: usize,
    channels: usize,
    /// Total frames ever committed by the producer
    write: CachePadded<AtomicUsize>,
    /// Total frames ever consumed
    read: CachePadded<AtomicUsize>,
    /// Frames the producer had to drop because the buffer was full
    overrun_frames: AtomicUsize,
}

// SAFETY: the producer only writes slots in [write, read + capacity) and the
// consumer only reads slots in [read, write). The two regions never overlap
// and the cursor handoff is release/acquire ordered.
unsafe impl<T: Sample> Sync for RingBuffer<T> {}
unsafe impl<T: Sample> Send for RingBuffer<T> {}

impl<T: Sample> RingBuffer<T> {
    fn new(capacity: usize, channels: usize) -> Self {
        assert!(capacity > 0 && channels > 0, "ring buffer needs a non-zero shape");
        let storage = (0..capacity * channels)
            .map(|_| UnsafeCell::new(T::SILENCE))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            storage,
            capacity,
            channels,
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            overrun_frames: AtomicUsize::new(0),
        }
    }

    /// Capacity in frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples per frame
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames currently buffered, as seen from any thread
    pub fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.saturating_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames dropped on the producer side
    pub fn overrun_frames(&self) -> usize {
        self.overrun_frames.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity as f32
    }

    fn slot_ptr(&self, frame: usize) -> *mut T {
        let sample = (frame % self.capacity) * self.channels;
        // UnsafeCell<T> is repr(transparent), so the cells form a contiguous [T].
        unsafe { UnsafeCell::raw_get(self.storage.as_ptr().add(sample)) }
    }

    /// Split a run of `frames` starting at absolute frame `start` into the
    /// contiguous piece before the wrap point and the remainder.
    fn spans(&self, start: usize, frames: usize) -> (usize, usize) {
        let offset = start % self.capacity;
        let first = frames.min(self.capacity - offset);
        (first, frames - first)
    }
}

/// Create a bridge holding `capacity` frames of `channels` interleaved samples
pub fn bridge<T: Sample>(capacity: usize, channels: usize) -> (BridgeProducer<T>, BridgeConsumer<T>) {
    let ring = Arc::new(RingBuffer::new(capacity, channels));
    (
        BridgeProducer {
            ring: ring.clone(),
            write: 0,
        },
        BridgeConsumer { ring, read: 0 },
    )
}

/// Writing half, owned by the capture side
pub struct BridgeProducer<T: Sample> {
    ring: Arc<RingBuffer<T>>,
    write: usize,
}

impl<T: Sample> BridgeProducer<T> {
    /// Append interleaved frames.
    ///
    /// Writes as many whole frames as fit and returns that count. Frames that
    /// do not fit are dropped (newest first) and counted as overrun; the
    /// reader's region is never touched.
    pub fn write(&mut self, samples: &[T]) -> usize {
        let ring = &*self.ring;
        let frames = samples.len() / ring.channels;
        let read = ring.read.load(Ordering::Acquire);
        let free = ring.capacity - (self.write - read);
        let count = frames.min(free);

        if count > 0 {
            let (first, second) = ring.spans(self.write, count);
            let ch = ring.channels;
            // SAFETY: [write, write + count) lies in the producer-owned region.
            unsafe {
                std::ptr::copy_nonoverlapping(samples.as_ptr(), ring.slot_ptr(self.write), first * ch);
                if second > 0 {
                    std::ptr::copy_nonoverlapping(
                        samples.as_ptr().add(first * ch),
                        ring.slot_ptr(self.write + first),
                        second * ch,
                    );
                }
            }
            self.write += count;
            ring.write.store(self.write, Ordering::Release);
        }

        if count < frames {
            ring.overrun_frames.fetch_add(frames - count, Ordering::Relaxed);
        }
        count
    }

    /// Frames that can be written without dropping
    pub fn free(&self) -> usize {
        let read = self.ring.read.load(Ordering::Acquire);
        self.ring.capacity - (self.write - read)
    }

    pub fn ring(&self) -> &RingBuffer<T> {
        &self.ring
    }
}

/// Reading half, owned by the render side
pub struct BridgeConsumer<T: Sample> {
    ring: Arc<RingBuffer<T>>,
    read: usize,
}

impl<T: Sample> BridgeConsumer<T> {
    /// Frames buffered and ready to read
    pub fn available(&self) -> usize {
        self.ring.write.load(Ordering::Acquire) - self.read
    }

    /// Copy exactly `out.len() / channels` frames into `out`.
    ///
    /// Returns `false` without consuming anything when fewer frames are
    /// buffered; callers check [`available`](Self::available) first and
    /// substitute silence on a short buffer.
    pub fn read_into(&mut self, out: &mut [T]) -> bool {
        let ring = &*self.ring;
        let frames = out.len() / ring.channels;
        if frames > self.available() {
            return false;
        }
        if frames == 0 {
            return true;
        }

        let (first, second) = ring.spans(self.read, frames);
        let ch = ring.channels;
        // SAFETY: [read, read + frames) was published by the producer.
        unsafe {
            std::ptr::copy_nonoverlapping(ring.slot_ptr(self.read), out.as_mut_ptr(), first * ch);
            if second > 0 {
                std::ptr::copy_nonoverlapping(
                    ring.slot_ptr(self.read + first),
                    out.as_mut_ptr().add(first * ch),
                    second * ch,
                );
            }
        }
        self.read += frames;
        ring.read.store(self.read, Ordering::Release);
        true
    }

    /// Discard up to `frames` of the oldest buffered frames
    pub fn skip(&mut self, frames: usize) -> usize {
        let count = frames.min(self.available());
        if count > 0 {
            self.read += count;
            self.ring.read.store(self.read, Ordering::Release);
        }
        count
    }

    /// Discard everything currently buffered
    pub fn clear(&mut self) -> usize {
        self.skip(usize::MAX)
    }

    pub fn ring(&self) -> &RingBuffer<T> {
        &self.ring
    }
}

/// Anything the render side can pull captured frames from without blocking
pub trait FrameSource {
    /// Frames ready to read
    fn available(&self) -> usize;

    /// Fill `out` completely, or consume nothing and return `false`
    fn read_into(&mut self, out: &mut [f32]) -> bool;

    /// Drop up to `frames` of the oldest frames; returns how many were dropped
    fn skip(&mut self, frames: usize) -> usize;
}

impl FrameSource for BridgeConsumer<f32> {
    fn available(&self) -> usize {
        BridgeConsumer::available(self)
    }

    fn read_into(&mut self, out: &mut [f32]) -> bool {
        BridgeConsumer::read_into(self, out)
    }

    fn skip(&mut self, frames: usize) -> usize {
        BridgeConsumer::skip(self, frames)
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn available(&self) -> usize {
        (**self).available()
    }

    fn read_into(&mut self, out: &mut [f32]) -> bool {
        (**self).read_into(out)
    }

    fn skip(&mut self, frames: usize) -> usize {
        (**self).skip(frames)
    }
}

/// Bridge capacity for a stream: one second of audio, but never fewer
/// than 32 periods.
pub fn bridge_capacity(sample_rate: u32, period_frames: usize) -> usize {
    (sample_rate as usize).max(period_frames * 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bridge_basic() {
        let (mut tx, mut rx) = bridge::<f32>(8, 2);
        assert_eq!(rx.available(), 0);

        assert_eq!(tx.write(&[1.0, 2.0, 3.0, 4.0]), 2);
        assert_eq!(rx.available(), 2);

        let mut out = [0.0f32; 4];
        assert!(rx.read_into(&mut out));
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert!(rx.ring().is_empty());
    }

    #[test]
    fn test_short_read_consumes_nothing() {
        let (mut tx, mut rx) = bridge::<i16>(8, 1);
        tx.write(&[1, 2, 3]);

        let mut out = [0i16; 4];
        assert!(!rx.read_into(&mut out));
        assert_eq!(rx.available(), 3);
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn test_overrun_drops_newest() {
        let (mut tx, mut rx) = bridge::<i16>(4, 1);
        assert_eq!(tx.write(&[1, 2, 3]), 3);
        assert_eq!(tx.write(&[4, 5, 6]), 1);
        assert_eq!(tx.ring().overrun_frames(), 2);

        let mut out = [0i16; 4];
        assert!(rx.read_into(&mut out));
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_wraparound_read() {
        let (mut tx, mut rx) = bridge::<f32>(4, 1);
        let mut out = [0.0f32; 3];
        tx.write(&[1.0, 2.0, 3.0]);
        assert!(rx.read_into(&mut out));

        // Next write straddles the end of storage.
        tx.write(&[4.0, 5.0, 6.0]);
        assert!(rx.read_into(&mut out));
        assert_eq!(out, [4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_full_capacity_read_straddles_wrap() {
        let (mut tx, mut rx) = bridge::<i16>(8, 2);
        let lead: Vec<i16> = (0..7 * 2).collect();
        assert_eq!(tx.write(&lead), 7);
        let mut drain = [0i16; 7 * 2];
        assert!(rx.read_into(&mut drain));
        assert_eq!(drain.as_slice(), lead.as_slice());

        // Both cursors sit at capacity - 1; a full-capacity write wraps after one frame.
        let full: Vec<i16> = (100..100 + 8 * 2).collect();
        assert_eq!(tx.write(&full), 8);
        assert_eq!(tx.write(&[-1, -1]), 0);
        assert_eq!(tx.ring().overrun_frames(), 1);
        assert_eq!(rx.available(), 8);

        let mut out = [0i16; 8 * 2];
        assert!(!rx.read_into(&mut [0i16; 9 * 2]));
        assert!(rx.read_into(&mut out));
        assert_eq!(out.as_slice(), full.as_slice());
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn test_skip_discards_oldest() {
        let (mut tx, mut rx) = bridge::<i16>(16, 1);
        tx.write(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(rx.skip(4), 4);

        let mut out = [0i16; 2];
        assert!(rx.read_into(&mut out));
        assert_eq!(out, [5, 6]);
        assert_eq!(rx.skip(10), 0);
    }

    #[test]
    fn test_bridge_capacity() {
        assert_eq!(bridge_capacity(48_000, 256), 48_000);
        assert_eq!(bridge_capacity(8_000, 512), 16_384);
    }

    #[test]
    fn test_cross_thread_order() {
        let (mut tx, mut rx) = bridge::<i16>(64, 1);
        let producer = std::thread::spawn(move || {
            let mut next = 0i16;
            while next < 10_000 {
                let chunk: Vec<i16> = (next..next.saturating_add(7).min(10_000)).collect();
                let written = tx.write(&chunk);
                next += written as i16;
                if written == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0i16;
        let mut out = [0i16; 5];
        while expected < 9_995 {
            if rx.available() >= out.len() {
                assert!(rx.read_into(&mut out));
                for sample in out {
                    assert_eq!(sample, expected);
                    expected += 1;
                }
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0usize..40).prop_map(Op::Write), (0usize..40).prop_map(Op::Read)]
    }

    proptest! {
        #[test]
        fn prop_reads_return_writes_in_order(
            capacity in 1usize..48,
            channels in 1usize..4,
            ops in proptest::collection::vec(op(), 1..200),
        ) {
            let (mut tx, mut rx) = bridge::<i16>(capacity, channels);
            let mut next_in = 0i16;
            let mut accepted: std::collections::VecDeque<i16> = Default::default();

            for op in ops {
                match op {
                    Op::Write(frames) => {
                        let samples: Vec<i16> = (0..frames * channels)
                            .map(|i| next_in.wrapping_add(i as i16))
                            .collect();
                        let written = tx.write(&samples);
                        prop_assert!(written <= frames);
                        accepted.extend(&samples[..written * channels]);
                        next_in = next_in.wrapping_add((frames * channels) as i16);
                    }
                    Op::Read(frames) => {
                        // Never read more than was written.
                        if frames > rx.available() {
                            continue;
                        }
                        let mut out = vec![0i16; frames * channels];
                        prop_assert!(rx.read_into(&mut out));
                        for sample in out {
                            prop_assert_eq!(Some(sample), accepted.pop_front());
                        }
                    }
                }
                prop_assert_eq!(rx.available() * channels, accepted.len());
            }
        }
    }
}
