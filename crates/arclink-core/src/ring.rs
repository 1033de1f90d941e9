use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer / single-consumer byte ring buffer.
///
/// Intended for the network thread (producer) feeding the emulation tick
/// thread (consumer) and vice versa, without locks. One slot is kept free so
/// `wp == rp` is unambiguously empty: a ring of capacity `N` holds at most
/// `N - 1` bytes.
///
/// Writes and reads are all-or-nothing. A write larger than the current free
/// space writes nothing, and a read larger than the buffered amount reads
/// nothing; callers size their requests from `used()`/`free()`.
struct Inner {
    buf: Box<[UnsafeCell<u8>]>,
    cap: usize,
    wp: AtomicUsize,
    rp: AtomicUsize,
}

// Safe because:
// - Only the writer half stores through `wp` and writes at `buf[wp..]`.
// - Only the reader half stores through `rp` and reads at `buf[rp..]`.
// - All coordination happens through the two atomics.
unsafe impl Sync for Inner {}

impl Inner {
    fn used_between(&self, wp: usize, rp: usize) -> usize {
        (self.cap + wp - rp) % self.cap
    }

    fn used(&self) -> usize {
        let wp = self.wp.load(Ordering::Acquire);
        let rp = self.rp.load(Ordering::Acquire);
        self.used_between(wp, rp)
    }

    fn free(&self) -> usize {
        self.cap - 1 - self.used()
    }

    fn clear(&self) {
        self.wp.store(0, Ordering::Release);
        self.rp.store(0, Ordering::Release);
    }

    /// Copy `src` into the ring starting at `at`, wrapping at most once.
    ///
    /// Caller must hold the writer role and have checked free space.
    unsafe fn copy_in(&self, at: usize, src: &[u8]) {
        let first = src.len().min(self.cap - at);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.buf[at].get(), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.buf[0].get(),
                    src.len() - first,
                );
            }
        }
    }

    /// Copy out of the ring starting at `at`, wrapping at most once.
    ///
    /// Caller must hold the reader role and have checked availability.
    unsafe fn copy_out(&self, at: usize, dst: &mut [u8]) {
        let first = dst.len().min(self.cap - at);
        unsafe {
            std::ptr::copy_nonoverlapping(self.buf[at].get(), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.buf[0].get(),
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }
}

/// Create a ring of `capacity` total slots (`capacity - 1` usable bytes) and
/// split it into its writer and reader halves.
pub fn byte_ring(capacity: usize) -> (RingWriter, RingReader) {
    let cap = capacity.max(2);
    let mut buf: Vec<UnsafeCell<u8>> = Vec::with_capacity(cap);
    buf.resize_with(cap, || UnsafeCell::new(0));

    let inner = Arc::new(Inner {
        buf: buf.into_boxed_slice(),
        cap,
        wp: AtomicUsize::new(0),
        rp: AtomicUsize::new(0),
    });

    (
        RingWriter {
            inner: Arc::clone(&inner),
        },
        RingReader { inner },
    )
}

pub struct RingWriter {
    inner: Arc<Inner>,
}

impl RingWriter {
    /// Append `data` to the ring. Returns false, writing nothing, when the
    /// data does not fit in the current free space.
    pub fn write(&self, data: &[u8]) -> bool {
        let rp = self.inner.rp.load(Ordering::Acquire);
        let wp = self.inner.wp.load(Ordering::Relaxed);
        let free = (self.inner.cap + rp - wp - 1) % self.inner.cap;
        if data.len() > free {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        unsafe { self.inner.copy_in(wp, data) };
        self.inner
            .wp
            .store((wp + data.len()) % self.inner.cap, Ordering::Release);
        true
    }

    pub fn used(&self) -> usize {
        self.inner.used()
    }

    pub fn free(&self) -> usize {
        self.inner.free()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

pub struct RingReader {
    inner: Arc<Inner>,
}

impl RingReader {
    fn read_at(&self, out: &mut [u8], advance: bool) -> bool {
        let wp = self.inner.wp.load(Ordering::Acquire);
        let rp = self.inner.rp.load(Ordering::Relaxed);
        if out.len() > self.inner.used_between(wp, rp) {
            return false;
        }
        if out.is_empty() {
            return true;
        }

        unsafe { self.inner.copy_out(rp, out) };
        if advance {
            self.inner
                .rp
                .store((rp + out.len()) % self.inner.cap, Ordering::Release);
        }
        true
    }

    /// Fill `out` from the ring and advance the read cursor. Returns false,
    /// reading nothing, when fewer than `out.len()` bytes are buffered.
    pub fn read(&self, out: &mut [u8]) -> bool {
        self.read_at(out, true)
    }

    /// Fill `out` without advancing the read cursor; pair with `consume`.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        self.read_at(out, false)
    }

    /// Advance the read cursor by `len` bytes without copying, clamped to the
    /// buffered amount.
    pub fn consume(&self, len: usize) {
        let wp = self.inner.wp.load(Ordering::Acquire);
        let rp = self.inner.rp.load(Ordering::Relaxed);
        let len = len.min(self.inner.used_between(wp, rp));
        self.inner
            .rp
            .store((rp + len) % self.inner.cap, Ordering::Release);
    }

    pub fn used(&self) -> usize {
        self.inner.used()
    }

    pub fn free(&self) -> usize {
        self.inner.free()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
