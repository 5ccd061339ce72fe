//! capbuf: a page-aligned, anonymous, process-shared bump arena (spec.md
//! §4.1). Consumers are expected to "consume in the order writes happened
//! and never past the producer's tail" — there is no locking here, only
//! the single-writer/bump-pointer discipline.

use std::io;
use std::os::raw::c_void;
use std::ptr;

use page_size::get as page_size;

use crate::error::{CaptureError, Result};

/// Minimum granularity reservations are rounded up to. The contract only
/// promises 32-bit (4 byte) alignment of the *reservation boundary*, not
/// of user records within it.
const RESERVE_ALIGN: usize = 4;

/// A single contiguous, page-aligned `mmap`'d region with a bump allocator
/// on top. Mirrors the teacher's `RingBuffer` (`src/sample/ring_buffer.rs`):
/// same `libc::mmap`/`MAP_FAILED` error path, same `Drop`-triggered
/// `munmap`, same "mmap a multiple of the page size" discipline.
pub struct ShmArena {
    base: *mut u8,
    size: usize,
    tail: usize,
    /// Bytes reserved since the last `begin`, used to detect a wrap that
    /// would overwrite a still-referenced prefix.
    since_begin: usize,
    head: Option<usize>,
}

// SAFETY: the arena itself does no synchronization; callers uphold the
// single-writer contract documented in spec.md §4.1. The pointer is to
// process-shared anonymous memory, not thread-local state, so sending the
// handle across threads is sound as long as that contract holds.
unsafe impl Send for ShmArena {}

impl ShmArena {
    /// Allocate a region sized between `min` and `max` bytes (inclusive),
    /// rounded up to a whole number of pages and to a 32-byte multiple per
    /// spec.md §4.1 ("Region size must be a 32-byte multiple").
    pub fn new(min: usize, max: usize) -> Result<Self> {
        let page = page_size();
        let mut size = min.max(page);
        size = ((size + page - 1) / page) * page;
        size = ((size + 31) / 32) * 32;
        if size > max.max(size) {
            // max below the page-rounded minimum: honour the minimum, a
            // misconfiguration rather than a fatal condition.
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(CaptureError::ArenaAlloc {
                inner: io::Error::last_os_error(),
            });
        }

        Ok(ShmArena {
            base: base as *mut u8,
            size,
            tail: 0,
            since_begin: 0,
            head: None,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Raw pointer to byte `offset` within the arena. Callers are
    /// responsible for staying within a reservation they hold.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size);
        unsafe { self.base.add(offset) }
    }

    /// Reset the overflow accumulator. If `head` is `Some(offset)`, future
    /// `reserve` calls are checked against wrapping past it — the oldest
    /// byte any downstream consumer still references.
    pub fn begin(&mut self, head: Option<usize>) {
        self.since_begin = 0;
        self.head = head;
        if let Some(h) = head {
            // Bytes already live between head and tail must count against
            // the next wrap's budget.
            self.since_begin = if self.tail >= h {
                self.tail - h
            } else {
                self.size - h + self.tail
            };
        }
    }

    /// Advance the tail by `n` bytes (rounded up for alignment), wrapping
    /// to the base if insufficient contiguous space remains before `end`.
    /// Returns the base offset of the reservation. Panics — per spec.md
    /// §4.1, this is a programming error, not a recoverable condition — if
    /// the wrap would overwrite the still-referenced head.
    pub fn reserve(&mut self, n: usize) -> usize {
        let n = ((n + RESERVE_ALIGN - 1) / RESERVE_ALIGN) * RESERVE_ALIGN;

        let base = if self.tail + n <= self.size {
            let b = self.tail;
            self.tail += n;
            b
        } else {
            // Wrap: wasted space at [tail, size) is accounted too.
            self.since_begin += self.size - self.tail;
            self.tail = n;
            0
        };

        self.since_begin += n;
        if self.since_begin > self.size {
            panic!(
                "capbuf overflow: {} bytes reserved since begin() exceeds arena size {} \
                 (a sniffer or writer did not honour the first-referenced-packet contract)",
                self.since_begin, self.size
            );
        }

        if self.tail == self.size {
            self.tail = 0;
        }

        base
    }

    /// Shrink the current reservation so the tail becomes `p`, refunding
    /// the difference from the overflow accumulator.
    pub fn truncate(&mut self, p: usize) {
        debug_assert!(p <= self.tail);
        let refund = self.tail - p;
        self.since_begin = self.since_begin.saturating_sub(refund);
        self.tail = p;
    }
}

impl Drop for ShmArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_advances_and_aligns() {
        let mut arena = ShmArena::new(4096, 4096).unwrap();
        let a = arena.reserve(10);
        let b = arena.reserve(10);
        assert_eq!(a, 0);
        assert_eq!(b, 12); // 10 rounded up to 12 (multiple of 4)
    }

    #[test]
    fn truncate_refunds_accounting() {
        let mut arena = ShmArena::new(4096, 4096).unwrap();
        arena.begin(None);
        arena.reserve(100);
        arena.truncate(40);
        assert_eq!(arena.tail(), 40);
    }

    #[test]
    #[should_panic(expected = "capbuf overflow")]
    fn wrap_past_head_panics() {
        let size = page_size();
        let mut arena = ShmArena::new(size, size).unwrap();
        arena.reserve(size - 8);
        arena.begin(Some(0));
        // Reserving again forces a wrap back past the still-referenced head.
        arena.reserve(size - 8);
    }

    #[test]
    fn begin_with_head_seeds_accounting() {
        let mut arena = ShmArena::new(4096, 4096).unwrap();
        arena.reserve(100);
        arena.begin(Some(50));
        // 50 bytes between head and tail already count against the budget.
        assert_eq!(arena.since_begin, 50);
    }
}
