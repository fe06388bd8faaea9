//! `Rb`: a fixed-capacity circular byte store with grow-to-double semantics.
//!
//! Mirrors `cbuff.c`'s `start`/`end`/`len`/`left` indices one-for-one, with
//! the read/write primitives made nonblocking-aware instead of relying on
//! `errno` out of band.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Rings start at this capacity when first created or grown from empty.
pub const DEFAULT_CAPACITY: usize = 64;

/// A circular byte store. `start` is the next read position, `end` is the
/// next write position; `left` tracks free bytes so that `start == end` is
/// ambiguous between empty and full (`left == cap` vs. `left == 0`).
#[derive(Debug)]
pub struct Rb {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    left: usize,
}

impl Rb {
    /// Allocates a new ring of capacity `n`. Empty, `cap == n`.
    pub fn create(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::OutOfMemory {
                context: "ring capacity must be nonzero",
            });
        }
        Ok(Self {
            buf: vec![0u8; n],
            start: 0,
            end: 0,
            left: n,
        })
    }

    /// Current capacity.
    pub fn cap(&self) -> usize {
        self.buf.len()
    }

    /// Number of occupied bytes.
    pub fn available(&self) -> usize {
        self.buf.len() - self.left
    }

    pub fn is_empty(&self) -> bool {
        self.left == self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.left == 0
    }

    /// Reallocates to a new capacity `n`, preserving content in logical
    /// order starting at offset 0. Fails if `n` is smaller than the
    /// currently occupied byte count.
    pub fn grow(&mut self, n: usize) -> Result<()> {
        let occupied = self.available();
        if n < occupied {
            return Err(Error::ShrinkBelowContent {
                occupied,
                requested: n,
            });
        }

        let mut new_buf = vec![0u8; n];
        for i in 0..occupied {
            new_buf[i] = self.buf[(self.start + i) % self.buf.len()];
        }

        self.buf = new_buf;
        self.start = 0;
        self.end = occupied;
        self.left = n - occupied;
        Ok(())
    }

    /// Doubles capacity (or allocates `DEFAULT_CAPACITY` if currently zero,
    /// which never happens in practice since `create` rejects 0, but kept
    /// to mirror the original's `len ? len * 2 : CBUFFSIZE` idiom).
    pub fn grow_double(&mut self) -> Result<()> {
        let next = if self.buf.is_empty() {
            DEFAULT_CAPACITY
        } else {
            self.buf.len() * 2
        };
        self.grow(next)
    }

    /// Issues a single nonblocking `read()` into the ring at `end`, bounded
    /// by the contiguous free region up to the physical end (or `start`, if
    /// that comes first). Returns the raw read result: negative would be an
    /// error translated by the caller via `errno`, `0` on EOF, positive on
    /// success. Advances `end` and decrements `left` on success.
    pub fn fill_from(&mut self, fd: RawFd) -> Result<isize> {
        if self.is_full() {
            return Err(Error::NoSpace);
        }

        let bound = if self.end < self.start {
            self.start
        } else {
            self.buf.len()
        };
        let len = bound - self.end;

        let slice = &mut self.buf[self.end..self.end + len];
        match nix::unistd::read(fd, slice) {
            Ok(count) => {
                self.end = (self.end + count) % self.buf.len();
                self.left -= count;
                Ok(count as isize)
            }
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => Ok(-1),
            Err(e) => {
                log::debug!("fill_from: read failed: {e}");
                Ok(-1)
            }
        }
    }

    /// Attempts to write exactly `n` occupied bytes to `fd`, in at most two
    /// `write()` calls (before and after the physical wraparound). Returns
    /// the number of bytes actually written, which is less than `n` iff a
    /// write returned zero bytes or failed. Advances `start` only for bytes
    /// that were actually written, so a short write never loses source
    /// data.
    pub fn drain_to(&mut self, fd: RawFd, n: usize) -> Result<usize> {
        if self.is_empty() {
            return Err(Error::Empty);
        }

        let mut remaining = n;
        while remaining > 0 {
            let bound = if self.end <= self.start {
                self.buf.len() - self.start
            } else {
                self.end - self.start
            };
            let chunk = remaining.min(bound);
            let slice = &self.buf[self.start..self.start + chunk];

            match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, slice) {
                Ok(0) => break,
                Ok(count) => {
                    self.start = (self.start + count) % self.buf.len();
                    self.left += count;
                    remaining -= count;
                    if count < chunk {
                        // partial write, stop and let the caller retry on
                        // the next readiness event
                        break;
                    }
                }
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => break,
                Err(e) => {
                    log::debug!("drain_to: write failed: {e}");
                    break;
                }
            }
        }

        Ok(n - remaining)
    }

    /// Copies `n` logically-sequential bytes out into `dest`, advancing
    /// `start`. Caller guarantees `n <= available()`.
    pub fn copy_out(&mut self, dest: &mut [u8], n: usize) -> usize {
        debug_assert!(n <= self.available());
        for (i, d) in dest.iter_mut().enumerate().take(n) {
            *d = self.buf[(self.start + i) % self.buf.len()];
        }
        self.start = (self.start + n) % self.buf.len();
        self.left += n;
        n
    }

    /// Copies up to `n` bytes from `src` into the ring, truncated to
    /// `left`. Advances `end`. Used by tests to seed content without going
    /// through a real fd.
    pub fn copy_in(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.left);
        for (i, b) in src.iter().enumerate().take(n) {
            self.buf[(self.end + i) % self.buf.len()] = *b;
        }
        self.end = (self.end + n) % self.buf.len();
        self.left -= n;
        n
    }

    /// Returns `offset + 1` of the first occurrence of `c` in the occupied
    /// region (logical order), or `0` if absent.
    pub fn find_byte(&self, c: u8) -> usize {
        let occupied = self.available();
        for i in 0..occupied {
            if self.buf[(self.start + i) % self.buf.len()] == c {
                return i + 1;
            }
        }
        0
    }
}
