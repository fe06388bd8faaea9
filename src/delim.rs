//! Delimiter mode and record discovery.
//!
//! Factored out of `Rb` so the mux loop selects a discovery function per
//! call site from a `Buffering` value rather than branching on a global, per
//! the re-architecture guidance for "delimiter mode selection".

use crate::ring::Rb;

pub const LINE_DELIM: u8 = b'\n';
pub const TIU_DELIM: u8 = 0x4D;

/// Which byte terminates a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    Line,
    Tiu,
}

impl Buffering {
    pub fn delimiter(self) -> u8 {
        match self {
            Buffering::Line => LINE_DELIM,
            Buffering::Tiu => TIU_DELIM,
        }
    }

    /// Length of the shortest complete record currently in `rb`, including
    /// the delimiter, or `0` if none is present yet. Both client→tty and
    /// tty→client directions use this same framing function in both
    /// buffering modes (see SPEC_FULL.md §9 on the TIU open question).
    pub fn record_len(self, rb: &Rb) -> usize {
        rb.find_byte(self.delimiter())
    }
}
