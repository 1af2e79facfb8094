//! The slot pool backing an async I/O stage's in-flight requests.
//!
//! Mirrors `original_source/src/tapeio/filethrd.c`'s `io_queue_entry`
//! array and the teacher's `IoEngine::read_batch` buffer pool: a fixed
//! number of page-aligned block buffers, each taggable with the slot
//! index it lives in so a completion can be matched back to the entry
//! that produced it (`io_uring`'s `user_data` plays that role here).

use crate::io::aligned_buf::{alloc_aligned, AlignedBuf};

/// One in-flight (or free) request slot.
///
/// `data_len` is the unpadded byte count pulled from/destined for the
/// ring; `padded_len` is what was actually read from or written to the
/// handle (`padded_len >= data_len`, equal unless this is a write's
/// tail block under a block-alignment requirement — reads never pad,
/// per spec.md §4.3).
pub struct IoQueueEntry {
    pub buf: AlignedBuf,
    pub file_offset: u64,
    pub data_len: usize,
    pub padded_len: usize,
}

impl IoQueueEntry {
    pub fn new(slot_size: usize) -> Self {
        Self {
            buf: alloc_aligned(slot_size),
            file_offset: 0,
            data_len: 0,
            padded_len: 0,
        }
    }
}

/// Fixed-depth pool of request slots with a free list.
///
/// Unlike the original's single FIFO (`queue_offset`/`queue_nused`/
/// `queue_npend`), this pool hands out slots by index and leaves
/// ordering to the caller: `io_uring` completions are matched to a
/// slot by `user_data` rather than by position, so there is no "head
/// of queue" to track explicitly. See DESIGN.md for why this pool
/// replaces the original's strict single-head-wait discipline.
pub struct IoQueue {
    entries: Vec<IoQueueEntry>,
    free: Vec<usize>,
}

impl IoQueue {
    pub fn new(depth: usize, slot_size: usize) -> Self {
        Self {
            entries: (0..depth).map(|_| IoQueueEntry::new(slot_size)).collect(),
            free: (0..depth).rev().collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn has_free_slot(&self) -> bool {
        !self.free.is_empty()
    }

    /// Claim a free slot for a new request.
    pub fn acquire(&mut self) -> usize {
        self.free.pop().expect("acquire called with no free slots")
    }

    /// Return a slot to the free list after its completion has been
    /// charged to the stage totals.
    pub fn release(&mut self, slot: usize) {
        self.free.push(slot);
    }

    pub fn entry(&self, slot: usize) -> &IoQueueEntry {
        &self.entries[slot]
    }

    pub fn entry_mut(&mut self, slot: usize) -> &mut IoQueueEntry {
        &mut self.entries[slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trip_the_free_list() {
        let mut q = IoQueue::new(4, 512);
        assert_eq!(q.in_flight(), 0);
        let a = q.acquire();
        let b = q.acquire();
        assert_eq!(q.in_flight(), 2);
        q.release(a);
        assert_eq!(q.in_flight(), 1);
        q.release(b);
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    #[should_panic]
    fn acquiring_past_depth_panics() {
        let mut q = IoQueue::new(1, 512);
        q.acquire();
        q.acquire();
    }
}
