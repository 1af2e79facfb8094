//! Bounded byte FIFO shared between a producer and a consumer thread,
//! with level-triggered readable/writable thresholds instead of the
//! usual empty/full signal.
//!
//! Two backings implement the same contract: [`VirtualRing`] is a single
//! contiguous allocation (the common case), and [`paged::PagedRing`]
//! models sliding two fixed windows across a much larger
//! logically-contiguous span of locked pages, for buffers too large to
//! hold in one virtual mapping — see `paged`'s module doc for how much
//! of that model is bookkeeping versus real memory layout in this
//! safe-Rust port. Callers pick a backing through [`RingBuffer`]; the
//! copy orchestrator does not care which one it got.

mod gate;
pub mod paged;
mod virtual_ring;

use std::sync::Arc;

pub use paged::PagedRing;
pub use virtual_ring::VirtualRing;

/// Picks a backing for a requested buffer size: [`VirtualRing`] for
/// anything that fits comfortably in one virtual allocation, falling
/// back to the locked-page [`PagedRing`] above `MAX_HEAP_BUFFER_SIZE`
/// or whenever the caller forces paged mode (spec.md §6's "heap-backed
/// cutoff" bound). `PagedRing`'s usable capacity is `buffer_size`,
/// same as `VirtualRing`'s; `window_size` only sets the page-alignment
/// granularity at which its window-remap bookkeeping fires.
pub fn new_auto(buffer_size: u64, window_size: usize, force_paged: bool) -> Arc<dyn RingBuffer> {
    if force_paged || buffer_size > crate::config::MAX_HEAP_BUFFER_SIZE {
        Arc::new(PagedRing::new(buffer_size as usize, window_size))
    } else {
        Arc::new(VirtualRing::new(buffer_size as usize))
    }
}

/// Shared contract for both ring buffer backings.
///
/// Implementations are `Send + Sync`: one thread writes, another reads,
/// both may call `data_avail`/`free_space` concurrently for progress
/// reporting.
pub trait RingBuffer: Send + Sync {
    fn capacity(&self) -> usize;

    /// Bytes currently queued for the reader.
    fn data_avail(&self) -> usize;

    /// Bytes of headroom available to the writer.
    fn free_space(&self) -> usize;

    /// Level at which the buffer is considered writable. Writers block
    /// in [`RingBuffer::wait_writable`] until `free_space() >= thres`.
    fn set_thres_write(&self, thres: usize);

    /// Level at which the buffer is considered readable.
    fn set_thres_read(&self, thres: usize);

    /// Copy `min(buf.len(), free_space())` bytes in; never blocks.
    /// Returns the number of bytes actually written.
    fn write(&self, buf: &[u8]) -> usize;

    /// Copy `min(buf.len(), data_avail())` bytes out; never blocks.
    /// Returns the number of bytes actually read.
    fn read(&self, buf: &mut [u8]) -> usize;

    /// Block until `free_space() >= thres_write`.
    fn wait_writable(&self);

    /// Block until `data_avail() >= thres_read`.
    fn wait_readable(&self);

    /// Drop all queued data and reset both thresholds to zero.
    fn reset(&self);
}
