//! Background CRC32 folding, kept off the hot I/O path.
//!
//! A `ChecksumStage` owns a private ring buffer and a worker thread
//! that drains it, folding every byte into a running IEEE 802.3 CRC32
//! (`crc32fast`). The copy orchestrator calls `append` from the I/O
//! thread and only blocks if the worker has fallen behind; `finish`
//! is the terminal call that joins the worker and returns the digest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crc32fast::Hasher;

use crate::config::CRC_BLOCK_SIZE;
use crate::ring::{RingBuffer, VirtualRing};

struct Shared {
    ring: VirtualRing,
    done: AtomicBool,
}

/// Scheduling priority hint for the worker thread. Sustain-mode copies
/// (spec.md §5) want the background CRC fold to never be the reason a
/// fast tape drive underruns, so the copy orchestrator asks for
/// `AboveNormal` there, mirroring `crcthrd.c`'s `SetThreadPriority`
/// call gated on its own `priority` argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    AboveNormal,
}

/// Best-effort: a failure here (e.g. missing `CAP_SYS_NICE`) just
/// leaves the worker at normal scheduling priority, the same
/// non-fatal fallback `crcthrd.c` gets from a failed
/// `SetThreadPriority`.
#[cfg(all(unix, feature = "io"))]
fn apply_priority(priority: Priority) {
    if priority == Priority::AboveNormal {
        // SAFETY: `setpriority` with `PRIO_PROCESS` and pid 0 only ever
        // adjusts the calling thread's own nice value.
        unsafe {
            libc::setpriority(libc::PRIO_PROCESS, 0, -5);
        }
    }
}

#[cfg(not(all(unix, feature = "io")))]
fn apply_priority(_priority: Priority) {}

/// One running CRC32 computation driven by a background thread.
pub struct ChecksumStage {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<u32>>,
}

impl ChecksumStage {
    /// `buf_size` sizes the private ring; `chunk_size` is the largest
    /// span folded in one pass and the level at which [`Self::append`]
    /// signals "readable" (spec.md §4.2); `priority` is the worker's
    /// scheduling priority hint.
    pub fn spawn(buf_size: usize, chunk_size: usize, priority: Priority) -> Self {
        let chunk_size = chunk_size.max(1);
        let shared = Arc::new(Shared {
            ring: VirtualRing::new(buf_size.max(chunk_size)),
            done: AtomicBool::new(false),
        });
        shared.ring.set_thres_read(chunk_size);
        shared.ring.set_thres_write(1);

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("checksum-worker".into())
            .spawn(move || Self::run(worker_shared, chunk_size, priority))
            .expect("failed to spawn checksum worker thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    fn run(shared: Arc<Shared>, chunk_size: usize, priority: Priority) -> u32 {
        apply_priority(priority);
        let mut hasher = Hasher::new();
        let mut block = vec![0u8; chunk_size];
        loop {
            shared.ring.wait_readable();
            // Drain every full chunk currently available...
            while shared.ring.data_avail() >= chunk_size {
                let n = shared.ring.read(&mut block);
                hasher.update(&block[..n]);
            }
            // ...and, once terminated, whatever partial tail remains.
            if shared.done.load(Ordering::Acquire) {
                let tail = shared.ring.data_avail();
                if tail > 0 {
                    let mut buf = vec![0u8; tail];
                    let n = shared.ring.read(&mut buf);
                    hasher.update(&buf[..n]);
                }
                break;
            }
        }
        let digest = hasher.finalize();
        tracing::debug!("checksum worker finished, digest={digest:08x}");
        digest
    }

    /// Queue `data` for checksumming. Blocks only if the worker has
    /// fallen far enough behind to fill the private ring.
    pub fn append(&self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            self.shared.ring.wait_writable();
            offset += self.shared.ring.write(&data[offset..]);
        }
    }

    /// Signal end of input, wait for the worker to drain, and return
    /// the finished digest.
    pub fn finish(mut self) -> u32 {
        self.shared.done.store(true, Ordering::Release);
        self.shared.ring.set_thres_read(0);
        self.worker.take().unwrap().join().expect("checksum worker panicked")
    }
}

/// A plain, synchronous stand-in used where the spec calls for the
/// copy orchestrator to fold a CRC inline rather than through a
/// background worker (small buffers, where thread handoff overhead
/// would dwarf the work itself).
pub fn crc32_of(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_stage_matches_inline_crc() {
        let stage = ChecksumStage::spawn(CRC_BLOCK_SIZE, 4096, Priority::Normal);
        let data = vec![0u8; 4096];
        stage.append(&data);
        let digest = stage.finish();
        assert_eq!(digest, crc32_of(&data));
    }

    #[test]
    fn chunk_size_smaller_than_input_still_folds_everything() {
        let stage = ChecksumStage::spawn(CRC_BLOCK_SIZE, 1024, Priority::AboveNormal);
        let data: Vec<u8> = (0u8..=255).cycle().take(4096 + 37).collect();
        stage.append(&data);
        let digest = stage.finish();
        assert_eq!(digest, crc32_of(&data));
    }

    #[test]
    fn zeroed_4096_bytes_matches_known_crc32() {
        let data = vec![0u8; 4096];
        assert_eq!(crc32_of(&data), 0x1c58_e580);
    }

    #[test]
    fn empty_input_matches_empty_crc() {
        let stage = ChecksumStage::spawn(CRC_BLOCK_SIZE, 4096, Priority::Normal);
        let digest = stage.finish();
        assert_eq!(digest, crc32_of(&[]));
    }
}
