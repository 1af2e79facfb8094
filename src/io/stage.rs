//! Stage threads that move bytes between a ring buffer and a file or
//! tape device, in either direction, in sync or queued-async mode.
//!
//! Sync mode follows `original_source/src/tapeio/filethrd.c`'s
//! `write_thread_sync`/`read_thread_sync` control flow: one blocking
//! read/write per iteration, buffering/debuffering hysteresis around
//! `thres_buf_debuf`, tail padding to the block alignment. Async mode
//! follows the teacher's `io::engine::IoEngine::read_batch` idiom —
//! build an `IoUring`, submit up to `queue_depth` requests, drain
//! completions, treat a negative `result()` as the device error — run
//! to the full read/write queue-of-`Q` state machine the original's
//! `write_thread_async`/`read_thread_async` implement. Non-Linux
//! targets (or the `io` feature disabled) collapse to the teacher's
//! own `#[cfg(not(target_os = "linux"))]` fallback: the same state
//! machine driven by sequential positioned reads/writes.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::checksum::ChecksumStage;
use crate::error::{Result, StreamEndKind, TapeIoError};
use crate::io::flags::IoFlags;
use crate::io::queue::IoQueue;
use crate::ring::RingBuffer;

fn round_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

/// Recovers a [`StreamEndKind`] a source/sink's `Read`/`Write` impl
/// encoded as the error payload (see `crate::error` docs), falling
/// back to a plain I/O error for everything else. Mirrors
/// `original_source/src/tapeio/filecopy.c`'s `check_copy_result`
/// switch over the thread's stashed `GetLastError` value, except the
/// classification happens inline as each read/write completes rather
/// than after the fact.
fn classify_io_error(err: std::io::Error) -> TapeIoError {
    if err.get_ref().is_some_and(|inner| inner.is::<StreamEndKind>()) {
        let kind = *err
            .into_inner()
            .expect("checked Some above")
            .downcast::<StreamEndKind>()
            .expect("checked is::<StreamEndKind> above");
        TapeIoError::StreamEnd(kind)
    } else {
        TapeIoError::Io(err)
    }
}

/// Shared signaling between the copy orchestrator and its two stages.
///
/// `read_bytes_done`/`write_bytes_done` are separate counters, one per
/// stage: the read side and the write side race independently against
/// their own handle, so folding both into one shared total would
/// double-count every byte that has been read but not yet written.
#[derive(Default)]
pub struct StageControl {
    pub abort: AtomicBool,
    pub end_of_data: AtomicBool,
    pub read_bytes_done: AtomicU64,
    pub write_bytes_done: AtomicU64,
    pub congestion_backoffs: AtomicU64,
    /// Mirrors of each stage's current hysteresis state, for progress
    /// reporting (spec.md §6's `<mode>` field). Only one of the three
    /// is meaningfully true at a time in practice, but they are
    /// independent flags rather than a shared enum since the two
    /// stages set them from different threads.
    pub write_buffering: AtomicBool,
    pub write_flushing: AtomicBool,
    pub read_debuffering: AtomicBool,
    /// Set once a source or sink reports a transient stream-end
    /// marker (filemark, setmark, EOD, EOT) rather than a fatal
    /// error. Checked by the copy orchestrator to report a clean halt
    /// instead of a failure.
    pub stream_end: std::sync::Mutex<Option<StreamEndKind>>,
}

impl StageControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Execution mode for a stage: one request in flight, or up to
/// `queue_depth` concurrently.
#[derive(Clone, Copy, Debug)]
pub enum IoMode {
    Sync,
    Async { queue_depth: usize },
}

/// Drains the ring buffer into a sink, applying buffering/flushing
/// hysteresis around `thres_buf_debuf` so the underlying device sees
/// long, steady writes instead of a start-stop trickle.
///
/// `thres_buf_debuf == 0` means "not sustaining": the stage always
/// waits for a full block rather than entering the buffer/re-buffer
/// dance (matching the original's non-`IO_THREAD_SUSTAIN` path).
pub struct WriteStage {
    ring: Arc<dyn RingBuffer>,
    thres_buf_debuf: usize,
    block_size: usize,
    /// Tail padding alignment; `<= 1` means no padding.
    align: usize,
    mode: IoMode,
}

impl WriteStage {
    pub fn new(
        ring: Arc<dyn RingBuffer>,
        thres_buf_debuf: usize,
        block_size: usize,
        align: usize,
        mode: IoMode,
    ) -> Self {
        Self {
            ring,
            thres_buf_debuf,
            block_size,
            align: align.max(1),
            mode,
        }
    }

    /// Run to completion (end-of-data plus ring drained, abort, or a
    /// write error). Returns `(data_bytes, padded_bytes)`.
    pub fn run<W: Write + AsRawFd + Send>(
        &self,
        mut sink: W,
        control: &StageControl,
        crc: &ChecksumStage,
    ) -> Result<(u64, u64)> {
        match self.mode {
            IoMode::Sync => self.run_sync(&mut sink, control, crc),
            IoMode::Async { queue_depth } => self.run_async(sink, control, crc, queue_depth),
        }
    }

    fn run_sync<W: Write>(
        &self,
        sink: &mut W,
        control: &StageControl,
        crc: &ChecksumStage,
    ) -> Result<(u64, u64)> {
        let sustain = self.thres_buf_debuf > 0;
        let mut buffering = sustain;
        let mut flushing = false;
        control.write_buffering.store(buffering, Ordering::Relaxed);
        self.ring
            .set_thres_read(if sustain { self.thres_buf_debuf } else { self.block_size });

        let mut block = vec![0u8; self.block_size];
        let mut data_bytes = 0u64;
        let mut padded_bytes = 0u64;

        loop {
            if control.is_aborted() {
                return Err(TapeIoError::Aborted);
            }

            if !flushing && control.end_of_data.load(Ordering::Acquire) {
                flushing = true;
                buffering = false;
                control.write_flushing.store(true, Ordering::Relaxed);
                control.write_buffering.store(false, Ordering::Relaxed);
                self.ring.set_thres_read(0);
            }

            self.ring.wait_readable();

            if buffering {
                buffering = false;
                control.write_buffering.store(false, Ordering::Relaxed);
                self.ring.set_thres_read(0);
                continue;
            }

            let avail = self.ring.data_avail();
            let data_size = if flushing {
                avail.min(self.block_size)
            } else if avail >= self.block_size {
                self.block_size
            } else {
                buffering = true;
                control.write_buffering.store(true, Ordering::Relaxed);
                self.ring.set_thres_read(self.thres_buf_debuf.max(1));
                continue;
            };

            if data_size == 0 {
                break;
            }

            let n = self.ring.read(&mut block[..data_size]);
            debug_assert_eq!(n, data_size);

            let padded_size = if self.align > 1 && data_size < self.block_size {
                round_up(data_size, self.align)
            } else {
                data_size
            };
            if padded_size > data_size {
                block[data_size..padded_size].fill(0);
            }

            if let Err(e) = sink.write_all(&block[..padded_size]) {
                match classify_io_error(e) {
                    TapeIoError::StreamEnd(kind) => {
                        tracing::info!("write stage halted cleanly: {kind}");
                        *control.stream_end.lock().unwrap() = Some(kind);
                        break;
                    }
                    other => return Err(other),
                }
            }
            crc.append(&block[..data_size]);

            data_bytes += data_size as u64;
            padded_bytes += padded_size as u64;
            control.write_bytes_done.fetch_add(data_size as u64, Ordering::Relaxed);

            if flushing && data_size < self.block_size {
                break;
            }
        }

        control.write_flushing.store(false, Ordering::Relaxed);
        sink.flush().map_err(TapeIoError::Io)?;
        Ok((data_bytes, padded_bytes))
    }

    /// Pull up to one full block out of the ring, blocking as
    /// necessary. Returns fewer than `block_size` bytes only once
    /// end-of-data has been observed and the ring is drained; returns
    /// 0 once there is truly nothing left.
    fn pull_block(&self, dst: &mut [u8], control: &StageControl) -> Result<usize> {
        let mut filled = 0;
        loop {
            if control.is_aborted() {
                return Err(TapeIoError::Aborted);
            }
            if self.ring.data_avail() == 0 {
                if control.end_of_data.load(Ordering::Acquire) {
                    return Ok(filled);
                }
                self.ring.set_thres_read(1);
                self.ring.wait_readable();
                continue;
            }
            let n = self.ring.read(&mut dst[filled..self.block_size]);
            filled += n;
            if filled == self.block_size {
                return Ok(filled);
            }
        }
    }

    fn run_async<W: Write + AsRawFd>(
        &self,
        sink: W,
        control: &StageControl,
        crc: &ChecksumStage,
        queue_depth: usize,
    ) -> Result<(u64, u64)> {
        if self.thres_buf_debuf > 0 {
            control.write_buffering.store(true, Ordering::Relaxed);
            self.ring.set_thres_read(self.thres_buf_debuf);
            self.ring.wait_readable();
            control.write_buffering.store(false, Ordering::Relaxed);
        }
        self.ring.set_thres_read(1);

        #[cfg(all(target_os = "linux", feature = "io"))]
        {
            self.run_async_uring(sink.as_raw_fd(), control, crc, queue_depth)
        }
        #[cfg(not(all(target_os = "linux", feature = "io")))]
        {
            self.run_async_fallback(sink.as_raw_fd(), control, crc)
        }
    }

    /// Degraded async path for targets without `io_uring`: one
    /// positioned write at a time via `pwrite`, same fill/pad logic as
    /// the uring path. This is the teacher's own non-Linux
    /// `read_batch` fallback, generalized to writes.
    #[cfg(not(all(target_os = "linux", feature = "io")))]
    fn run_async_fallback(
        &self,
        fd: RawFd,
        control: &StageControl,
        crc: &ChecksumStage,
    ) -> Result<(u64, u64)> {
        let mut block = vec![0u8; self.block_size];
        let mut data_bytes = 0u64;
        let mut padded_bytes = 0u64;
        let mut file_pos = 0u64;

        loop {
            let n = self.pull_block(&mut block, control)?;
            if n == 0 {
                break;
            }
            let padded = if self.align > 1 && n < self.block_size {
                round_up(n, self.align)
            } else {
                n
            };
            if padded > n {
                block[n..padded].fill(0);
            }
            pwrite_all(fd, &block[..padded], file_pos)?;
            crc.append(&block[..n]);
            data_bytes += n as u64;
            padded_bytes += padded as u64;
            file_pos += padded as u64;
            control.write_bytes_done.fetch_add(n as u64, Ordering::Relaxed);
            if n < self.block_size {
                break;
            }
        }
        Ok((data_bytes, padded_bytes))
    }

    /// `io_uring`-backed queue-depth-N write, modeled on
    /// `write_thread_async`: fill free slots from the ring, submit a
    /// positioned write per slot, drain completions, charge counters.
    /// Completions are charged in whatever order the kernel returns
    /// them — see DESIGN.md for why that is safe here (every write is
    /// positioned, so commit order does not affect the bytes on
    /// disk), unlike the original's strict single-head-of-queue wait.
    #[cfg(all(target_os = "linux", feature = "io"))]
    fn run_async_uring(
        &self,
        fd: RawFd,
        control: &StageControl,
        crc: &ChecksumStage,
        queue_depth: usize,
    ) -> Result<(u64, u64)> {
        use io_uring::{opcode, types, IoUring};

        let slot_size = round_up(self.block_size, self.align);
        let mut queue = IoQueue::new(queue_depth.max(1), slot_size);
        let mut ring = IoUring::new(queue.depth() as u32).map_err(TapeIoError::Io)?;

        let mut data_bytes = 0u64;
        let mut padded_bytes = 0u64;
        let mut file_pos = 0u64;
        let mut done_filling = false;
        let mut first_err: Option<TapeIoError> = None;

        'outer: loop {
            while first_err.is_none() && !done_filling && queue.has_free_slot() {
                if control.is_aborted() {
                    first_err = Some(TapeIoError::Aborted);
                    break;
                }
                let slot = queue.acquire();
                let n = match self.pull_block(&mut queue.entry_mut(slot).buf[..self.block_size], control) {
                    Ok(n) => n,
                    Err(e) => {
                        queue.release(slot);
                        first_err = Some(e);
                        break;
                    }
                };
                if n == 0 {
                    queue.release(slot);
                    done_filling = true;
                    break;
                }
                let padded = if self.align > 1 && n < self.block_size {
                    round_up(n, self.align)
                } else {
                    n
                };
                {
                    let entry = queue.entry_mut(slot);
                    if padded > n {
                        entry.buf[n..padded].fill(0);
                    }
                    entry.data_len = n;
                    entry.padded_len = padded;
                    entry.file_offset = file_pos;
                }
                file_pos += padded as u64;
                if n < self.block_size {
                    done_filling = true;
                }

                let entry = queue.entry(slot);
                let sqe = opcode::Write::new(types::Fd(fd), entry.buf.as_ptr(), padded as u32)
                    .offset(entry.file_offset)
                    .build()
                    .user_data(slot as u64);
                // Safety: the submission queue was sized to
                // `queue.depth()` and we never have more than that
                // many slots acquired at once, so this cannot exceed
                // its capacity.
                unsafe {
                    ring.submission()
                        .push(&sqe)
                        .expect("submission queue sized to pool depth");
                }
            }

            if queue.in_flight() == 0 {
                break;
            }

            loop {
                match ring.submit_and_wait(1) {
                    Ok(_) => break,
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) => {
                        first_err = Some(TapeIoError::Io(e));
                        break 'outer;
                    }
                }
            }

            let completed: Vec<(usize, i32)> =
                ring.completion().map(|cqe| (cqe.user_data() as usize, cqe.result())).collect();
            for (slot, result) in completed {
                if result < 0 {
                    let errno = -result;
                    if errno == libc::ENOBUFS {
                        // Driver congestion, not a real failure: the SQE is
                        // resubmitted in place and the slot stays in flight.
                        control.congestion_backoffs.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("driver congestion on slot {slot}, resubmitting");
                        std::thread::sleep(std::time::Duration::from_micros(200));
                        let entry = queue.entry(slot);
                        let sqe = opcode::Write::new(types::Fd(fd), entry.buf.as_ptr(), entry.padded_len as u32)
                            .offset(entry.file_offset)
                            .build()
                            .user_data(slot as u64);
                        unsafe {
                            ring.submission()
                                .push(&sqe)
                                .expect("submission queue sized to pool depth");
                        }
                        continue;
                    }
                    if first_err.is_none() {
                        first_err = Some(TapeIoError::Io(std::io::Error::from_raw_os_error(errno)));
                    }
                    queue.release(slot);
                    continue;
                }
                let entry = queue.entry(slot);
                let written = result as usize;
                let charged = entry.data_len.min(written);
                crc.append(&entry.buf[..charged]);
                data_bytes += charged as u64;
                padded_bytes += written as u64;
                control.write_bytes_done.fetch_add(charged as u64, Ordering::Relaxed);
                if written < entry.padded_len && first_err.is_none() {
                    first_err = Some(TapeIoError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "short write to tape/file handle",
                    )));
                }
                queue.release(slot);
            }
        }

        // Drain any still-outstanding submissions before the slot
        // pool (and its buffers, which the kernel may still be
        // writing from) is dropped.
        while queue.in_flight() > 0 {
            if ring.submit_and_wait(1).is_err() {
                break;
            }
            for cqe in ring.completion() {
                queue.release(cqe.user_data() as usize);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok((data_bytes, padded_bytes)),
        }
    }
}

/// Push `data` into the ring, entering/leaving `DEBUFFERING` around any
/// wait for space exactly as the sync read loop does. Shared by every
/// `ReadStage` mode so the hysteresis dance around `thres_buf_debuf`
/// only lives in one place.
fn push_to_ring(
    ring: &Arc<dyn RingBuffer>,
    data: &[u8],
    thres_buf_debuf: usize,
    control: &StageControl,
) -> Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        offset += ring.write(&data[offset..]);
        if offset < data.len() {
            if control.is_aborted() {
                return Err(TapeIoError::Aborted);
            }
            control.read_debuffering.store(true, Ordering::Relaxed);
            ring.set_thres_write(thres_buf_debuf.max(1));
            ring.wait_writable();
            control.read_debuffering.store(false, Ordering::Relaxed);
            ring.set_thres_write(0);
        }
    }
    Ok(())
}

/// Fills the ring buffer from a source, applying debuffering hysteresis
/// symmetric to `WriteStage`'s buffering logic. Reads never pad, so
/// `padded_bytes == data_bytes` always (spec.md §4.3).
pub struct ReadStage {
    ring: Arc<dyn RingBuffer>,
    thres_buf_debuf: usize,
    block_size: usize,
    mode: IoMode,
}

impl ReadStage {
    pub fn new(ring: Arc<dyn RingBuffer>, thres_buf_debuf: usize, block_size: usize, mode: IoMode) -> Self {
        Self {
            ring,
            thres_buf_debuf,
            block_size,
            mode,
        }
    }

    /// Run until the source reports EOF, abort is requested, or a
    /// read fails. Signals `control.end_of_data` on clean EOF.
    /// Returns `(data_bytes, padded_bytes)` with the two always equal.
    pub fn run<R: Read + AsRawFd + Send>(
        &self,
        mut source: R,
        control: &StageControl,
        crc: &ChecksumStage,
    ) -> Result<(u64, u64)> {
        match self.mode {
            IoMode::Sync => self.run_generic(&mut source, control, crc),
            IoMode::Async { queue_depth } => self.run_async(source, control, crc, queue_depth),
        }
    }

    fn run_generic<R: Read>(
        &self,
        source: &mut R,
        control: &StageControl,
        crc: &ChecksumStage,
    ) -> Result<(u64, u64)> {
        let mut flags = IoFlags::empty();
        let mut block = vec![0u8; self.block_size];
        let mut total = 0u64;

        self.ring.set_thres_write(if self.thres_buf_debuf > 0 { 0 } else { self.block_size });

        loop {
            if control.is_aborted() {
                return Err(TapeIoError::Aborted);
            }

            if control.read_debuffering.load(Ordering::Relaxed) {
                self.ring.set_thres_write(self.thres_buf_debuf.max(1));
                self.ring.wait_writable();
                control.read_debuffering.store(false, Ordering::Relaxed);
                self.ring.set_thres_write(0);
            }

            let n = match source.read(&mut block) {
                Ok(n) => n,
                Err(e) => match classify_io_error(e) {
                    TapeIoError::StreamEnd(kind) => {
                        tracing::info!("read stage halted cleanly: {kind}");
                        *control.stream_end.lock().unwrap() = Some(kind);
                        flags.insert(IoFlags::END_OF_FILE);
                        break;
                    }
                    other => return Err(other),
                },
            };
            if n == 0 {
                flags.insert(IoFlags::END_OF_FILE);
                break;
            }

            crc.append(&block[..n]);
            push_to_ring(&self.ring, &block[..n], self.thres_buf_debuf, control)?;
            total += n as u64;
            control.read_bytes_done.fetch_add(n as u64, Ordering::Relaxed);

            if self.ring.free_space() < self.thres_buf_debuf.max(self.block_size) {
                control.read_debuffering.store(true, Ordering::Relaxed);
            }
        }

        control.end_of_data.store(true, Ordering::Release);
        // Force the readable signal so a write stage blocked in
        // `wait_readable` wakes up to notice end-of-data even though
        // no more bytes are coming.
        self.ring.set_thres_read(0);
        Ok((total, total))
    }

    fn run_async<R: Read + AsRawFd>(
        &self,
        source: R,
        control: &StageControl,
        crc: &ChecksumStage,
        queue_depth: usize,
    ) -> Result<(u64, u64)> {
        #[cfg(all(target_os = "linux", feature = "io"))]
        {
            self.run_async_uring(source.as_raw_fd(), control, crc, queue_depth)
        }
        #[cfg(not(all(target_os = "linux", feature = "io")))]
        {
            self.run_async_fallback(source.as_raw_fd(), control, crc)
        }
    }

    /// Degraded async path for targets without `io_uring`: one
    /// positioned read at a time via `pread`. Trivially in submission
    /// order since only one read is ever in flight, unlike the uring
    /// path below.
    #[cfg(not(all(target_os = "linux", feature = "io")))]
    fn run_async_fallback(&self, fd: RawFd, control: &StageControl, crc: &ChecksumStage) -> Result<(u64, u64)> {
        let mut block = vec![0u8; self.block_size];
        let mut total = 0u64;
        let mut file_pos = 0u64;

        loop {
            if control.is_aborted() {
                return Err(TapeIoError::Aborted);
            }
            let n = pread_some(fd, &mut block, file_pos)?;
            if n == 0 {
                break;
            }
            crc.append(&block[..n]);
            push_to_ring(&self.ring, &block[..n], self.thres_buf_debuf, control)?;
            total += n as u64;
            file_pos += n as u64;
            control.read_bytes_done.fetch_add(n as u64, Ordering::Relaxed);
            if n < self.block_size {
                break;
            }
        }

        control.end_of_data.store(true, Ordering::Release);
        self.ring.set_thres_read(0);
        Ok((total, total))
    }

    /// `io_uring`-backed queue-depth-N read, modeled on
    /// `read_thread_async`: fill free slots with positioned reads
    /// tagged by a monotonic sequence number, then commit completions
    /// to the ring strictly in that sequence. Unlike the write side,
    /// completion order cannot be charged as it arrives: the ring is a
    /// byte stream, not an offset-addressed file, so a read that
    /// finishes out of order has to wait in `pending` until every
    /// earlier-submitted read has already been pushed.
    #[cfg(all(target_os = "linux", feature = "io"))]
    fn run_async_uring(
        &self,
        fd: RawFd,
        control: &StageControl,
        crc: &ChecksumStage,
        queue_depth: usize,
    ) -> Result<(u64, u64)> {
        use io_uring::{opcode, types, IoUring};
        use std::collections::BTreeMap;

        let mut queue = IoQueue::new(queue_depth.max(1), self.block_size);
        let mut ring_io = IoUring::new(queue.depth() as u32).map_err(TapeIoError::Io)?;
        let mut slot_seq = vec![0u64; queue.depth()];

        let mut total = 0u64;
        let mut file_pos = 0u64;
        let mut next_submit_seq = 0u64;
        let mut next_commit_seq = 0u64;
        let mut done_filling = false;
        let mut eof_seq: Option<u64> = None;
        let mut first_err: Option<TapeIoError> = None;
        let mut pending: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        'outer: loop {
            while first_err.is_none() && !done_filling && queue.has_free_slot() {
                if control.is_aborted() {
                    first_err = Some(TapeIoError::Aborted);
                    break;
                }
                let slot = queue.acquire();
                let seq = next_submit_seq;
                next_submit_seq += 1;
                slot_seq[slot] = seq;

                let offset = file_pos;
                file_pos += self.block_size as u64;
                {
                    let entry = queue.entry_mut(slot);
                    entry.file_offset = offset;
                }

                let ptr = queue.entry_mut(slot).buf.as_mut_ptr();
                let sqe = opcode::Read::new(types::Fd(fd), ptr, self.block_size as u32)
                    .offset(offset)
                    .build()
                    .user_data(slot as u64);
                // Safety: the submission queue was sized to
                // `queue.depth()` and at most that many slots are ever
                // acquired at once.
                unsafe {
                    ring_io.submission().push(&sqe).expect("submission queue sized to pool depth");
                }
            }

            if queue.in_flight() == 0 && pending.is_empty() {
                break;
            }

            if queue.in_flight() > 0 {
                loop {
                    match ring_io.submit_and_wait(1) {
                        Ok(_) => break,
                        Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                        Err(e) => {
                            first_err = Some(TapeIoError::Io(e));
                            break 'outer;
                        }
                    }
                }

                let completed: Vec<(usize, i32)> =
                    ring_io.completion().map(|cqe| (cqe.user_data() as usize, cqe.result())).collect();
                for (slot, result) in completed {
                    let seq = slot_seq[slot];
                    if result < 0 {
                        let errno = -result;
                        if errno == libc::ENOBUFS {
                            control.congestion_backoffs.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("driver congestion on slot {slot}, resubmitting");
                            std::thread::sleep(std::time::Duration::from_micros(200));
                            let entry_offset = queue.entry(slot).file_offset;
                            let ptr = queue.entry_mut(slot).buf.as_mut_ptr();
                            let sqe = opcode::Read::new(types::Fd(fd), ptr, self.block_size as u32)
                                .offset(entry_offset)
                                .build()
                                .user_data(slot as u64);
                            unsafe {
                                ring_io.submission().push(&sqe).expect("submission queue sized to pool depth");
                            }
                            continue;
                        }
                        if first_err.is_none() {
                            first_err = Some(TapeIoError::Io(std::io::Error::from_raw_os_error(errno)));
                        }
                        queue.release(slot);
                        continue;
                    }
                    let n = result as usize;
                    if n < self.block_size {
                        done_filling = true;
                        eof_seq = Some(seq);
                    }
                    let data = queue.entry(slot).buf[..n].to_vec();
                    pending.insert(seq, data);
                    queue.release(slot);
                }
            }

            while let Some(data) = pending.remove(&next_commit_seq) {
                if !data.is_empty() {
                    crc.append(&data);
                    if let Err(e) = push_to_ring(&self.ring, &data, self.thres_buf_debuf, control) {
                        first_err = Some(e);
                        break 'outer;
                    }
                    total += data.len() as u64;
                    control.read_bytes_done.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                let reached_eof = eof_seq == Some(next_commit_seq);
                next_commit_seq += 1;
                if reached_eof {
                    done_filling = true;
                    pending.clear();
                    break;
                }
            }
        }

        while queue.in_flight() > 0 {
            if ring_io.submit_and_wait(1).is_err() {
                break;
            }
            for cqe in ring_io.completion() {
                queue.release(cqe.user_data() as usize);
            }
        }

        control.end_of_data.store(true, Ordering::Release);
        self.ring.set_thres_read(0);

        match first_err {
            Some(e) => Err(e),
            None => Ok((total, total)),
        }
    }
}

/// Write every byte of `buf` to `fd` at `offset`, retrying short
/// writes at the advanced offset.
#[cfg(not(all(target_os = "linux", feature = "io")))]
fn pwrite_all(fd: RawFd, buf: &[u8], mut offset: u64) -> Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        let ret = unsafe {
            libc::pwrite(
                fd,
                buf[written..].as_ptr() as *const libc::c_void,
                buf.len() - written,
                offset as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(TapeIoError::Io(std::io::Error::last_os_error()));
        }
        written += ret as usize;
        offset += ret as u64;
    }
    Ok(())
}

/// Read up to `buf.len()` bytes from `fd` at `offset` in one call,
/// returning whatever the kernel hands back (possibly short of EOF).
#[cfg(not(all(target_os = "linux", feature = "io")))]
fn pread_some(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
    let ret = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset as libc::off_t) };
    if ret < 0 {
        return Err(TapeIoError::Io(std::io::Error::last_os_error()));
    }
    Ok(ret as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::VirtualRing;
    use std::io::Seek;

    fn temp_file() -> std::fs::File {
        tempfile::tempfile().expect("create temp file")
    }

    #[test]
    fn sync_read_then_write_round_trips_data() {
        let ring: Arc<dyn RingBuffer> = Arc::new(VirtualRing::new(1024));
        let control = StageControl::new();
        let source_data = vec![7u8; 4096];

        let mut src_file = temp_file();
        src_file.write_all(&source_data).unwrap();
        src_file.rewind().unwrap();

        let read_stage = ReadStage::new(Arc::clone(&ring), 256, 512, IoMode::Sync);
        let write_stage = WriteStage::new(Arc::clone(&ring), 256, 512, 1, IoMode::Sync);

        let read_crc = ChecksumStage::spawn(1 << 16);
        let write_crc = ChecksumStage::spawn(1 << 16);

        let sink_file = temp_file();
        let mut sink_readback = sink_file.try_clone().unwrap();
        let (_, written) = std::thread::scope(|scope| {
            let reader_control = Arc::clone(&control);
            let reader = scope.spawn(move || read_stage.run(src_file, &reader_control, &read_crc));
            let writer_control = Arc::clone(&control);
            let written = write_stage.run(sink_file, &writer_control, &write_crc).unwrap();
            let read_total = reader.join().unwrap().unwrap();
            (read_total, written)
        });

        sink_readback.rewind().unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut sink_readback, &mut out).unwrap();
        assert_eq!(out, source_data);

        assert_eq!(written.0, source_data.len() as u64);
        assert_eq!(written.1, source_data.len() as u64);
    }

    #[test]
    fn abort_flag_stops_the_write_stage() {
        let ring: Arc<dyn RingBuffer> = Arc::new(VirtualRing::new(64));
        let control = StageControl::new();
        control.request_abort();
        let stage = WriteStage::new(ring, 1, 16, 1, IoMode::Sync);
        let crc = ChecksumStage::spawn(4096);
        let sink = temp_file();
        let err = stage.run(sink, &control, &crc).unwrap_err();
        assert!(matches!(err, TapeIoError::Aborted));
        crc.finish();
    }

    #[test]
    fn unaligned_tail_is_padded_and_crc_covers_only_unpadded_bytes() {
        let ring: Arc<dyn RingBuffer> = Arc::new(VirtualRing::new(8192));
        let control = StageControl::new();
        // 4097 bytes: {1, 0, 0, ..., 0} split across two 4096-byte blocks.
        let mut data = vec![0u8; 4097];
        data[0] = 1;
        ring.write(&data);
        control.end_of_data.store(true, Ordering::Release);

        let write_stage = WriteStage::new(Arc::clone(&ring), 0, 4096, 4096, IoMode::Sync);
        let crc = ChecksumStage::spawn(1 << 16);
        let sink = temp_file();
        let (data_bytes, padded_bytes) = write_stage.run(sink, &control, &crc).unwrap();
        let digest = crc.finish();

        assert_eq!(data_bytes, 4097);
        assert_eq!(padded_bytes, 8192);
        assert_eq!(digest, crate::checksum::crc32_of(&data));
    }
}
