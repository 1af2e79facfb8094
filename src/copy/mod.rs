//! Wires one source, one sink, and one ring buffer together into a
//! single supervised copy, with periodic progress and end-to-end CRC
//! reconciliation.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checksum::{ChecksumStage, Priority};
use crate::config::STATS_REFRESH_INTERVAL_MS;
use crate::error::{Result, StreamEndKind, TapeIoError};
use crate::io::{IoMode, ReadStage, StageControl, WriteStage};
use crate::rate::RateCounter;
use crate::ring::{self, RingBuffer};

/// A handle the caller can use to cancel an in-progress copy from
/// another thread — the Rust analogue of installing a console-control
/// handler around the original's blocking copy loop.
#[derive(Clone)]
pub struct AbortHandle {
    control: Arc<StageControl>,
}

impl AbortHandle {
    pub fn abort(&self) {
        tracing::warn!("copy abort requested");
        self.control.request_abort();
    }
}

/// Which hysteresis state a copy is in right now, for the `<mode>`
/// field of spec.md §6's progress line. `Steady` means neither stage
/// is waiting on the other — both are just moving data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressMode {
    Buffering,
    Flushing,
    Debuffering,
    Steady,
}

/// Throughput as spec.md §6 wants it displayed: a single combined rate
/// while both stages are keeping pace with each other, or a read/write
/// pair once one side is waiting on the other and the two diverge.
#[derive(Clone, Copy, Debug)]
pub enum Rate {
    Single(Option<f64>),
    Dual { read: Option<f64>, write: Option<f64> },
}

/// One periodic progress tick, handed to the caller's callback every
/// `STATS_REFRESH_INTERVAL`.
#[derive(Clone, Copy, Debug)]
pub struct ProgressSample {
    pub written: u64,
    pub total: Option<u64>,
    pub mode: ProgressMode,
    pub rate: Rate,
    pub buffered: usize,
    pub eta: Option<Duration>,
}

/// Parameters for one source-to-sink copy.
pub struct CopyRequest<'a, R, W> {
    pub source: R,
    pub sink: W,
    pub buffer_size: u64,
    /// Total bytes expected, when known (e.g. a file copy as opposed
    /// to a tape read of unknown length). Used only to compute `eta`.
    pub total_size: Option<u64>,
    /// Per-window size handed to `PagedRing` if the paged backing is
    /// selected; ignored otherwise.
    pub window_size: usize,
    /// Block size the source side is read in.
    pub src_block: usize,
    /// Block size the sink side is written in. Independently sized
    /// from `src_block` per spec.md §4.4's `copy(...)` signature
    /// (`dst_block`/`src_block` are two distinct parameters).
    pub dst_block: usize,
    pub thres_buf_debuf: usize,
    /// Tail-padding alignment applied to the sink's final short block
    /// (e.g. tape block size, or the O_DIRECT alignment). `<= 1` means
    /// no padding.
    pub dst_align: usize,
    pub io_mode: IoMode,
    /// Force the locked-page backing even if `buffer_size` would fit
    /// a plain virtual allocation (see `EngineConfig::wants_paged_backing`).
    pub force_paged_backing: bool,
    /// Size of each checksum stage's private ring.
    pub crc_buffer_size: usize,
    /// Largest span a checksum stage folds in one pass.
    pub crc_block_size: usize,
    /// Sustain mode keeps the tape side continuously fed, so its CRC
    /// worker runs at an elevated scheduling priority (spec.md §5);
    /// set when either side is the sustaining (tape) side.
    pub sustain: bool,
    pub on_progress: Option<&'a mut dyn FnMut(ProgressSample)>,
}

/// Outcome of a completed copy.
#[derive(Debug)]
pub struct CopyReport {
    pub data_bytes: u64,
    pub padded_bytes: u64,
    pub source_crc: u32,
    pub sink_crc: u32,
    /// Set when the copy halted because the tape side hit a
    /// transient stream-end marker (filemark, setmark, EOD, EOT)
    /// rather than running to a plain EOF. Not a failure (spec.md
    /// §4.4): the CRCs are still reconciled and reported above as
    /// usual.
    pub stream_end: Option<StreamEndKind>,
}

/// Run one source-to-sink copy to completion.
///
/// Spawns a read-side and a write-side worker, each folding its own
/// CRC in the background, and blocks the calling thread polling for
/// completion/abort while emitting progress samples. Returns an error
/// if either worker fails, the copy is aborted, or the two CRCs
/// disagree once both sides finish.
///
/// Both `source` and `sink` must be real file descriptors: the async
/// I/O modes address them with positioned reads/writes, so there is no
/// meaningful in-memory stand-in for them the way there is for the
/// checksum stage's own private ring.
///
/// Rejects up front (spec.md §4.4's preconditions) a `dst_block` that
/// isn't a multiple of `dst_align`, a ring or CRC buffer smaller than
/// the larger of `src_block`/`dst_block`, and a CRC buffer smaller
/// than its own chunk size.
pub fn copy<R, W>(req: CopyRequest<'_, R, W>, abort: AbortHandle) -> Result<CopyReport>
where
    R: Read + AsRawFd + Send,
    W: Write + AsRawFd + Send,
{
    let CopyRequest {
        source,
        sink,
        buffer_size,
        total_size,
        window_size,
        src_block,
        dst_block,
        thres_buf_debuf,
        dst_align,
        io_mode,
        force_paged_backing,
        crc_buffer_size,
        crc_block_size,
        sustain,
        mut on_progress,
    } = req;

    if dst_align > 1 && dst_block % dst_align != 0 {
        return Err(TapeIoError::Config("dst_block is not a multiple of dst_align"));
    }
    let largest_block = src_block.max(dst_block);
    if buffer_size < largest_block as u64 {
        return Err(TapeIoError::Config("buffer_size smaller than the larger of src_block/dst_block"));
    }
    if crc_buffer_size < largest_block {
        return Err(TapeIoError::Config("crc_buffer_size smaller than the larger of src_block/dst_block"));
    }
    if crc_buffer_size < crc_block_size {
        return Err(TapeIoError::Config("crc_buffer_size smaller than crc_block_size"));
    }

    tracing::info!(buffer_size, src_block, dst_block, io_mode = ?io_mode, "starting copy");

    let ring = ring::new_auto(buffer_size, window_size, force_paged_backing);
    let control = abort.control;
    let crc_priority = if sustain { Priority::AboveNormal } else { Priority::Normal };
    let read_crc = ChecksumStage::spawn(crc_buffer_size, crc_block_size, crc_priority);
    let write_crc = ChecksumStage::spawn(crc_buffer_size, crc_block_size, crc_priority);

    let read_stage = ReadStage::new(Arc::clone(&ring), thres_buf_debuf, src_block, io_mode);
    let write_stage = WriteStage::new(Arc::clone(&ring), thres_buf_debuf, dst_block, dst_align, io_mode);

    let mut read_rate = RateCounter::<8>::new();
    let mut write_rate = RateCounter::<8>::new();
    let start = Instant::now();

    let result: Result<((u64, u64), (u64, u64))> = std::thread::scope(|scope| {
        let reader_control = Arc::clone(&control);
        let reader = scope.spawn(move || read_stage.run(source, &reader_control, &read_crc));

        let writer_control = Arc::clone(&control);
        let writer = scope.spawn(move || write_stage.run(sink, &writer_control, &write_crc));

        loop {
            if reader.is_finished() && writer.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(STATS_REFRESH_INTERVAL_MS));
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let read_done = control.read_bytes_done.load(Ordering::Relaxed);
            let write_done = control.write_bytes_done.load(Ordering::Relaxed);
            read_rate.update(read_done, elapsed_ms);
            write_rate.update(write_done, elapsed_ms);

            let buffering = control.write_buffering.load(Ordering::Relaxed);
            let flushing = control.write_flushing.load(Ordering::Relaxed);
            let debuffering = control.read_debuffering.load(Ordering::Relaxed);
            let mode = if flushing {
                ProgressMode::Flushing
            } else if buffering {
                ProgressMode::Buffering
            } else if debuffering {
                ProgressMode::Debuffering
            } else {
                ProgressMode::Steady
            };

            let rate = if mode == ProgressMode::Steady {
                Rate::Single(write_rate.bytes_per_sec())
            } else {
                Rate::Dual {
                    read: read_rate.bytes_per_sec(),
                    write: write_rate.bytes_per_sec(),
                }
            };

            let eta = total_size.and_then(|total| {
                let remaining = total.saturating_sub(write_done);
                write_rate
                    .bytes_per_sec()
                    .filter(|r| *r > 0.0)
                    .map(|r| Duration::from_secs_f64(remaining as f64 / r))
            });

            if let Some(cb) = on_progress.as_mut() {
                cb(ProgressSample {
                    written: write_done,
                    total: total_size,
                    mode,
                    rate,
                    buffered: ring.data_avail(),
                    eta,
                });
            }
        }

        let read_total = reader.join().expect("read stage panicked")?;
        let write_total = writer.join().expect("write stage panicked")?;
        Ok((read_total, write_total))
    });

    let (_, (data_bytes, padded_bytes)) = result?;
    let source_crc = read_crc.finish();
    let sink_crc = write_crc.finish();

    if source_crc != sink_crc {
        tracing::error!(source_crc, sink_crc, "read/write CRC mismatch");
        return Err(TapeIoError::CrcMismatch);
    }

    let stream_end = *control.stream_end.lock().unwrap();
    tracing::info!(data_bytes, padded_bytes, "copy finished");

    Ok(CopyReport {
        data_bytes,
        padded_bytes,
        source_crc,
        sink_crc,
        stream_end,
    })
}

pub fn new_abort_pair() -> (AbortHandle, Arc<StageControl>) {
    let control = StageControl::new();
    (
        AbortHandle {
            control: Arc::clone(&control),
        },
        control,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Seek, Write as _};

    fn file_with(data: &[u8]) -> std::fs::File {
        let mut f = tempfile::tempfile().expect("create temp file");
        f.write_all(data).unwrap();
        f.rewind().unwrap();
        f
    }

    /// A source that yields `visible` bytes of `data` and then reports
    /// a filemark instead of running to plain EOF, standing in for a
    /// tape handle whose `Read` impl surfaces driver end-markers this
    /// way (see `crate::error::StreamEndKind`).
    struct FilemarkAfter {
        inner: std::fs::File,
        visible: u64,
    }

    impl std::io::Read for FilemarkAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let pos = self.inner.stream_position()?;
            if pos >= self.visible {
                return Err(std::io::Error::other(StreamEndKind::Filemark));
            }
            let cap = (self.visible - pos).min(buf.len() as u64) as usize;
            self.inner.read(&mut buf[..cap])
        }
    }

    impl AsRawFd for FilemarkAfter {
        fn as_raw_fd(&self) -> std::os::fd::RawFd {
            self.inner.as_raw_fd()
        }
    }

    fn read_all(f: &mut std::fs::File) -> Vec<u8> {
        f.rewind().unwrap();
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn identical_data_round_trips_with_matching_crc() {
        let data = vec![0u8; 4096];
        let (abort, _control) = new_abort_pair();
        let sink = tempfile::tempfile().unwrap();
        let mut sink_clone = sink.try_clone().unwrap();
        let report = copy(
            CopyRequest {
                source: file_with(&data),
                sink,
                buffer_size: 4096,
                total_size: None,
                window_size: 4096,
                force_paged_backing: false,
                src_block: 512,
                dst_block: 512,
                thres_buf_debuf: 512,
                dst_align: 1,
                io_mode: IoMode::Sync,
                crc_buffer_size: 4096,
                crc_block_size: 512,
                sustain: false,
                on_progress: None,
            },
            abort,
        )
        .unwrap();
        assert_eq!(report.data_bytes, data.len() as u64);
        assert_eq!(report.padded_bytes, data.len() as u64);
        assert_eq!(read_all(&mut sink_clone), data);
        assert_eq!(report.source_crc, report.sink_crc);
    }

    #[test]
    fn empty_source_copies_nothing_and_crcs_agree() {
        let (abort, _control) = new_abort_pair();
        let sink = tempfile::tempfile().unwrap();
        let report = copy(
            CopyRequest {
                source: tempfile::tempfile().unwrap(),
                sink,
                buffer_size: 4096,
                total_size: None,
                window_size: 4096,
                force_paged_backing: false,
                src_block: 512,
                dst_block: 512,
                thres_buf_debuf: 256,
                dst_align: 1,
                io_mode: IoMode::Sync,
                crc_buffer_size: 4096,
                crc_block_size: 512,
                sustain: false,
                on_progress: None,
            },
            abort,
        )
        .unwrap();
        assert_eq!(report.data_bytes, 0);
        assert_eq!(report.source_crc, report.sink_crc);
    }

    #[test]
    fn aborting_before_start_surfaces_as_aborted_error() {
        let (abort, _control) = new_abort_pair();
        abort.abort();
        let data = vec![0u8; 1 << 20];
        let sink = tempfile::tempfile().unwrap();
        let err = copy(
            CopyRequest {
                source: file_with(&data),
                sink,
                buffer_size: 4096,
                total_size: None,
                window_size: 4096,
                force_paged_backing: false,
                src_block: 512,
                dst_block: 512,
                thres_buf_debuf: 256,
                dst_align: 1,
                io_mode: IoMode::Sync,
                crc_buffer_size: 4096,
                crc_block_size: 512,
                sustain: false,
                on_progress: None,
            },
            abort,
        )
        .unwrap_err();
        assert!(matches!(err, TapeIoError::Aborted));
    }

    #[test]
    fn unaligned_tail_is_padded_to_dst_align() {
        let data = {
            let mut d = vec![0u8; 4097];
            d[0] = 1;
            d
        };
        let (abort, _control) = new_abort_pair();
        let sink = tempfile::tempfile().unwrap();
        let mut sink_clone = sink.try_clone().unwrap();
        let report = copy(
            CopyRequest {
                source: file_with(&data),
                sink,
                buffer_size: 8192,
                total_size: None,
                window_size: 4096,
                force_paged_backing: false,
                src_block: 4096,
                dst_block: 4096,
                thres_buf_debuf: 0,
                dst_align: 4096,
                io_mode: IoMode::Sync,
                crc_buffer_size: 8192,
                crc_block_size: 4096,
                sustain: false,
                on_progress: None,
            },
            abort,
        )
        .unwrap();
        assert_eq!(report.data_bytes, 4097);
        assert_eq!(report.padded_bytes, 8192);
        assert_eq!(read_all(&mut sink_clone).len(), 8192);
    }

    #[test]
    fn filemark_mid_stream_halts_cleanly_with_matching_crc() {
        let data = vec![9u8; 3000];
        let source = FilemarkAfter {
            inner: file_with(&data),
            visible: 2048,
        };
        let (abort, _control) = new_abort_pair();
        let sink = tempfile::tempfile().unwrap();
        let mut sink_clone = sink.try_clone().unwrap();
        let report = copy(
            CopyRequest {
                source,
                sink,
                buffer_size: 4096,
                total_size: None,
                window_size: 4096,
                force_paged_backing: false,
                src_block: 512,
                dst_block: 512,
                thres_buf_debuf: 256,
                dst_align: 1,
                io_mode: IoMode::Sync,
                crc_buffer_size: 4096,
                crc_block_size: 512,
                sustain: false,
                on_progress: None,
            },
            abort,
        )
        .unwrap();
        assert_eq!(report.data_bytes, 2048);
        assert_eq!(report.stream_end, Some(StreamEndKind::Filemark));
        assert_eq!(report.source_crc, report.sink_crc);
        assert_eq!(read_all(&mut sink_clone).len(), 2048);
    }
}
