//! The free function that turns an approved sequence of `TapeOperation`s
//! into device calls — the one seam where [`crate::copy::copy`] is
//! actually invoked.
//!
//! Grounded on `original_source/src/cmdexec.c::tape_operation_execute`:
//! a switch over the operation kind that dispatches to one of a
//! handful of device primitives, with `OP_READ_DATA` routed through
//! `tape_file_read` and `OP_WRITE_DATA`/`OP_WRITE_DATA_AND_FMK` through
//! `tape_file_write`, the latter followed by a tapemark write on
//! success. Everything else is a single device call with no file on
//! either side.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::config::EngineConfig;
use crate::copy::{self, AbortHandle, CopyReport, CopyRequest, ProgressSample};
use crate::device::TapeDevice;
use crate::error::{Result, TapeIoError};
use crate::io::{self, IoMode};
use crate::ops::{OptionFlags, TapeOperation};

/// Alignment direct I/O requires for the local file side, per spec.md
/// §6 ("direct I/O and 4-KiB alignment" when `WINDOWS_BUFFERING` is
/// off). Mirrors `tapeio.c`'s fixed `file_block_align`.
const DIRECT_IO_ALIGN: usize = 4096;

/// Open the local file side for reading, applying direct I/O unless
/// `windows_buffering` is set. Grounded on `tapeio.c`'s
/// `tape_io_init_buffer`, which sets `ctx->file_open_flags` from the
/// same toggle before the file is ever opened.
fn open_source_file(path: &Path, windows_buffering: bool) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if !windows_buffering {
        opts.custom_flags(io::direct_open_flags());
    }
    let file = opts.open(path)?;
    if !windows_buffering {
        io::configure_direct_io(file.as_raw_fd())?;
    }
    Ok(file)
}

/// Open the local file side for writing (truncating/creating), same
/// direct-I/O gating as [`open_source_file`].
fn create_dest_file(path: &Path, windows_buffering: bool) -> std::io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    if !windows_buffering {
        opts.custom_flags(io::direct_open_flags());
    }
    let file = opts.open(path)?;
    if !windows_buffering {
        io::configure_direct_io(file.as_raw_fd())?;
    }
    Ok(file)
}

/// What happened when one operation was handed to the device.
#[derive(Debug)]
pub enum OpOutcome {
    /// A non-data device call completed (rewind, erase, set-feature, ...).
    Ran,
    /// `ReadData`/`WriteData`/`WriteDataAndFmk` completed; carries the
    /// underlying copy's report.
    Copied(CopyReport),
    /// Not attempted because an earlier operation in the sequence
    /// already failed — the original aborts the rest of the command
    /// line on the first error rather than attempting every operation
    /// independently.
    Skipped,
}

/// Outcome of one operation from the sequence passed to [`execute`].
pub struct OpResult {
    pub op_index: usize,
    pub outcome: std::result::Result<OpOutcome, TapeIoError>,
}

/// Run every operation in `ops` against `device` in order, routing the
/// data-group operations through [`crate::copy::copy`]. Stops issuing
/// new operations after the first failure; every operation after that
/// point is reported [`OpOutcome::Skipped`].
///
/// Callers are expected to have already run [`crate::sim::simulate`]
/// and gotten back [`crate::sim::Decision::Proceed`] for this exact
/// sequence; `execute` does not re-check safety.
pub fn execute(
    ops: &[TapeOperation],
    device: &dyn TapeDevice,
    flags: OptionFlags,
    cfg: &EngineConfig,
    abort: &AbortHandle,
    mut on_progress: Option<&mut dyn FnMut(ProgressSample)>,
) -> Vec<OpResult> {
    let mut results = Vec::with_capacity(ops.len());
    let mut failed = false;

    for (idx, op) in ops.iter().enumerate() {
        if failed {
            results.push(OpResult {
                op_index: idx,
                outcome: Ok(OpOutcome::Skipped),
            });
            continue;
        }

        let reborrowed_progress = on_progress.as_mut().map(|f| &mut **f as &mut dyn FnMut(ProgressSample));
        let outcome = run_one(op, device, flags, cfg, abort, reborrowed_progress);
        if outcome.is_err() {
            tracing::error!(op_index = idx, ?op, "tape operation failed, skipping the rest");
            failed = true;
        }
        results.push(OpResult { op_index: idx, outcome });
    }

    results
}

fn run_one(
    op: &TapeOperation,
    device: &dyn TapeDevice,
    flags: OptionFlags,
    cfg: &EngineConfig,
    abort: &AbortHandle,
    on_progress: Option<&mut dyn FnMut(ProgressSample)>,
) -> std::result::Result<OpOutcome, TapeIoError> {
    let windows_buffering = flags.contains(OptionFlags::WINDOWS_BUFFERING);
    match op {
        TapeOperation::ReadData { path } => {
            let tape = device.data_handle()?;
            let file = create_dest_file(path, windows_buffering).map_err(TapeIoError::Io)?;
            let dst_align = if windows_buffering { 1 } else { DIRECT_IO_ALIGN };
            Ok(OpOutcome::Copied(run_copy(tape, file, cfg, abort, dst_align, on_progress)?))
        }
        TapeOperation::WriteData { path } => {
            let file = open_source_file(path, windows_buffering).map_err(TapeIoError::Io)?;
            let tape = device.data_handle()?;
            Ok(OpOutcome::Copied(run_copy(file, tape, cfg, abort, 1, on_progress)?))
        }
        TapeOperation::WriteDataAndFmk { path } => {
            let file = open_source_file(path, windows_buffering).map_err(TapeIoError::Io)?;
            let tape = device.data_handle()?;
            let report = run_copy(file, tape, cfg, abort, 1, on_progress)?;
            device.execute(TapeOperation::WriteFilemark { count: 1 })?;
            Ok(OpOutcome::Copied(report))
        }
        other => {
            device.execute(other.clone())?;
            Ok(OpOutcome::Ran)
        }
    }
}

fn run_copy<R, W>(
    source: R,
    sink: W,
    cfg: &EngineConfig,
    abort: &AbortHandle,
    dst_align: usize,
    on_progress: Option<&mut dyn FnMut(ProgressSample)>,
) -> Result<CopyReport>
where
    R: Read + AsRawFd + Send,
    W: Write + AsRawFd + Send,
{
    copy::copy(
        CopyRequest {
            source,
            sink,
            buffer_size: cfg.buffer_size,
            total_size: None,
            window_size: cfg.window_size,
            src_block: cfg.io_block_size,
            dst_block: cfg.io_block_size,
            thres_buf_debuf: cfg.io_block_size * 2,
            dst_align,
            io_mode: IoMode::Async {
                queue_depth: cfg.queue_depth,
            },
            force_paged_backing: cfg.wants_paged_backing(),
            crc_buffer_size: cfg.crc_buffer_size,
            crc_block_size: cfg.crc_block_size,
            sustain: true,
            on_progress,
        },
        abort.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DriveParams, MediaParams, RecordingDevice};
    use crate::ops::{FeaturesHigh, FeaturesLow};
    use std::io::{Read as _, Seek, Write as _};

    fn device() -> RecordingDevice {
        RecordingDevice::new(
            DriveParams {
                features_low: FeaturesLow::all(),
                features_high: FeaturesHigh::all(),
                max_partition_count: 1,
                min_block_size: 1,
                max_block_size: 1 << 20,
                default_block_size: 512,
            },
            MediaParams::default(),
        )
    }

    #[test]
    fn write_data_then_read_data_round_trips_through_the_device() {
        let dev = device();
        let cfg = EngineConfig {
            buffer_size: 64 << 10,
            io_block_size: 4096,
            queue_depth: 4,
            ..EngineConfig::default()
        };
        let (abort, _control) = copy::new_abort_pair();

        let mut src = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![42u8; 20_000];
        src.write_all(&payload).unwrap();
        src.flush().unwrap();

        // WINDOWS_BUFFERING: the test temp dir may be on tmpfs, which
        // doesn't support O_DIRECT.
        let results = execute(
            &[TapeOperation::WriteData { path: src.path().to_path_buf() }],
            &dev,
            OptionFlags::WINDOWS_BUFFERING,
            &cfg,
            &abort,
            None,
        );
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, Ok(OpOutcome::Copied(_))));

        let dst = tempfile::NamedTempFile::new().unwrap();
        let results = execute(
            &[TapeOperation::ReadData { path: dst.path().to_path_buf() }],
            &dev,
            OptionFlags::WINDOWS_BUFFERING,
            &cfg,
            &abort,
            None,
        );
        assert!(matches!(results[0].outcome, Ok(OpOutcome::Copied(_))));

        let mut out = Vec::new();
        let mut f = dst.reopen().unwrap();
        f.rewind().unwrap();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn write_data_and_fmk_writes_a_filemark_after_the_copy() {
        let dev = device();
        let cfg = EngineConfig {
            buffer_size: 64 << 10,
            io_block_size: 4096,
            queue_depth: 4,
            ..EngineConfig::default()
        };
        let (abort, _control) = copy::new_abort_pair();
        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(&[1u8; 4096]).unwrap();
        src.flush().unwrap();

        // WINDOWS_BUFFERING: the test temp dir may be on tmpfs, which
        // doesn't support O_DIRECT.
        execute(
            &[TapeOperation::WriteDataAndFmk { path: src.path().to_path_buf() }],
            &dev,
            OptionFlags::WINDOWS_BUFFERING,
            &cfg,
            &abort,
            None,
        );

        let log = dev.executed.lock().unwrap();
        assert_eq!(log.last(), Some(&TapeOperation::WriteFilemark { count: 1 }));
    }

    #[test]
    fn a_failed_operation_skips_the_rest_of_the_sequence() {
        let dev = device();
        let cfg = EngineConfig::default();
        let (abort, _control) = copy::new_abort_pair();

        let results = execute(
            &[
                TapeOperation::WriteData { path: "/nonexistent/does-not-exist".into() },
                TapeOperation::MoveToOrigin,
            ],
            &dev,
            OptionFlags::empty(),
            &cfg,
            &abort,
            None,
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].outcome.is_err());
        assert!(matches!(results[1].outcome, Ok(OpOutcome::Skipped)));
    }

    #[test]
    fn non_data_operations_are_forwarded_to_the_device_unchanged() {
        let dev = device();
        let cfg = EngineConfig::default();
        let (abort, _control) = copy::new_abort_pair();

        let results = execute(&[TapeOperation::MoveToOrigin], &dev, OptionFlags::empty(), &cfg, &abort, None);
        assert!(matches!(results[0].outcome, Ok(OpOutcome::Ran)));
        assert_eq!(dev.executed.lock().unwrap().as_slice(), &[TapeOperation::MoveToOrigin]);
    }
}
