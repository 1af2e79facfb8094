//! The seam between this crate's engine and a real tape drive.
//!
//! Nothing in here issues an ioctl. `TapeDevice` is implemented by
//! whatever front end owns the raw device handle; this crate only
//! needs to query parameters and hand off `TapeOperation`s and byte
//! streams through the trait, which keeps the engine testable with a
//! fake drive and a temp file standing in for media.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TapeIoError};
use crate::ops::{FeaturesHigh, FeaturesLow, TapeOperation};

/// Static capabilities and current state of the loaded drive. Mirrors
/// `TAPE_GET_DRIVE_PARAMETERS` (spec.md §6): feature bits plus the
/// block-size and partition-count bounds the simulator checks
/// `SET_BLOCK_SIZE`/`MAKE_PARTITION` operations against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriveParams {
    pub features_low: FeaturesLow,
    pub features_high: FeaturesHigh,
    pub max_partition_count: u32,
    pub min_block_size: u32,
    pub max_block_size: u32,
    pub default_block_size: u32,
}

/// Static capacity/position facts about the tape currently loaded.
///
/// Any of these may be unknown (`None`) at a given point — the
/// simulator re-derives whichever one is missing from the other two
/// once an operation pins down enough information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MediaParams {
    pub capacity: Option<u64>,
    pub remaining: Option<u64>,
    pub position: Option<u64>,
    pub write_protected: bool,
    pub partition_count: u32,
}

/// What a front end must provide so this crate can run a copy or a
/// tape operation without knowing how the hardware is actually
/// accessed.
pub trait TapeDevice: Send + Sync {
    fn drive_params(&self) -> Result<DriveParams>;
    fn media_params(&self) -> Result<MediaParams>;

    /// Execute one already-approved tape operation (rewind, erase,
    /// write filemarks, ...). Called only after
    /// [`crate::sim::simulate`] has returned [`crate::sim::Decision::Proceed`]
    /// for the sequence containing it.
    fn execute(&self, op: TapeOperation) -> Result<()>;

    /// A real file descriptor positioned at the tape's current data
    /// block, for `ReadData`/`WriteData`/`WriteDataAndFmk` to hand to
    /// [`crate::copy::copy`] as the source or sink, whichever side the
    /// drive is playing. Narrower than the original's separate
    /// `read`/`write` device primitives (see DESIGN.md), but the ring
    /// buffer / I/O stage machinery only needs a `Read + Write +
    /// AsRawFd` handle either way.
    fn data_handle(&self) -> Result<std::fs::File>;
}

static NEXT_DATA_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

/// A path under the system temp directory that no other call to this
/// function, in this process, will ever return again. Standing in for
/// `mkstemp` without pulling the `tempfile` crate into non-test code.
fn unique_temp_path(prefix: &str) -> std::path::PathBuf {
    let id = NEXT_DATA_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}-{}-{id}", std::process::id()))
}

/// A `TapeDevice` that records every call instead of touching
/// hardware, for tests and for `--show-operations`-style dry runs.
pub struct RecordingDevice {
    drive: DriveParams,
    media: std::sync::Mutex<MediaParams>,
    pub executed: std::sync::Mutex<Vec<TapeOperation>>,
    /// Backing file standing in for the tape's data region, so a
    /// `WriteData` followed by a `ReadData` in the same test sees the
    /// bytes it wrote. Created lazily on first `data_handle` call.
    data_path: std::sync::OnceLock<std::path::PathBuf>,
}

impl RecordingDevice {
    pub fn new(drive: DriveParams, media: MediaParams) -> Self {
        Self {
            drive,
            media: std::sync::Mutex::new(media),
            executed: std::sync::Mutex::new(Vec::new()),
            data_path: std::sync::OnceLock::new(),
        }
    }
}

impl Drop for RecordingDevice {
    fn drop(&mut self) {
        if let Some(path) = self.data_path.get() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl TapeDevice for RecordingDevice {
    fn drive_params(&self) -> Result<DriveParams> {
        Ok(self.drive)
    }

    fn media_params(&self) -> Result<MediaParams> {
        Ok(*self.media.lock().unwrap())
    }

    fn execute(&self, op: TapeOperation) -> Result<()> {
        tracing::debug!(?op, "recording device: executed");
        self.executed.lock().unwrap().push(op);
        Ok(())
    }

    fn data_handle(&self) -> Result<std::fs::File> {
        let path = self.data_path.get_or_init(|| unique_temp_path("tapestream-recording-device"));
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| TapeIoError::Device(format!("recording device backing file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_device_keeps_call_order() {
        let dev = RecordingDevice::new(
            DriveParams {
                features_low: FeaturesLow::all(),
                features_high: FeaturesHigh::all(),
                max_partition_count: 1,
                min_block_size: 1,
                max_block_size: 1 << 20,
                default_block_size: 512,
            },
            MediaParams::default(),
        );
        dev.execute(TapeOperation::MoveToOrigin).unwrap();
        dev.execute(TapeOperation::EraseTape { long: false }).unwrap();
        let log = dev.executed.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], TapeOperation::MoveToOrigin);
    }
}
