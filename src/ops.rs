//! The vocabulary of tape operations the simulator reasons about and
//! the device adapter executes.
//!
//! This is the contract between a front end's command/config parser
//! and the core (spec.md §6): the set of operation kinds and their
//! payload shapes, not the adapter that runs them.

use std::path::PathBuf;

use bitflags::bitflags;

bitflags! {
    /// Feature bits reported by a drive, the low half of a 64-bit
    /// feature word (spec.md §6: "the high half is distinguished by
    /// the top bit of the feature constant").
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FeaturesLow: u32 {
        const SET_COMPRESSION     = 1 << 0;
        const SET_DATA_PADDING    = 1 << 1;
        const SET_ECC             = 1 << 2;
        const SET_REPORT_SETMARKS = 1 << 3;
        const SET_EOT_WARNING_ZONE = 1 << 4;
        const LOCK_UNLOCK         = 1 << 5;
        const LOAD_UNLOAD         = 1 << 6;
        const ERASE_LONG          = 1 << 7;
        const TAPE_CAPACITY       = 1 << 8;
        const TAPE_REMAINING      = 1 << 9;
        const TENSION             = 1 << 10;
        const WRITE_FILEMARKS    = 1 << 11;
        const WRITE_SETMARKS     = 1 << 12;
        const RELATIVE_BLKS       = 1 << 13;
        const REVERSE_POSITION    = 1 << 14;
        const SEEK_FILEMARKS      = 1 << 15;
        const SEEK_SETMARKS       = 1 << 16;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FeaturesHigh: u32 {
        const ABSOLUTE_BLK      = 1 << 0;
        const LOGICAL_BLK       = 1 << 1;
        const GET_ABSOLUTE_BLK  = 1 << 2;
        const GET_LOGICAL_BLK   = 1 << 3;
        const END_OF_DATA       = 1 << 4;
    }
}

bitflags! {
    /// CLI-facing option flags, owned by a front end and threaded
    /// through read-only. Only `SHOW_OPS`, `TEST_MODE`,
    /// `CONFIRM_OVERWRITE`, `NO_EXTRA_CHECKS`, and `NO_OVERWRITE_CHECK`
    /// feed a `simulate()` decision; `FORCE` and most of the other
    /// flags spec.md §6 lists (`EXIT`, `SHOW_HELP`, `VERBOSE`, `QUIET`,
    /// `LIST_DRIVE_INFO`, ...) never do — `original_source/src/cmdcheck.c`
    /// never reads `OPT_FORCE` either; a front end that gets back one
    /// of `Decision`'s prompt variants and has `FORCE` set is the one
    /// that decides to answer yes without asking, after `simulate()`
    /// has already run. `WINDOWS_BUFFERING` is the one exception: it
    /// doesn't feed `simulate()`, but `adapter::run_one` reads it to
    /// decide whether the local file side of a copy opens with direct
    /// I/O, mirroring `tapeio.c`'s `tape_io_init_buffer`. See DESIGN.md.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OptionFlags: u32 {
        /// Never prompt; a front end concern, not read by `simulate()`.
        const FORCE        = 1 << 0;
        /// List the derived operation sequence instead of running it.
        const SHOW_OPS     = 1 << 1;
        /// Dry run: never proceed, regardless of severity.
        const TEST_MODE    = 1 << 2;
        /// Prompt even on a plain overwrite, not just warnings/errors.
        const CONFIRM_OVERWRITE = 1 << 3;
        /// Skip feature/range checks entirely (`NO_EXTRA_CHECKS`).
        const NO_EXTRA_CHECKS = 1 << 4;
        /// Skip overwrite prompting entirely (`NO_OVERWRITE_CHECK`).
        const NO_OVERWRITE_CHECK = 1 << 5;
        /// Open the local file side of a copy with the OS's ordinary
        /// buffered I/O instead of direct I/O + 4-KiB alignment
        /// (spec.md §6's "file side only" buffering toggle).
        const WINDOWS_BUFFERING = 1 << 6;
    }
}

/// A `MAKE_PARTITION` sizing method: fixed-size partitions, or one
/// partition sized to use the remainder of the tape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionMethod {
    Fixed,
    Select,
}

/// One tape operation in a requested sequence.
///
/// Every variant is a symbolic request; whether it is safe to issue
/// against the drive/media currently loaded is decided by
/// [`crate::sim::simulate`] before [`crate::device::execute`] ever
/// touches real hardware. The variant set and payload shapes mirror
/// spec.md §6's table; only names were adapted to Rust idiom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TapeOperation {
    // Drive group
    SetCompression { enabled: bool },
    SetDataPadding { enabled: bool },
    SetEcc { enabled: bool },
    SetReportSetmarks { enabled: bool },
    SetEotWarningZone { size: u64 },
    SetBlockSize { size: u32 },
    LockTapeEject,
    UnlockTapeEject,

    // Media group
    LoadMedia,
    UnloadMedia,
    EraseTape { long: bool },
    ListTapeCapacity,
    TapeTension,
    MakePartition { method: PartitionMethod, count: u32, size: u64 },

    // Navigation group
    ListCurrentPosition,
    MoveToOrigin,
    MoveToEod,
    SetAbsPosition { block: u64 },
    SetTapePosition { partition: u32, block: u64 },
    MoveBlockNext { count: u32 },
    MoveBlockPrev { count: u32 },
    MoveFileNext { count: u32 },
    MoveFilePrev { count: u32 },
    MoveSmkNext { count: u32 },
    MoveSmkPrev { count: u32 },

    // Data group
    ReadData { path: PathBuf },
    WriteData { path: PathBuf },
    WriteDataAndFmk { path: PathBuf },
    WriteFilemark { count: u32 },
    WriteSetmark { count: u32 },
    Truncate,
}

impl TapeOperation {
    /// Feature bit(s) this operation requires the drive to report, for
    /// the common case of a single required low/high pair that must
    /// both be present. `ListTapeCapacity` and `ListCurrentPosition`
    /// are satisfied by *either* of two bits instead and are checked
    /// specially in [`crate::sim::simulate`] rather than through this
    /// method.
    pub fn required_features(&self) -> (FeaturesLow, FeaturesHigh) {
        use TapeOperation::*;
        match self {
            SetCompression { .. } => (FeaturesLow::SET_COMPRESSION, FeaturesHigh::empty()),
            SetDataPadding { .. } => (FeaturesLow::SET_DATA_PADDING, FeaturesHigh::empty()),
            SetEcc { .. } => (FeaturesLow::SET_ECC, FeaturesHigh::empty()),
            SetReportSetmarks { .. } => (FeaturesLow::SET_REPORT_SETMARKS, FeaturesHigh::empty()),
            SetEotWarningZone { .. } => (FeaturesLow::SET_EOT_WARNING_ZONE, FeaturesHigh::empty()),
            SetBlockSize { .. } => (FeaturesLow::empty(), FeaturesHigh::empty()),
            LockTapeEject | UnlockTapeEject => (FeaturesLow::LOCK_UNLOCK, FeaturesHigh::empty()),
            LoadMedia | UnloadMedia => (FeaturesLow::LOAD_UNLOAD, FeaturesHigh::empty()),
            EraseTape { .. } => (FeaturesLow::ERASE_LONG, FeaturesHigh::empty()),
            ListTapeCapacity => (FeaturesLow::empty(), FeaturesHigh::empty()),
            TapeTension => (FeaturesLow::TENSION, FeaturesHigh::empty()),
            MakePartition { .. } => (FeaturesLow::empty(), FeaturesHigh::empty()),
            ListCurrentPosition => (FeaturesLow::empty(), FeaturesHigh::empty()),
            MoveToOrigin | MoveToEod => (FeaturesLow::empty(), FeaturesHigh::END_OF_DATA),
            SetAbsPosition { .. } => (FeaturesLow::empty(), FeaturesHigh::ABSOLUTE_BLK),
            SetTapePosition { .. } => (FeaturesLow::empty(), FeaturesHigh::LOGICAL_BLK),
            MoveBlockNext { .. } => (FeaturesLow::RELATIVE_BLKS, FeaturesHigh::empty()),
            MoveBlockPrev { .. } => (FeaturesLow::RELATIVE_BLKS | FeaturesLow::REVERSE_POSITION, FeaturesHigh::empty()),
            MoveFileNext { .. } => (FeaturesLow::SEEK_FILEMARKS, FeaturesHigh::empty()),
            MoveFilePrev { .. } => (FeaturesLow::SEEK_FILEMARKS | FeaturesLow::REVERSE_POSITION, FeaturesHigh::empty()),
            MoveSmkNext { .. } => (FeaturesLow::SEEK_SETMARKS, FeaturesHigh::empty()),
            MoveSmkPrev { .. } => (FeaturesLow::SEEK_SETMARKS | FeaturesLow::REVERSE_POSITION, FeaturesHigh::empty()),
            ReadData { .. } => (FeaturesLow::empty(), FeaturesHigh::empty()),
            WriteData { .. } | WriteDataAndFmk { .. } => (FeaturesLow::empty(), FeaturesHigh::empty()),
            WriteFilemark { .. } => (FeaturesLow::WRITE_FILEMARKS, FeaturesHigh::empty()),
            WriteSetmark { .. } => (FeaturesLow::WRITE_SETMARKS, FeaturesHigh::empty()),
            Truncate => (FeaturesLow::empty(), FeaturesHigh::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_seeks_require_both_the_seek_bit_and_reverse_position() {
        let (low, high) = TapeOperation::MoveFilePrev { count: 1 }.required_features();
        assert!(low.contains(FeaturesLow::SEEK_FILEMARKS));
        assert!(low.contains(FeaturesLow::REVERSE_POSITION));
        assert!(high.is_empty());
    }

    #[test]
    fn forward_seeks_do_not_require_reverse_position() {
        let (low, _) = TapeOperation::MoveFileNext { count: 1 }.required_features();
        assert!(low.contains(FeaturesLow::SEEK_FILEMARKS));
        assert!(!low.contains(FeaturesLow::REVERSE_POSITION));
    }

    #[test]
    fn set_block_size_carries_no_feature_requirement() {
        let (low, high) = TapeOperation::SetBlockSize { size: 512 }.required_features();
        assert!(low.is_empty() && high.is_empty());
    }
}
