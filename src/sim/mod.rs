//! A deterministic "lint" over a proposed sequence of tape operations:
//! given the drive/media state as currently known, decide whether the
//! sequence is safe to run, and if not, why.
//!
//! This never touches a device (it may touch the filesystem, to stat a
//! `READ_DATA`/`WRITE_DATA` source or destination path, exactly as the
//! operation itself eventually will). It walks the operation list
//! once, accumulating diagnostics and updating its best guess at
//! drive/media state as each operation pins one of them down, then
//! folds the diagnostics and the active [`OptionFlags`] into a final
//! [`Decision`]. Grounded directly on
//! `original_source/src/cmdcheck.c::tape_operation_check`/
//! `check_tape_operations`.

use std::path::Path;

use crate::config::cap_thres;
use crate::device::{DriveParams, MediaParams};
use crate::ops::{FeaturesHigh, FeaturesLow, PartitionMethod, TapeOperation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Overwrite,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub op_index: usize,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn new(op_index: usize, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            op_index,
            severity,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// At least one operation has an error-severity diagnostic.
    Reject,
    /// A warning-severity diagnostic, or an overwrite under
    /// `CONFIRM_OVERWRITE`: the original's prompt defaults to "no".
    PromptWarning,
    /// `SHOW_OPS` asked to list the planned operations before running
    /// them: the original's prompt defaults to "yes".
    PromptShow,
    /// Nothing warned or errored, but an overwrite is about to happen
    /// with no explicit confirmation requested: the original shows a
    /// countdown the operator can interrupt, defaulting to "yes".
    PromptCountdownOverwrite,
    /// `TEST_MODE` was set: the simulator ran the full check exactly
    /// as it would otherwise, but dry-run mode never proceeds to
    /// execution regardless of what the diagnostics found.
    Refused,
    /// Clear to run as-is.
    Proceed,
}

/// The simulator's running model of drive/media state (spec.md §3,
/// "Drive/media state (simulator)"). Every flag mirrors one of the
/// original's `ST_*` bits; `None` fields are the `Option`-typed
/// analogue of a missing `ST_CAPACITY`/`ST_REMAINING`/`ST_POSITION`
/// bit — "this quantity is not currently knowable", not zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimState {
    pub single_partition: bool,
    pub capacity: Option<u64>,
    pub remaining: Option<u64>,
    pub unloaded: bool,
    pub empty: bool,
    pub dirty: bool,
    pub position: Option<u64>,
    pub at_end_of_data: bool,
    pub no_filemark: bool,
    pub at_filemark: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimReport {
    pub diagnostics: Vec<Diagnostic>,
    pub decision: Decision,
    pub final_state: SimState,
}

impl SimReport {
    pub fn worst_severity(&self) -> Option<Severity> {
        self.diagnostics.iter().map(|d| d.severity).max()
    }
}

/// True if `drive` is absent (the original's "can't check, assume
/// supported" null-drive fallback) or reports every bit in both
/// `low`/`high` that was asked for (empty bitsets always pass).
fn check_feature(drive: Option<&DriveParams>, low: FeaturesLow, high: FeaturesHigh) -> bool {
    match drive {
        None => true,
        Some(d) => d.features_low.contains(low) && d.features_high.contains(high),
    }
}

/// `ListTapeCapacity`/`ListCurrentPosition` are satisfied by *either*
/// of two bits (spec.md §6's "or reporting" pair), not both — the one
/// shape `required_features`'s AND-of-both-words model can't express.
fn check_feature_any(drive: Option<&DriveParams>, low: FeaturesLow, high: FeaturesHigh) -> bool {
    match drive {
        None => true,
        Some(d) => d.features_low.intersects(low) || d.features_high.intersects(high),
    }
}

fn check_required_feature(
    drive: Option<&DriveParams>,
    op: &TapeOperation,
    idx: usize,
    no_extra_checks: bool,
    diags: &mut Vec<Diagnostic>,
) {
    if no_extra_checks {
        return;
    }
    let (low, high) = op.required_features();
    if (low.is_empty() && high.is_empty()) || check_feature(drive, low, high) {
        return;
    }
    diags.push(Diagnostic::new(
        idx,
        Severity::Error,
        format!("drive does not support {op:?}"),
    ));
}

fn check_src_file(path: &Path, idx: usize, diags: &mut Vec<Diagnostic>) -> Option<u64> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        Ok(_) => {
            diags.push(Diagnostic::new(
                idx,
                Severity::Error,
                format!("can't open \"{}\": not a regular file", path.display()),
            ));
            None
        }
        Err(e) => {
            diags.push(Diagnostic::new(
                idx,
                Severity::Error,
                format!("can't open \"{}\": {e}", path.display()),
            ));
            None
        }
    }
}

fn check_dest_file(path: &Path, overwrite_check: bool, idx: usize, diags: &mut Vec<Diagnostic>) {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if meta.permissions().readonly() {
                diags.push(Diagnostic::new(
                    idx,
                    Severity::Error,
                    format!("can't save to \"{}\": it's read-only", path.display()),
                ));
            } else if meta.is_dir() {
                diags.push(Diagnostic::new(
                    idx,
                    Severity::Error,
                    format!("can't save to \"{}\": it's a directory", path.display()),
                ));
            } else if overwrite_check {
                diags.push(Diagnostic::new(
                    idx,
                    Severity::Warning,
                    format!("destination \"{}\" will be overwritten", path.display()),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            diags.push(Diagnostic::new(
                idx,
                Severity::Error,
                format!("can't check \"{}\": {e}", path.display()),
            ));
        }
    }
}

/// Apply the "update check flags" and "single-partition end-of-data"
/// reconciliation passes `check_tape_operations` runs after every
/// operation in the list.
fn reconcile(state: &mut SimState) {
    if state.empty
        || (state.at_end_of_data && state.position == Some(0))
        || (state.capacity.is_some() && state.capacity == state.remaining)
    {
        state.dirty = false;
        state.no_filemark = false;
        state.at_filemark = false;
        state.empty = true;
        state.position = Some(0);
        state.at_end_of_data = true;
    }
    if state.single_partition && state.at_end_of_data {
        match (state.capacity, state.remaining, state.position) {
            (Some(cap), Some(rem), None) => state.position = Some(cap.saturating_sub(rem)),
            (Some(cap), None, Some(pos)) => state.remaining = Some(cap.saturating_sub(pos)),
            (None, Some(rem), Some(pos)) => state.capacity = Some(rem + pos),
            _ => {}
        }
    }
}

/// Walk `ops` against `drive`/`media` (either may be absent — no drive
/// handle open, or no media loaded) and report every diagnostic plus
/// the resulting go/no-go decision.
pub fn simulate(
    ops: &[TapeOperation],
    drive: Option<&DriveParams>,
    media: Option<&MediaParams>,
    options: crate::ops::OptionFlags,
) -> SimReport {
    use crate::ops::OptionFlags;

    let no_extra_checks = options.contains(OptionFlags::NO_EXTRA_CHECKS);
    let no_overwrite_check = options.contains(OptionFlags::NO_OVERWRITE_CHECK);

    let mut diags = Vec::new();
    let mut state = SimState::default();

    if let Some(drive) = drive {
        if drive.max_partition_count <= 1 {
            state.single_partition = true;
        }
    }
    match media {
        Some(media) => {
            if media.partition_count == 1 {
                state.single_partition = true;
            }
            if check_feature(drive, FeaturesLow::TAPE_CAPACITY, FeaturesHigh::empty())
                && media.capacity.is_some_and(|c| c != 0)
            {
                state.capacity = media.capacity;
            }
            if check_feature(drive, FeaturesLow::TAPE_REMAINING, FeaturesHigh::empty())
                && media.remaining != media.capacity
            {
                state.remaining = media.remaining;
            }
            if state.capacity.is_some() && state.capacity == state.remaining {
                state.empty = true;
                state.position = Some(0);
                state.at_end_of_data = true;
            } else {
                // The live "are we at block 0" probe
                // `check_tape_operations` performs via `GetTapePosition`
                // needs an open device handle, which is out of this
                // crate's scope (§1); the caller already queried
                // `MediaParams` through one, so a known starting
                // position just carries over from there.
                state.position = media.position;
            }
        }
        None => state.unloaded = true,
    }

    for (idx, op) in ops.iter().enumerate() {
        let media_required = !matches!(op, TapeOperation::LoadMedia) && state.unloaded;

        match op {
            TapeOperation::SetCompression { .. }
            | TapeOperation::SetDataPadding { .. }
            | TapeOperation::SetEcc { .. }
            | TapeOperation::SetReportSetmarks { .. } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
            }
            TapeOperation::SetEotWarningZone { .. } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
            }
            TapeOperation::SetBlockSize { size } => {
                if !no_extra_checks {
                    if let Some(drive) = drive {
                        if *size != 0 && (*size < drive.min_block_size || *size > drive.max_block_size) {
                            diags.push(Diagnostic::new(
                                idx,
                                Severity::Error,
                                format!(
                                    "block size of {size} is out of limit ({} to {} bytes)",
                                    drive.min_block_size, drive.max_block_size
                                ),
                            ));
                        }
                    }
                }
            }
            TapeOperation::LockTapeEject | TapeOperation::UnlockTapeEject => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
            }

            TapeOperation::LoadMedia => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                if state.unloaded {
                    state.unloaded = false;
                    state.position = Some(0);
                }
            }
            TapeOperation::UnloadMedia => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                state.position = None;
                state.at_end_of_data = false;
                state.at_filemark = false;
                state.no_filemark = false;
                state.unloaded = true;
            }
            TapeOperation::MakePartition { count, .. } => {
                if !no_extra_checks {
                    if let Some(drive) = drive {
                        if drive.max_partition_count <= 1 {
                            diags.push(Diagnostic::new(idx, Severity::Warning, "drive does not support creating partitions"));
                        }
                    }
                    if state.dirty {
                        diags.push(Diagnostic::new(idx, Severity::Warning, "suspicious formatting of media after writing data to it"));
                    }
                }
                if !no_overwrite_check && !state.empty {
                    diags.push(Diagnostic::new(idx, Severity::Overwrite, "creating partitions will destroy all data on the media"));
                }
                // Preserved bug, not fixed: the source this logic was
                // ported from reads `drive == NULL || max_partition_count > 1`
                // for the single-partition downgrade (almost certainly
                // meant to be `&&`) — see DESIGN.md. A missing drive
                // is treated as "supports multi-partition" rather than
                // leaving `single_partition` untouched.
                if drive.is_none() || drive.is_some_and(|d| d.max_partition_count > 1) {
                    state.single_partition = false;
                }
                state.remaining = None;
                state.dirty = false;
                state.no_filemark = false;
                state.at_filemark = false;
                state.empty = true;
                state.position = Some(0);
                state.at_end_of_data = true;
                let _ = count;
            }
            TapeOperation::EraseTape { .. } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                if !no_extra_checks && state.dirty {
                    diags.push(Diagnostic::new(idx, Severity::Warning, "suspicious erasing of media after writing data to it"));
                }
                if !no_overwrite_check && !state.empty {
                    diags.push(Diagnostic::new(idx, Severity::Overwrite, "erasing will destroy all data on the media"));
                }
                state.remaining = None;
                state.dirty = false;
                state.no_filemark = false;
                state.at_filemark = false;
                state.empty = true;
                state.position = Some(0);
                state.at_end_of_data = true;
            }
            TapeOperation::ListTapeCapacity => {
                if !no_extra_checks
                    && !check_feature_any(drive, FeaturesLow::TAPE_CAPACITY | FeaturesLow::TAPE_REMAINING, FeaturesHigh::empty())
                {
                    diags.push(Diagnostic::new(idx, Severity::Error, "media capacity reporting is not supported by the drive"));
                }
            }
            TapeOperation::TapeTension => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                state.at_end_of_data = false;
                state.no_filemark = false;
                state.at_filemark = false;
                state.position = Some(0);
            }

            TapeOperation::ListCurrentPosition => {
                if !no_extra_checks
                    && !check_feature_any(drive, FeaturesLow::empty(), FeaturesHigh::GET_ABSOLUTE_BLK | FeaturesHigh::GET_LOGICAL_BLK)
                {
                    diags.push(Diagnostic::new(idx, Severity::Error, "drive does not support current position reporting"));
                }
            }
            TapeOperation::MoveToOrigin => {
                state.at_end_of_data = false;
                state.no_filemark = false;
                state.at_filemark = false;
                state.position = Some(0);
            }
            TapeOperation::MoveToEod => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                state.position = None;
                state.no_filemark = false;
                state.at_filemark = false;
                state.at_end_of_data = true;
            }
            TapeOperation::SetAbsPosition { block } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                state.position = None;
                state.at_end_of_data = false;
                state.no_filemark = false;
                state.at_filemark = false;
                if *block == 0 {
                    state.position = Some(0);
                }
            }
            TapeOperation::SetTapePosition { partition, block } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                if !no_extra_checks && state.single_partition && *partition > 1 {
                    diags.push(Diagnostic::new(idx, Severity::Warning, "current media is formatted with a single partition"));
                }
                state.position = None;
                state.at_end_of_data = false;
                state.no_filemark = false;
                state.at_filemark = false;
                if state.single_partition && *partition <= 1 && *block == 0 {
                    state.position = Some(0);
                }
            }
            TapeOperation::MoveBlockNext { .. } | TapeOperation::MoveBlockPrev { .. } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                state.position = None;
                state.at_end_of_data = false;
                state.no_filemark = false;
                state.at_filemark = false;
            }
            TapeOperation::MoveFileNext { .. } | TapeOperation::MoveFilePrev { .. } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                state.position = None;
                state.at_end_of_data = false;
                state.no_filemark = false;
                state.at_filemark = false;
                if matches!(op, TapeOperation::MoveFileNext { .. }) {
                    state.at_filemark = true;
                } else {
                    state.no_filemark = true;
                }
            }
            TapeOperation::MoveSmkNext { .. } | TapeOperation::MoveSmkPrev { .. } => {
                check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                state.position = None;
                state.at_end_of_data = false;
                state.no_filemark = false;
                state.at_filemark = false;
            }

            TapeOperation::ReadData { path } => {
                if !no_extra_checks {
                    if state.empty {
                        diags.push(Diagnostic::new(idx, Severity::Warning, "media is empty, nothing will be read"));
                    } else if state.at_end_of_data {
                        diags.push(Diagnostic::new(idx, Severity::Warning, "at EOD position, nothing will be read"));
                    }
                }
                check_dest_file(path, !no_overwrite_check, idx, &mut diags);
                state.dirty = false;
                state.position = None;
                state.no_filemark = false;
                state.at_filemark = false;
            }
            TapeOperation::WriteData { path } | TapeOperation::WriteDataAndFmk { path } => {
                let write_and_fmk = matches!(op, TapeOperation::WriteDataAndFmk { .. });
                let mut file_size_known = false;
                let mut file_size = 0u64;

                if !no_extra_checks {
                    if media.is_some_and(|m| m.write_protected) {
                        diags.push(Diagnostic::new(idx, Severity::Error, "media is write protected"));
                    }
                    if let Some(size) = check_src_file(path, idx, &mut diags) {
                        file_size_known = true;
                        file_size = size;
                        if write_and_fmk {
                            if let Some(drive) = drive {
                                file_size += drive.default_block_size as u64;
                            }
                        }
                        if let Some(capacity) = state.capacity {
                            let thres = cap_thres(capacity);
                            if file_size > thres {
                                diags.push(Diagnostic::new(
                                    idx,
                                    Severity::Warning,
                                    format!(
                                        "size of \"{}\" is{} exceeding the media capacity",
                                        path.display(),
                                        if file_size > capacity { "" } else { " nearly" }
                                    ),
                                ));
                            } else if let Some(position) = state.position {
                                if position + file_size > thres {
                                    diags.push(Diagnostic::new(
                                        idx,
                                        Severity::Warning,
                                        format!(
                                            "writing \"{}\" will{} cross the end of media",
                                            path.display(),
                                            if position + file_size > capacity { "" } else { " nearly" }
                                        ),
                                    ));
                                }
                            }
                        }
                    }
                    if state.no_filemark {
                        diags.push(Diagnostic::new(idx, Severity::Warning, format!("no filemark written before \"{}\"", path.display())));
                    }
                }

                if !no_overwrite_check && !state.at_end_of_data {
                    diags.push(Diagnostic::new(idx, Severity::Overwrite, format!("writing \"{}\" can destroy existing data on the media", path.display())));
                }

                if file_size_known {
                    if let Some(remaining) = state.remaining.filter(|_| state.at_end_of_data) {
                        state.remaining = Some(remaining.saturating_sub(file_size));
                    } else {
                        state.remaining = None;
                    }
                    if let Some(position) = state.position {
                        let mut new_pos = position + file_size;
                        if let Some(capacity) = state.capacity {
                            new_pos = new_pos.min(capacity);
                        }
                        state.position = Some(new_pos);
                    }
                } else {
                    state.position = None;
                    state.remaining = None;
                }
                state.empty = false;
                state.no_filemark = false;
                state.at_filemark = false;
                state.dirty = true;
                state.at_end_of_data = true;
                if write_and_fmk {
                    state.at_filemark = true;
                } else {
                    state.no_filemark = true;
                }
            }
            TapeOperation::WriteFilemark { count } | TapeOperation::WriteSetmark { count } => {
                let is_filemark = matches!(op, TapeOperation::WriteFilemark { .. });
                if !no_extra_checks {
                    if media.is_some_and(|m| m.write_protected) {
                        diags.push(Diagnostic::new(idx, Severity::Error, "media is write protected"));
                    }
                    check_required_feature(drive, op, idx, no_extra_checks, &mut diags);
                    if state.position == Some(0) {
                        diags.push(Diagnostic::new(
                            idx,
                            Severity::Warning,
                            format!("suspicious writing {} at beginning of the media", if is_filemark { "filemark" } else { "setmark" }),
                        ));
                    }
                    if is_filemark && (state.at_filemark || *count > 1) {
                        diags.push(Diagnostic::new(idx, Severity::Warning, "suspicious writing filemark after another filemark"));
                    }
                }
                if !no_overwrite_check && !state.empty && !state.at_end_of_data {
                    diags.push(Diagnostic::new(
                        idx,
                        Severity::Warning,
                        format!("writing {} may overwrite existing data on the media", if is_filemark { "filemark" } else { "setmark" }),
                    ));
                }
                if let (Some(position), Some(drive)) = (state.position, drive) {
                    state.position = Some(position + drive.default_block_size as u64 * *count as u64);
                }
                if state.at_end_of_data {
                    if let (Some(remaining), Some(drive)) = (state.remaining, drive) {
                        state.remaining = Some(remaining.saturating_sub(drive.default_block_size as u64 * *count as u64));
                    }
                } else {
                    state.remaining = None;
                }
                state.empty = false;
                state.at_filemark = false;
                state.no_filemark = false;
                state.dirty = true;
                state.at_end_of_data = true;
                if is_filemark {
                    state.at_filemark = true;
                }
            }
            TapeOperation::Truncate => {
                if !no_extra_checks {
                    if media.is_some_and(|m| m.write_protected) {
                        diags.push(Diagnostic::new(idx, Severity::Error, "media is write protected"));
                    }
                    if state.at_end_of_data {
                        diags.push(Diagnostic::new(idx, Severity::Warning, "suspicious truncation when already at the end of the data"));
                    }
                }
                if !no_overwrite_check && !state.at_end_of_data {
                    diags.push(Diagnostic::new(idx, Severity::Overwrite, "truncation will destroy existing data on the media"));
                }
                state.remaining = None;
                state.at_end_of_data = true;
            }
        }

        if media_required && !no_extra_checks {
            diags.push(Diagnostic::new(idx, Severity::Error, "operation requires media to be loaded into the drive"));
        }

        reconcile(&mut state);
    }

    let worst = diags.iter().map(|d| d.severity).max();
    // TEST_MODE is checked ahead of and independent from the usual
    // error/warning/overwrite chain: dry-run mode runs every check
    // above exactly as normal, then always refuses execution, even
    // when nothing else in the run would have blocked it.
    let decision = if options.contains(OptionFlags::TEST_MODE) {
        Decision::Refused
    } else if worst == Some(Severity::Error) {
        Decision::Reject
    } else if worst == Some(Severity::Warning) || (worst == Some(Severity::Overwrite) && options.contains(OptionFlags::CONFIRM_OVERWRITE)) {
        Decision::PromptWarning
    } else if options.contains(OptionFlags::SHOW_OPS) {
        Decision::PromptShow
    } else if worst == Some(Severity::Overwrite) {
        Decision::PromptCountdownOverwrite
    } else {
        Decision::Proceed
    };

    tracing::debug!(?decision, diagnostics = diags.len(), "simulation complete");

    SimReport {
        diagnostics: diags,
        decision,
        final_state: state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OptionFlags;
    use std::io::Write;

    fn permissive_drive() -> DriveParams {
        use crate::ops::{FeaturesHigh, FeaturesLow};
        DriveParams {
            features_low: FeaturesLow::all(),
            features_high: FeaturesHigh::all(),
            max_partition_count: 4,
            min_block_size: 1,
            max_block_size: 1 << 20,
            default_block_size: 512,
        }
    }

    fn media(capacity: u64, remaining: u64, position: u64) -> MediaParams {
        MediaParams {
            capacity: Some(capacity),
            remaining: Some(remaining),
            position: Some(position),
            write_protected: false,
            partition_count: 1,
        }
    }

    #[test]
    fn write_protected_media_rejects_filemark() {
        let media = MediaParams {
            write_protected: true,
            ..media(1000, 1000, 0)
        };
        let report = simulate(
            &[TapeOperation::WriteFilemark { count: 1 }],
            Some(&permissive_drive()),
            Some(&media),
            OptionFlags::empty(),
        );
        assert_eq!(report.decision, Decision::Reject);
    }

    #[test]
    fn near_end_of_tape_write_warns_and_prompts() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(10).unwrap();
        let report = simulate(
            &[TapeOperation::WriteData { path: tmp.path().to_path_buf() }],
            Some(&permissive_drive()),
            Some(&media(1000, 40, 960)),
            OptionFlags::NO_OVERWRITE_CHECK,
        );
        assert_eq!(report.decision, Decision::PromptWarning);
        assert!(report.diagnostics.iter().any(|d| d.severity == Severity::Warning));
    }

    #[test]
    fn test_mode_never_proceeds() {
        let report = simulate(
            &[TapeOperation::MoveToOrigin],
            Some(&permissive_drive()),
            Some(&media(1000, 1000, 0)),
            OptionFlags::TEST_MODE,
        );
        assert_eq!(report.decision, Decision::Refused);
    }

    #[test]
    fn test_mode_refuses_even_with_a_warning_that_would_otherwise_just_prompt() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(10).unwrap();
        let report = simulate(
            &[TapeOperation::WriteData { path: tmp.path().to_path_buf() }],
            Some(&permissive_drive()),
            Some(&media(1000, 40, 960)),
            OptionFlags::TEST_MODE | OptionFlags::NO_OVERWRITE_CHECK,
        );
        assert!(report.diagnostics.iter().any(|d| d.severity == Severity::Warning));
        assert_eq!(report.decision, Decision::Refused);
    }

    #[test]
    fn null_drive_guard_treats_missing_drive_as_multi_partition_capable() {
        // Documents the preserved bug: with no drive info at all, the
        // single-partition downgrade fires anyway, even though a
        // missing drive can't possibly have confirmed multi-partition
        // support (see the comment in `simulate`'s `MakePartition`
        // arm). `single_partition` starts `true` (single-partition
        // media) and should arguably stay that way with no drive to
        // consult, but the preserved `||` flips it to `false` anyway.
        let report = simulate(
            &[TapeOperation::MakePartition { method: PartitionMethod::Fixed, count: 2, size: 0 }],
            None,
            Some(&MediaParams { partition_count: 1, ..media(1000, 1000, 0) }),
            OptionFlags::FORCE | OptionFlags::NO_OVERWRITE_CHECK,
        );
        assert!(!report.final_state.single_partition);
    }

    #[test]
    fn reconciliation_derives_the_missing_third_quantity() {
        let report = simulate(
            &[TapeOperation::SetAbsPosition { block: 100 }],
            Some(&permissive_drive()),
            Some(&MediaParams { capacity: Some(1000), remaining: None, position: None, write_protected: false, partition_count: 1 }),
            OptionFlags::FORCE,
        );
        // SetAbsPosition to a non-zero block clears position entirely
        // (only block == 0 pins it down), so nothing is derivable yet.
        assert_eq!(report.final_state.position, None);
    }

    #[test]
    fn write_protect_refusal_has_no_prompt() {
        let media = MediaParams { write_protected: true, ..media(1000, 1000, 0) };
        let report = simulate(&[TapeOperation::WriteFilemark { count: 1 }], Some(&permissive_drive()), Some(&media), OptionFlags::empty());
        assert_eq!(report.decision, Decision::Reject);
        assert!(report.diagnostics.iter().any(|d| d.message.contains("write protected")));
    }

    #[test]
    fn unloaded_media_rejects_operations_that_need_it_loaded() {
        let report = simulate(&[TapeOperation::MoveToOrigin], Some(&permissive_drive()), None, OptionFlags::empty());
        assert_eq!(report.decision, Decision::Reject);
    }

    #[test]
    fn load_media_does_not_itself_require_media_loaded() {
        let report = simulate(&[TapeOperation::LoadMedia], Some(&permissive_drive()), None, OptionFlags::empty());
        assert_eq!(report.decision, Decision::Proceed);
        assert!(!report.final_state.unloaded);
    }

    #[test]
    fn read_data_warns_on_empty_media() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"x").unwrap();
        let report = simulate(
            &[TapeOperation::ReadData { path: tmp.path().to_path_buf() }],
            Some(&permissive_drive()),
            Some(&media(1000, 1000, 0)),
            OptionFlags::NO_OVERWRITE_CHECK,
        );
        assert!(report.diagnostics.iter().any(|d| d.message.contains("empty")));
    }

    #[test]
    fn simulator_is_deterministic_across_repeated_runs() {
        let ops = [TapeOperation::MoveToOrigin, TapeOperation::WriteFilemark { count: 1 }];
        let drive = permissive_drive();
        let m = media(1000, 1000, 0);
        let first = simulate(&ops, Some(&drive), Some(&m), OptionFlags::empty());
        let second = simulate(&ops, Some(&drive), Some(&m), OptionFlags::empty());
        assert_eq!(first, second);
    }
}
