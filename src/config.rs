//! Numeric defaults and bounds for the I/O engine.
//!
//! This crate never reads `.cfg` files or argv itself — that stays a
//! sibling concern — but `EngineConfig` is the `serde`-deserializable
//! surface a config-loading binary hands parsed values to.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TapeIoError};

pub const DEFAULT_BUFFER_SIZE: u64 = 128 << 20;
pub const MIN_BUFFER_SIZE: u64 = 4 << 20;
pub const MAX_HEAP_BUFFER_SIZE: u64 = 512 << 20;
pub const MIN_BUFFER_BLOCKS: u64 = 4;
pub const PAGE_MAPPING_WINDOW_SIZE: usize = 64 << 20;

pub const DEFAULT_IO_BLOCK_SIZE: usize = 1 << 20;
pub const MIN_IO_BLOCK_SIZE: usize = 512;
pub const MAX_IO_BLOCK_SIZE: usize = 256 << 20;

pub const DEFAULT_IO_QUEUE_SIZE: usize = 16;
pub const MAX_IO_QUEUE_SIZE: usize = 1024;

pub const CRC_BLOCK_SIZE: usize = 64 << 10;
pub const MIN_CRC_BUFFER: usize = 1 << 20;

pub const STATS_REFRESH_INTERVAL_MS: u64 = 250;
pub const RATE_COUNT_POINTS: usize = 8;
pub const IO_THREAD_ABORT_TIMEOUT_MS: u64 = 5_000;

/// `capacity - capacity/28`: the "about 3.6% left" early-warning point
/// used before a write is deemed to run off the tape.
pub const fn cap_thres(full_capacity: u64) -> u64 {
    full_capacity - full_capacity / 28
}

fn max_crc_buffer(io_block_size: usize) -> usize {
    2 * io_block_size.max(MAX_IO_BLOCK_SIZE)
}

/// Tunable knobs for a single copy operation, with the defaults and
/// bounds spec.md §6 requires the core to reject at init.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_io_block_size")]
    pub io_block_size: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_crc_block_size")]
    pub crc_block_size: usize,
    #[serde(default = "default_crc_buffer_size")]
    pub crc_buffer_size: usize,
}

fn default_buffer_size() -> u64 {
    DEFAULT_BUFFER_SIZE
}
fn default_window_size() -> usize {
    PAGE_MAPPING_WINDOW_SIZE
}
fn default_io_block_size() -> usize {
    DEFAULT_IO_BLOCK_SIZE
}
fn default_queue_depth() -> usize {
    DEFAULT_IO_QUEUE_SIZE
}
fn default_crc_block_size() -> usize {
    CRC_BLOCK_SIZE
}
fn default_crc_buffer_size() -> usize {
    MIN_CRC_BUFFER
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            window_size: default_window_size(),
            io_block_size: default_io_block_size(),
            queue_depth: default_queue_depth(),
            crc_block_size: default_crc_block_size(),
            crc_buffer_size: default_crc_buffer_size(),
        }
    }
}

impl EngineConfig {
    /// Reject any knob outside the documented operating range.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(TapeIoError::Config("buffer_size below minimum"));
        }
        if self.buffer_size < MIN_BUFFER_BLOCKS * self.io_block_size as u64 {
            return Err(TapeIoError::Config(
                "buffer_size holds fewer than the minimum number of I/O blocks",
            ));
        }
        if self.io_block_size < MIN_IO_BLOCK_SIZE || self.io_block_size > MAX_IO_BLOCK_SIZE {
            return Err(TapeIoError::Config("io_block_size out of range"));
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_IO_QUEUE_SIZE {
            return Err(TapeIoError::Config("queue_depth out of range"));
        }
        if self.crc_buffer_size < MIN_CRC_BUFFER
            || self.crc_buffer_size > max_crc_buffer(self.io_block_size)
        {
            return Err(TapeIoError::Config("crc_buffer_size out of range"));
        }
        if self.crc_buffer_size < self.crc_block_size {
            return Err(TapeIoError::Config("crc_buffer_size smaller than crc_block_size"));
        }
        Ok(())
    }

    /// Whether this buffer size should use the paged (locked-page,
    /// sliding-window) backing instead of a plain virtual allocation.
    pub fn wants_paged_backing(&self) -> bool {
        self.buffer_size > MAX_HEAP_BUFFER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_undersized_buffer() {
        let mut cfg = EngineConfig::default();
        cfg.buffer_size = 1024;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_block_smaller_than_minimum() {
        let mut cfg = EngineConfig::default();
        cfg.io_block_size = 16;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_queue_depth_over_limit() {
        let mut cfg = EngineConfig::default();
        cfg.queue_depth = MAX_IO_QUEUE_SIZE + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cap_thres_leaves_one_part_in_twenty_eight() {
        assert_eq!(cap_thres(28), 27);
    }
}
