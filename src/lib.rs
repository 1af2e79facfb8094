//! Sustained-throughput tape I/O engine: a ring buffer, a background
//! CRC stage, sync/async I/O stages, a copy orchestrator, a rate
//! counter, and an operation simulator, wired for callers that own
//! the actual tape device handle and front-end (CLI, config loading,
//! message filtering) themselves.

#[cfg(feature = "io")]
pub mod adapter;
pub mod checksum;
pub mod config;
#[cfg(feature = "io")]
pub mod copy;
pub mod device;
pub mod error;
#[cfg(feature = "io")]
pub mod io;
pub mod ops;
pub mod rate;
pub mod ring;
pub mod sim;

#[cfg(feature = "io")]
pub use adapter::{execute, OpOutcome, OpResult};
pub use checksum::{ChecksumStage, Priority};
pub use config::EngineConfig;
#[cfg(feature = "io")]
pub use copy::{copy as copy_stream, new_abort_pair, AbortHandle, CopyReport, CopyRequest, ProgressMode, ProgressSample, Rate};
pub use device::{DriveParams, MediaParams, RecordingDevice, TapeDevice};
pub use error::{Result, StreamEndKind, TapeIoError};
#[cfg(feature = "io")]
pub use io::{IoMode, StageControl};
pub use ops::{FeaturesHigh, FeaturesLow, OptionFlags, PartitionMethod, TapeOperation};
pub use rate::RateCounter;
pub use ring::{new_auto as new_ring, PagedRing, RingBuffer, VirtualRing};
pub use sim::{simulate, Decision, Diagnostic, Severity, SimReport, SimState};
