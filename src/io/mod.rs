pub mod aligned_buf;
mod flags;
mod platform;
mod queue;
mod stage;

pub use flags::IoFlags;
pub use platform::{configure_direct_io, direct_open_flags};
pub use queue::{IoQueue, IoQueueEntry};
pub use stage::{IoMode, ReadStage, StageControl, WriteStage};
