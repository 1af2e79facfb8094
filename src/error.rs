use thiserror::Error;

/// End-of-stream marker surfaced by the tape side of a copy.
///
/// These are informational outcomes, not failures: a read that hits
/// one halts the copy cleanly rather than aborting it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndKind {
    #[error("filemark reached")]
    Filemark,
    #[error("setmark reached")]
    Setmark,
    #[error("end of data reached")]
    Eod,
    #[error("end of tape reached")]
    Eot,
}

#[derive(Error, Debug)]
pub enum TapeIoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("read/write CRC mismatch \u{2014} data invalid")]
    CrcMismatch,

    #[error("operation aborted")]
    Aborted,

    #[error("{0}")]
    StreamEnd(StreamEndKind),

    #[error("mapping window remap failed: {0}")]
    RemapFailed(std::io::Error),

    #[error("tape device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, TapeIoError>;
