use bitflags::bitflags;

bitflags! {
    /// Transient state bits shared by both directions of an I/O stage.
    ///
    /// `DRIVER_CONGESTION` is set when the platform's block layer has
    /// rejected a request for lack of pinnable memory rather than a
    /// real I/O failure; on the kernels this crate targets that
    /// condition is vanishingly rare compared to the Windows driver
    /// stack the flag was named after, but the retry-with-backoff
    /// behavior it gates is kept for parity.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        const BUFFERING         = 0b0000_0001;
        const FLUSHING          = 0b0000_0010;
        const END_OF_DATA       = 0b0000_0100;
        const DEBUFFERING       = 0b0000_1000;
        const END_OF_FILE       = 0b0001_0000;
        const DRIVER_CONGESTION = 0b0010_0000;
    }
}
