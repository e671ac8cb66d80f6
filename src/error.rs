//! Unified kernel error type
//!
//! Every syscall either succeeds with a non-negative value or fails with one
//! of the error kinds below. There is no errno table and no error payload;
//! the variant itself is the whole diagnosis, reported locally to the caller.

/// Kernel error type
///
/// One variant per failure kind the syscall surface can report. Short reads
/// and writes and end-of-data are successes, not errors, and never appear
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// Invalid or closed file id
    BadFid = 1,
    /// No such process, no children to wait for, or the pid is not a child
    /// of the caller
    NoProcess = 2,
    /// Invalid or stale thread id, or the thread belongs to another process
    NoThread = 3,
    /// Operation not valid in the object's current state (e.g. listen on a
    /// non-unbound socket, read through a shut-down direction)
    WrongState = 4,
    /// A caller precondition was violated (join self, join a detached
    /// thread, detach after exit)
    Precondition = 5,
    /// A fixed-size kernel table (processes, file ids, ports) is exhausted
    Exhausted = 6,
    /// Operation not supported by this stream half
    NotSupported = 7,
    /// The other side of the stream has been closed
    PeerClosed = 8,
    /// The port already has a listener
    PortBusy = 9,
    /// The connection request timed out
    TimedOut = 10,
    /// Malformed argument (port out of range, undersized record buffer)
    InvalidArgument = 11,
}

impl KernelError {
    /// Get the stable numeric code for this error
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;
