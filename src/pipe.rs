//! Pipes
//!
//! A pipe is a bounded cyclic byte buffer with one reader side and one
//! writer side, each backed by its own file id. Read and write block at
//! the buffer boundaries and are unblocked by progress on the other side
//! or by the other side closing.
//!
//! ## Half-close
//!
//! The two sides carry independent liveness bits. Closing a side clears
//! its bit and wakes everything blocked on the opposite side; the buffer
//! storage is released when the second side closes. A side being closed
//! while its own operation is in flight is impossible: the stream layer
//! pins the FCB for the duration of the call.
//!
//! ## Ordering
//!
//! All pipe operations run under the kernel lock and suspensions release
//! and re-acquire it atomically, so bytes are delivered in write order
//! even across multiple blocking segments. A write is not atomic across
//! suspensions: readers may observe any prefix.

use std::sync::Arc;

use log::trace;
use slab::Slab;

use crate::error::{KernelError, KernelResult};
use crate::sched::{self, CondVar, KGuard, SchedCause};
use crate::streams::{self, Fid, StreamOps};
use crate::PIPE_BUFFER_SIZE;

/// Key of a pipe in the pipe table.
pub(crate) type PipeId = usize;

/// Pipe control block.
pub(crate) struct PipeCb {
    /// Bounded cyclic byte buffer
    buffer: Box<[u8; PIPE_BUFFER_SIZE]>,
    /// Read position in buffer
    r_pos: usize,
    /// Write position in buffer
    w_pos: usize,
    /// Number of bytes held
    count: usize,
    /// Reader-side liveness
    reader_open: bool,
    /// Writer-side liveness
    writer_open: bool,
    /// Writers block here while the buffer is full
    has_space: CondVar,
    /// Readers block here while the buffer is empty
    has_data: CondVar,
}

impl PipeCb {
    fn new() -> Self {
        Self {
            buffer: Box::new([0; PIPE_BUFFER_SIZE]),
            r_pos: 0,
            w_pos: 0,
            count: 0,
            reader_open: true,
            writer_open: true,
            has_space: CondVar::new(),
            has_data: CondVar::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.count == PIPE_BUFFER_SIZE
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push(&mut self, byte: u8) {
        self.buffer[self.w_pos] = byte;
        self.w_pos = (self.w_pos + 1) % PIPE_BUFFER_SIZE;
        self.count += 1;
    }

    fn pop(&mut self) -> u8 {
        let byte = self.buffer[self.r_pos];
        self.r_pos = (self.r_pos + 1) % PIPE_BUFFER_SIZE;
        self.count -= 1;
        byte
    }

    /// Cursor/count consistency, asserted at quiescent points.
    fn check(&self) {
        debug_assert!(self.count <= PIPE_BUFFER_SIZE);
        debug_assert_eq!(self.w_pos, (self.r_pos + self.count) % PIPE_BUFFER_SIZE);
    }
}

/// Kernel-wide table of live pipes.
pub(crate) struct PipeTable {
    pipes: Slab<PipeCb>,
}

impl PipeTable {
    pub fn new() -> Self {
        Self { pipes: Slab::new() }
    }

    fn get(&self, id: PipeId) -> &PipeCb {
        &self.pipes[id]
    }

    fn get_mut(&mut self, id: PipeId) -> &mut PipeCb {
        &mut self.pipes[id]
    }

    /// Number of live pipes. Used by leak assertions in tests.
    pub fn len(&self) -> usize {
        self.pipes.len()
    }
}

/// Allocate a fresh pipe with both sides open.
pub(crate) fn pipe_alloc(k: &mut KGuard<'_>) -> PipeId {
    k.pipes.pipes.insert(PipeCb::new())
}

/// Write up to `buf.len()` bytes into the pipe.
///
/// Blocks while the buffer is full and the reader side is open, first
/// waking any reader waiting for the first byte. Returns the full count on
/// success, or the bytes copied so far (possibly zero) if the reader
/// closed mid-write. Fails if the reader side was already closed at entry.
pub(crate) fn pipe_write(k: &mut KGuard<'_>, id: PipeId, buf: &[u8]) -> KernelResult<usize> {
    {
        let pipe = k.pipes.get(id);
        if !pipe.writer_open {
            return Err(KernelError::WrongState);
        }
        if !pipe.reader_open {
            return Err(KernelError::PeerClosed);
        }
    }

    let mut written = 0;
    while written < buf.len() {
        // Block while the buffer is full and the reader is still there.
        loop {
            let pipe = k.pipes.get(id);
            if !pipe.reader_open || !pipe.is_full() {
                break;
            }
            let has_space = pipe.has_space.clone();
            let has_data = pipe.has_data.clone();
            // A reader may be waiting for the first byte of this write.
            sched::broadcast(&has_data);
            sched::wait(k, &has_space, SchedCause::Pipe);
        }

        let pipe = k.pipes.get_mut(id);
        if !pipe.reader_open {
            // Reader vanished mid-write: report what was delivered.
            trace!("pipe {}: reader closed after {} bytes", id, written);
            return Ok(written);
        }
        pipe.push(buf[written]);
        written += 1;
    }

    let pipe = k.pipes.get(id);
    pipe.check();
    let has_data = pipe.has_data.clone();
    sched::broadcast(&has_data);
    Ok(written)
}

/// Read up to `buf.len()` bytes from the pipe.
///
/// Blocks only while nothing at all is available and the writer side is
/// open. Returns as soon as the buffer drains after at least one byte has
/// been delivered, or with 0 ("end of data") once the writer has closed
/// and the buffer is empty.
pub(crate) fn pipe_read(k: &mut KGuard<'_>, id: PipeId, buf: &mut [u8]) -> KernelResult<usize> {
    {
        let pipe = k.pipes.get(id);
        if !pipe.reader_open {
            return Err(KernelError::WrongState);
        }
        if !pipe.writer_open && pipe.is_empty() {
            return Ok(0);
        }
    }

    let mut read = 0;
    while read < buf.len() {
        loop {
            let pipe = k.pipes.get(id);
            if !pipe.is_empty() {
                break;
            }
            if !pipe.writer_open || read > 0 {
                // Drained: deliver what we have (0 here means the writer
                // closed while we were blocked on the first byte).
                let has_space = pipe.has_space.clone();
                sched::broadcast(&has_space);
                return Ok(read);
            }
            let has_space = pipe.has_space.clone();
            let has_data = pipe.has_data.clone();
            // A writer may be blocked on a full buffer.
            sched::broadcast(&has_space);
            sched::wait(k, &has_data, SchedCause::Pipe);
        }

        buf[read] = k.pipes.get_mut(id).pop();
        read += 1;
    }

    let pipe = k.pipes.get(id);
    pipe.check();
    let has_space = pipe.has_space.clone();
    sched::broadcast(&has_space);
    Ok(read)
}

/// Close the reader side, waking blocked writers.
pub(crate) fn pipe_reader_close(k: &mut KGuard<'_>, id: PipeId) -> KernelResult<()> {
    let pipe = match k.pipes.pipes.get_mut(id) {
        Some(p) => p,
        None => return Err(KernelError::WrongState),
    };
    if !pipe.reader_open {
        return Err(KernelError::WrongState);
    }
    pipe.reader_open = false;
    let has_space = pipe.has_space.clone();
    sched::broadcast(&has_space);
    maybe_destroy(k, id);
    Ok(())
}

/// Close the writer side, waking blocked readers.
pub(crate) fn pipe_writer_close(k: &mut KGuard<'_>, id: PipeId) -> KernelResult<()> {
    let pipe = match k.pipes.pipes.get_mut(id) {
        Some(p) => p,
        None => return Err(KernelError::WrongState),
    };
    if !pipe.writer_open {
        return Err(KernelError::WrongState);
    }
    pipe.writer_open = false;
    let has_data = pipe.has_data.clone();
    sched::broadcast(&has_data);
    maybe_destroy(k, id);
    Ok(())
}

/// Release the buffer once both sides are closed.
///
/// A blocked reader or writer implies its own side is still open, so no
/// thread can be suspended on a pipe this removes.
fn maybe_destroy(k: &mut KGuard<'_>, id: PipeId) {
    let pipe = k.pipes.get(id);
    if !pipe.reader_open && !pipe.writer_open {
        k.pipes.pipes.remove(id);
        trace!("pipe {}: destroyed", id);
    }
}

// =============================================================================
// Stream ops and the pipe syscall
// =============================================================================

/// Reader-side operation vector. Only read and close are supported.
struct PipeReader(PipeId);

impl StreamOps for PipeReader {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn read(&self, k: &mut KGuard<'_>, buf: &mut [u8]) -> KernelResult<usize> {
        pipe_read(k, self.0, buf)
    }

    fn close(&self, k: &mut KGuard<'_>) -> KernelResult<()> {
        pipe_reader_close(k, self.0)
    }
}

/// Writer-side operation vector. Only write and close are supported.
struct PipeWriter(PipeId);

impl StreamOps for PipeWriter {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn write(&self, k: &mut KGuard<'_>, buf: &[u8]) -> KernelResult<usize> {
        pipe_write(k, self.0, buf)
    }

    fn close(&self, k: &mut KGuard<'_>) -> KernelResult<()> {
        pipe_writer_close(k, self.0)
    }
}

/// Construct a pipe. Returns the `(read, write)` file id pair.
pub fn pipe() -> KernelResult<(Fid, Fid)> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();

    let id = pipe_alloc(&mut k);
    let streams: Vec<Arc<dyn StreamOps>> = vec![Arc::new(PipeReader(id)), Arc::new(PipeWriter(id))];
    match streams::reserve(&mut k, cx.pid, streams) {
        Ok(fids) => Ok((fids[0], fids[1])),
        Err(e) => {
            k.pipes.pipes.remove(id);
            Err(e)
        }
    }
}
