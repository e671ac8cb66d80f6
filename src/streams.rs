//! Stream dispatch glue
//!
//! Binds per-handle operation vectors to the per-process file-id table.
//! A file id (`Fid`) indexes the owning process's fixed-width FIDT, whose
//! entries point into the kernel-wide open-file table of `Fcb`s. Each `Fcb`
//! carries a reference count and a [`StreamOps`] vector; the stream object
//! itself lives behind the vector (a pipe end, a socket, an info cursor).
//!
//! Reference counting: an FCB starts owned by the fid that reserved it
//! (refcount 1). Inheriting a FIDT on exec, `dup2`, and in-flight I/O all
//! take extra references. When the count reaches zero the stream's close
//! operation runs and the FCB slot is released.

use std::sync::Arc;

use slab::Slab;

use crate::error::{KernelError, KernelResult};
use crate::proc::Pid;
use crate::sched::{self, KGuard};
use crate::MAX_FILEID;

/// File id: an index into the owning process's file-id table.
pub type Fid = usize;

/// Key of an `Fcb` in the kernel-wide open-file table.
pub(crate) type FcbId = usize;

/// Per-stream operation vector.
///
/// Defaulted methods mean "unsupported on this half": a pipe's read end has
/// no write operation, an info stream has neither write nor a close worth
/// noting. Implementations receive the kernel guard and may suspend.
pub(crate) trait StreamOps: Send + Sync {
    /// Returns self as `Any` so syscalls that need a concrete stream type
    /// (the socket layer) can downcast.
    fn as_any(&self) -> &dyn std::any::Any;

    fn read(&self, k: &mut KGuard<'_>, buf: &mut [u8]) -> KernelResult<usize> {
        let _ = (k, buf);
        Err(KernelError::NotSupported)
    }

    fn write(&self, k: &mut KGuard<'_>, buf: &[u8]) -> KernelResult<usize> {
        let _ = (k, buf);
        Err(KernelError::NotSupported)
    }

    /// Called exactly once, when the last reference to the FCB is dropped.
    fn close(&self, k: &mut KGuard<'_>) -> KernelResult<()> {
        let _ = k;
        Ok(())
    }
}

/// File control block: one open stream handle.
pub(crate) struct Fcb {
    pub refcount: usize,
    pub ops: Arc<dyn StreamOps>,
}

/// Kernel-wide table of open streams.
pub(crate) struct FileTable {
    fcbs: Slab<Fcb>,
}

impl FileTable {
    pub fn new() -> Self {
        Self { fcbs: Slab::new() }
    }

    pub fn get(&self, id: FcbId) -> Option<&Fcb> {
        self.fcbs.get(id)
    }

    /// Number of live FCBs. Used by leak assertions in tests.
    pub fn len(&self) -> usize {
        self.fcbs.len()
    }
}

/// Atomically allocate one fid/FCB pair per supplied stream vector, or
/// nothing at all. Fids are the lowest free FIDT slots, in order.
pub(crate) fn reserve(
    k: &mut KGuard<'_>,
    pid: Pid,
    streams: Vec<Arc<dyn StreamOps>>,
) -> KernelResult<Vec<Fid>> {
    let want = streams.len();
    let free: Vec<Fid> = (0..MAX_FILEID)
        .filter(|&fid| k.procs.pcb(pid).fidt[fid].is_none())
        .take(want)
        .collect();
    if free.len() < want {
        return Err(KernelError::Exhausted);
    }

    let mut fids = Vec::with_capacity(want);
    for (fid, ops) in free.into_iter().zip(streams) {
        let id = k.files.fcbs.insert(Fcb { refcount: 1, ops });
        k.procs.pcb_mut(pid).fidt[fid] = Some(id);
        fids.push(fid);
    }
    Ok(fids)
}

/// Resolve a fid of the given process to its FCB key.
pub(crate) fn lookup(k: &KGuard<'_>, pid: Pid, fid: Fid) -> KernelResult<FcbId> {
    if fid >= MAX_FILEID {
        return Err(KernelError::BadFid);
    }
    k.procs.pcb(pid).fidt[fid].ok_or(KernelError::BadFid)
}

/// Take an extra reference on an FCB.
pub(crate) fn incref(k: &mut KGuard<'_>, id: FcbId) {
    k.files.fcbs[id].refcount += 1;
}

/// Drop a reference on an FCB, closing the stream when the count hits zero.
pub(crate) fn decref(k: &mut KGuard<'_>, id: FcbId) -> KernelResult<()> {
    let fcb = &mut k.files.fcbs[id];
    fcb.refcount -= 1;
    if fcb.refcount > 0 {
        return Ok(());
    }
    let fcb = k.files.fcbs.remove(id);
    fcb.ops.close(k)
}

// =============================================================================
// Stream syscalls
// =============================================================================

/// Read up to `buf.len()` bytes from an open stream.
///
/// Returns the number of bytes delivered; 0 means end of data. May suspend.
pub fn read(fid: Fid, buf: &mut [u8]) -> KernelResult<usize> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let id = lookup(&k, cx.pid, fid)?;
    let ops = Arc::clone(&k.files.fcbs[id].ops);
    // Pin the FCB so a concurrent close cannot free the stream mid-read.
    incref(&mut k, id);
    let result = ops.read(&mut k, buf);
    let _ = decref(&mut k, id);
    result
}

/// Write up to `buf.len()` bytes to an open stream.
///
/// Returns the number of bytes accepted, which is less than `buf.len()`
/// only if the far side closed mid-write. May suspend.
pub fn write(fid: Fid, buf: &[u8]) -> KernelResult<usize> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let id = lookup(&k, cx.pid, fid)?;
    let ops = Arc::clone(&k.files.fcbs[id].ops);
    incref(&mut k, id);
    let result = ops.write(&mut k, buf);
    let _ = decref(&mut k, id);
    result
}

/// Close a fid. The underlying stream is closed when the last fid
/// referencing it goes away.
pub fn close(fid: Fid) -> KernelResult<()> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    if fid >= MAX_FILEID {
        return Err(KernelError::BadFid);
    }
    let id = k.procs.pcb(cx.pid).fidt[fid].ok_or(KernelError::BadFid)?;
    k.procs.pcb_mut(cx.pid).fidt[fid] = None;
    decref(&mut k, id)
}

/// Make `new` refer to the same stream as `old`, closing whatever `new`
/// referred to before. A no-op when `old == new`.
pub fn dup2(old: Fid, new: Fid) -> KernelResult<()> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    if new >= MAX_FILEID {
        return Err(KernelError::BadFid);
    }
    let id = lookup(&k, cx.pid, old)?;
    if old == new {
        return Ok(());
    }
    incref(&mut k, id);
    let displaced = k.procs.pcb_mut(cx.pid).fidt[new].replace(id);
    if let Some(other) = displaced {
        let _ = decref(&mut k, other);
    }
    Ok(())
}
