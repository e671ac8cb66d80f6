//! Process-info stream
//!
//! A read-only snapshot cursor over the process table, exposed through the
//! stream layer. Every read delivers one fixed-layout record for the next
//! non-free table slot and advances the cursor; a read past the end of the
//! table returns 0.
//!
//! Records use a stable little-endian layout so callers can parse them
//! from the raw stream bytes; [`ProcInfo::decode`] is the inverse.

use std::cmp::min;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::proc::{PState, Pid};
use crate::sched::{self, KGuard};
use crate::streams::{self, Fid, StreamOps};
use crate::{MAX_PROC, PROCINFO_MAX_ARGS_SIZE};

/// One process-table snapshot record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    /// true for `ALIVE`, false for `ZOMBIE`
    pub alive: bool,
    pub thread_count: usize,
    /// Whether the process was exec'd with a task
    pub main_task: bool,
    /// Full argument length, which may exceed the bytes carried below
    pub argl: usize,
    /// Up to [`PROCINFO_MAX_ARGS_SIZE`] bytes of the argument block
    pub args: Vec<u8>,
}

impl ProcInfo {
    /// Encoded record size in bytes.
    ///
    /// Layout: pid u32 | ppid u32 (`u32::MAX` = none) | alive u8 |
    /// main_task u8 | thread_count u32 | argl u32 | args bytes.
    pub const SIZE: usize = 18 + PROCINFO_MAX_ARGS_SIZE;

    fn encode(&self, buf: &mut [u8]) {
        let ppid = self.ppid.map(|p| p as u32).unwrap_or(u32::MAX);
        buf[0..4].copy_from_slice(&(self.pid as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&ppid.to_le_bytes());
        buf[8] = self.alive as u8;
        buf[9] = self.main_task as u8;
        buf[10..14].copy_from_slice(&(self.thread_count as u32).to_le_bytes());
        buf[14..18].copy_from_slice(&(self.argl as u32).to_le_bytes());
        let args = &mut buf[18..Self::SIZE];
        args.fill(0);
        args[..self.args.len()].copy_from_slice(&self.args);
    }

    /// Parse a record previously produced by a process-info read.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let word = |at: usize| {
            u32::from_le_bytes(buf[at..at + 4].try_into().expect("4-byte slice")) as usize
        };
        let ppid = u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice"));
        let argl = word(14);
        let carried = min(argl, PROCINFO_MAX_ARGS_SIZE);
        Some(Self {
            pid: word(0),
            ppid: (ppid != u32::MAX).then_some(ppid as usize),
            alive: buf[8] != 0,
            main_task: buf[9] != 0,
            thread_count: word(10),
            argl,
            args: buf[18..18 + carried].to_vec(),
        })
    }
}

/// Stream state: just the table cursor. Mutated only under the kernel
/// lock, so relaxed atomics suffice for the interior mutability.
struct ProcInfoStream {
    cursor: AtomicUsize,
}

impl StreamOps for ProcInfoStream {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn read(&self, k: &mut KGuard<'_>, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.len() < ProcInfo::SIZE {
            return Err(KernelError::InvalidArgument);
        }

        let mut cursor = self.cursor.load(Ordering::Relaxed);
        while cursor < MAX_PROC && k.procs.pcb(cursor).state == PState::Free {
            cursor += 1;
        }
        if cursor >= MAX_PROC {
            self.cursor.store(cursor, Ordering::Relaxed);
            return Ok(0);
        }

        let pcb = k.procs.pcb(cursor);
        let carried = min(pcb.args.len(), PROCINFO_MAX_ARGS_SIZE);
        let info = ProcInfo {
            pid: cursor,
            ppid: pcb.parent,
            alive: pcb.state == PState::Alive,
            thread_count: pcb.thread_count,
            main_task: pcb.main_task.is_some(),
            argl: pcb.argl,
            args: pcb.args[..carried].to_vec(),
        };
        info.encode(buf);

        self.cursor.store(cursor + 1, Ordering::Relaxed);
        Ok(ProcInfo::SIZE)
    }
}

/// Open a process-info stream. Returns its file id.
pub fn open_info() -> KernelResult<Fid> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let stream: Arc<dyn StreamOps> = Arc::new(ProcInfoStream {
        cursor: AtomicUsize::new(0),
    });
    let fids = streams::reserve(&mut k, cx.pid, vec![stream])?;
    Ok(fids[0])
}
