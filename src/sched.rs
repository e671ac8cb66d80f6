//! Scheduler interface: the single kernel lock and its condition variables
//!
//! The kernel core is serialized by one mutex per kernel instance. Every
//! syscall body acquires it on entry, and every suspension point is a
//! condition-variable wait against that same mutex, which releases and
//! re-acquires it atomically. Kernel threads are backed by host OS threads;
//! outside the kernel lock they run preemptively, inside it the core is
//! effectively single-threaded with cooperative yield points.
//!
//! ## Wait discipline
//!
//! - A waiter re-checks its condition in a loop after every wakeup; a
//!   wakeup is a hint, not a proof.
//! - `broadcast` wakes every waiter, `signal` wakes one. Which waiters a
//!   close path must wake is part of each subsystem's contract.
//! - `timedwait` is used only by the socket connect path.
//!
//! ## Thread lifecycle
//!
//! `spawn_thread` registers a thread control block; `wakeup` starts the
//! backing host thread. Because the creator holds the kernel lock across
//! both, the new thread cannot observe a half-initialized record. A thread
//! leaves the kernel for good by unwinding to its spawn trampoline (see
//! `exit_thread`); the host join handles are drained by `boot`.

use std::cell::RefCell;
use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::trace;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::pipe::PipeTable;
use crate::proc::{Pid, ProcTable};
use crate::socket::SocketTable;
use crate::streams::FileTable;
use crate::thread::{ThreadTable, Tid};

/// Why a thread is suspending. Surfaced in trace logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedCause {
    /// Blocked on pipe buffer space or data
    Pipe,
    /// Blocked on socket connection rendezvous
    Io,
    /// Blocked on thread or child exit
    User,
}

/// A condition variable tied to the kernel lock.
///
/// Cheap to clone; clones wake the same waiters. A fresh `CondVar` has no
/// waiters and no memory of past signals.
#[derive(Clone)]
pub(crate) struct CondVar(Arc<Condvar>);

impl CondVar {
    pub fn new() -> Self {
        Self(Arc::new(Condvar::new()))
    }
}

/// Everything the kernel lock protects: all tables of all subsystems.
pub(crate) struct KernelState {
    pub procs: ProcTable,
    pub threads: ThreadTable,
    pub files: FileTable,
    pub pipes: PipeTable,
    pub sockets: SocketTable,
}

impl KernelState {
    fn new() -> Self {
        Self {
            procs: ProcTable::new(),
            threads: ThreadTable::new(),
            files: FileTable::new(),
            pipes: PipeTable::new(),
            sockets: SocketTable::new(),
        }
    }
}

/// Guard type for the kernel lock. Holding one means being "inside" the
/// kernel; passing `&mut KGuard` down a call chain keeps that explicit.
pub(crate) type KGuard<'a> = MutexGuard<'a, KernelState>;

/// One kernel instance. Instances are independent; every `boot` creates a
/// fresh one, so concurrently booted kernels share nothing.
pub(crate) struct Kernel {
    /// The single kernel lock
    pub state: Mutex<KernelState>,
    /// Host join handles of every spawned kernel thread
    pub handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(KernelState::new()),
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// Suspend the current thread until the condition variable is signalled.
///
/// Releases the kernel lock while asleep and re-acquires it before
/// returning. Callers must re-check their condition afterwards.
pub(crate) fn wait(k: &mut KGuard<'_>, cv: &CondVar, cause: SchedCause) {
    trace!("suspending ({:?})", cause);
    cv.0.wait(k);
}

/// Like [`wait`], but gives up after `timeout`. Returns true if the wait
/// timed out rather than being signalled.
pub(crate) fn timedwait(
    k: &mut KGuard<'_>,
    cv: &CondVar,
    cause: SchedCause,
    timeout: Duration,
) -> bool {
    trace!("suspending ({:?}) for up to {:?}", cause, timeout);
    cv.0.wait_for(k, timeout).timed_out()
}

/// Wake every thread waiting on the condition variable.
pub(crate) fn broadcast(cv: &CondVar) {
    cv.0.notify_all();
}

/// Wake one thread waiting on the condition variable.
pub(crate) fn signal(cv: &CondVar) {
    cv.0.notify_one();
}

// =============================================================================
// Current-thread context
// =============================================================================

/// Identity of the current kernel thread, carried in a thread-local.
///
/// Installed by the spawn trampoline for task threads and by `boot` for the
/// idle (pid 0) context.
#[derive(Clone)]
pub(crate) struct Context {
    pub kernel: Arc<Kernel>,
    pub pid: Pid,
    /// None only for the boot/idle context, which runs no task
    pub tid: Option<Tid>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Get the current kernel-thread context.
///
/// # Panics
///
/// Panics when called from a thread that is not a kernel thread (i.e.
/// outside `boot` and outside any task).
pub(crate) fn context() -> Context {
    CONTEXT
        .with(|c| c.borrow().clone())
        .expect("syscall issued outside a kernel thread")
}

pub(crate) fn install_context(cx: Context) {
    CONTEXT.with(|c| {
        let mut slot = c.borrow_mut();
        assert!(slot.is_none(), "kernel context already installed");
        *slot = Some(cx);
    });
}

pub(crate) fn clear_context() {
    CONTEXT.with(|c| *c.borrow_mut() = None);
}

// =============================================================================
// Thread spawn and exit
// =============================================================================

/// Low-level thread control block: the pairing of a PTCB with the host
/// thread that will run it. Exists between `spawn_thread` and `wakeup`.
pub(crate) struct Tcb {
    kernel: Arc<Kernel>,
    pid: Pid,
    tid: Tid,
}

/// Prepare a host thread for the given PTCB without starting it.
pub(crate) fn spawn_thread(kernel: &Arc<Kernel>, pid: Pid, tid: Tid) -> Tcb {
    Tcb {
        kernel: Arc::clone(kernel),
        pid,
        tid,
    }
}

/// Start the host thread behind a [`Tcb`].
///
/// The new thread installs its context and enters the task trampoline. Its
/// first kernel-lock acquisition cannot precede the creator's release, so
/// the creator may finish initialization after calling this while still
/// holding the lock.
pub(crate) fn wakeup(tcb: Tcb) {
    let kernel = Arc::clone(&tcb.kernel);
    let name = format!("kthread-{}:{:?}", tcb.pid, tcb.tid);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            install_context(Context {
                kernel: Arc::clone(&tcb.kernel),
                pid: tcb.pid,
                tid: Some(tcb.tid),
            });
            crate::thread::thread_entry(tcb.pid, tcb.tid);
        })
        .expect("failed to spawn kernel thread");
    kernel.handles.lock().push(handle);
}

/// Unwind payload carrying a thread's exit value from `thread_exit` /
/// `exit` back to the spawn trampoline.
pub(crate) struct ExitUnwind(pub i32);

/// Leave the current thread immediately with the given exit value.
///
/// Unwinds to the spawn trampoline, which performs the actual exit
/// bookkeeping. Must only be called from a task thread, with no kernel
/// lock held.
pub(crate) fn exit_thread(exitval: i32) -> ! {
    panic::resume_unwind(Box::new(ExitUnwind(exitval)))
}
