//! Thread management
//!
//! Every kernel thread is described by a PTCB holding its task, arguments,
//! joinable/detached state, exit value, and a reference count of current
//! joiners. The identifier handed to callers is an opaque [`Tid`]: a table
//! slot plus a generation counter, so a stale id (the slot was freed and
//! reused) fails validation instead of aliasing a new thread.
//!
//! ## PTCB lifetime
//!
//! A PTCB is freed once it is exited and no joiner holds a reference:
//! - by the last joiner to leave `thread_join`,
//! - at exit, when the thread is detached or is the last of its process,
//! - by the process teardown sweep for exited threads nobody joined.
//!
//! `detached` is monotonic; once set, joiners fail and the exit path owns
//! the record.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, trace};
use slab::Slab;

use crate::error::{KernelError, KernelResult};
use crate::proc::{self, Pid, INIT_PID};
use crate::sched::{self, CondVar, KGuard, Kernel, SchedCause};
use crate::Task;

/// Opaque thread id: a PTCB table slot plus its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tid {
    index: usize,
    gen: u32,
}

/// Process Thread Control Block.
pub(crate) struct Ptcb {
    /// Owning process
    pub pid: Pid,
    /// The thread's task
    pub task: Task,
    /// The thread's argument bytes
    pub args: Vec<u8>,
    /// Whether this is the process's main thread
    pub main: bool,
    /// Exit value, frozen once `exited` is set
    pub exitval: i32,
    pub exited: bool,
    pub detached: bool,
    /// Joiners wait here for exit or detach
    pub exit_cv: CondVar,
    /// Number of joiners currently inside `thread_join`
    pub refcount: usize,
}

/// Kernel-wide PTCB table with per-slot generation counters.
pub(crate) struct ThreadTable {
    slots: Slab<Ptcb>,
    generations: Vec<u32>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            generations: Vec::new(),
        }
    }

    fn insert(&mut self, ptcb: Ptcb) -> Tid {
        let index = self.slots.insert(ptcb);
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 0);
        }
        Tid {
            index,
            gen: self.generations[index],
        }
    }

    pub fn get(&self, tid: Tid) -> Option<&Ptcb> {
        if self.generations.get(tid.index).copied() != Some(tid.gen) {
            return None;
        }
        self.slots.get(tid.index)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Ptcb> {
        if self.generations.get(tid.index).copied() != Some(tid.gen) {
            return None;
        }
        self.slots.get_mut(tid.index)
    }

    fn remove(&mut self, tid: Tid) -> Option<Ptcb> {
        self.get(tid)?;
        self.generations[tid.index] += 1;
        Some(self.slots.remove(tid.index))
    }

    /// Number of live PTCBs. Used by leak assertions in tests.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Allocate a PTCB, link it into the owning process, and start its host
/// thread. The caller holds the kernel lock, so the new thread cannot run
/// before initialization completes.
pub(crate) fn spawn_task_thread(
    k: &mut KGuard<'_>,
    kernel: &Arc<Kernel>,
    pid: Pid,
    task: Task,
    args: Vec<u8>,
    main: bool,
) -> Tid {
    let tid = k.threads.insert(Ptcb {
        pid,
        task,
        args,
        main,
        exitval: 0,
        exited: false,
        detached: false,
        exit_cv: CondVar::new(),
        refcount: 0,
    });
    let pcb = k.procs.pcb_mut(pid);
    pcb.threads.push(tid);
    pcb.thread_count += 1;

    let tcb = sched::spawn_thread(kernel, pid, tid);
    sched::wakeup(tcb);
    trace!("spawned thread {:?} in process {}", tid, pid);
    tid
}

/// Unlink a PTCB from its process and release the slot.
pub(crate) fn free_ptcb(k: &mut KGuard<'_>, tid: Tid) {
    if let Some(ptcb) = k.threads.remove(tid) {
        k.procs.pcb_mut(ptcb.pid).threads.retain(|&t| t != tid);
        trace!("freed thread record {:?}", tid);
    }
}

// =============================================================================
// Thread syscalls
// =============================================================================

/// Create a new thread in the current process. Returns its id.
pub fn create_thread(task: Task, args: &[u8]) -> KernelResult<Tid> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    Ok(spawn_task_thread(
        &mut k,
        &cx.kernel,
        cx.pid,
        task,
        args.to_vec(),
        false,
    ))
}

/// Return the id of the current thread.
///
/// # Panics
///
/// Panics in the boot context, which runs no task.
pub fn thread_self() -> Tid {
    sched::context()
        .tid
        .expect("thread_self outside a task thread")
}

/// Wait for a thread of the current process to exit and return its exit
/// value.
///
/// Fails if the target is the caller, belongs to another process, is
/// detached, or was detached while we waited. Many joiners may wait on the
/// same thread; the last one out frees the record.
pub fn thread_join(tid: Tid) -> KernelResult<i32> {
    let cx = sched::context();
    let self_tid = cx.tid.expect("thread_join outside a task thread");
    if tid == self_tid {
        return Err(KernelError::Precondition);
    }

    let mut k = cx.kernel.state.lock();
    {
        let ptcb = k.threads.get(tid).ok_or(KernelError::NoThread)?;
        if ptcb.pid != cx.pid {
            return Err(KernelError::NoThread);
        }
        if ptcb.detached {
            return Err(KernelError::Precondition);
        }
    }

    // The target looks joinable; pin it for the duration of the wait.
    let exit_cv = {
        let ptcb = k.threads.get_mut(tid).expect("validated above");
        ptcb.refcount += 1;
        ptcb.exit_cv.clone()
    };

    loop {
        let ptcb = k.threads.get(tid).expect("pinned by refcount");
        if ptcb.exited || ptcb.detached {
            break;
        }
        sched::wait(&mut k, &exit_cv, SchedCause::User);
    }

    let (detached, exited, exitval, remaining) = {
        let ptcb = k.threads.get_mut(tid).expect("pinned by refcount");
        ptcb.refcount -= 1;
        (ptcb.detached, ptcb.exited, ptcb.exitval, ptcb.refcount)
    };
    if exited && remaining == 0 {
        free_ptcb(&mut k, tid);
    }
    if detached {
        return Err(KernelError::Precondition);
    }
    Ok(exitval)
}

/// Detach a thread of the current process, waking all of its joiners.
///
/// Fails if the target belongs to another process or has already exited.
pub fn thread_detach(tid: Tid) -> KernelResult<()> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let ptcb = k.threads.get_mut(tid).ok_or(KernelError::NoThread)?;
    if ptcb.pid != cx.pid {
        return Err(KernelError::NoThread);
    }
    if ptcb.exited {
        return Err(KernelError::Precondition);
    }
    ptcb.detached = true;
    let cv = ptcb.exit_cv.clone();
    sched::broadcast(&cv);
    Ok(())
}

/// Terminate the current thread with the given exit value. Never returns.
pub fn thread_exit(exitval: i32) -> ! {
    sched::exit_thread(exitval)
}

// =============================================================================
// Trampoline and exit bookkeeping
// =============================================================================

/// Entry point of every spawned host thread: run the task, then perform
/// the exit protocol with whatever exit value it produced.
pub(crate) fn thread_entry(pid: Pid, tid: Tid) {
    let cx = sched::context();
    let (task, args) = {
        let k = cx.kernel.state.lock();
        let ptcb = k.threads.get(tid).expect("spawned thread has no PTCB");
        (Arc::clone(&ptcb.task), ptcb.args.clone())
    };

    let exitval = match panic::catch_unwind(AssertUnwindSafe(|| task(&args))) {
        Ok(v) => v,
        Err(payload) => match payload.downcast::<sched::ExitUnwind>() {
            Ok(exit) => exit.0,
            Err(_) => {
                error!("task in process {} panicked; exiting with -1", pid);
                -1
            }
        },
    };

    do_thread_exit(pid, tid, exitval);
}

/// The last act of every thread: decrement the process thread count,
/// tear the process down if this was its last thread, then publish the
/// exit value and wake joiners.
fn do_thread_exit(pid: Pid, tid: Tid, exitval: i32) {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();

    if k.threads.get(tid).expect("exiting thread has a PTCB").main {
        // A main thread's return value is the process exit status.
        k.procs.pcb_mut(pid).exitval = exitval;
    }

    k.procs.pcb_mut(pid).thread_count -= 1;
    let last = k.procs.pcb(pid).thread_count == 0;

    if last {
        if pid == INIT_PID {
            // init outlives everyone: adoptions keep arriving while it
            // drains, so reap until no children remain.
            while proc::wait_any_child(&mut k, pid).is_ok() {}
        } else {
            proc::reparent_children(&mut k, pid);
            proc::notify_parent(&mut k, pid);
        }
        proc::teardown(&mut k, pid, tid);
    }

    let free_now = {
        let ptcb = k.threads.get_mut(tid).expect("exiting thread has a PTCB");
        ptcb.exited = true;
        ptcb.exitval = exitval;
        let cv = ptcb.exit_cv.clone();
        sched::broadcast(&cv);
        ptcb.refcount == 0 && (ptcb.detached || last)
    };
    if free_now {
        free_ptcb(&mut k, tid);
    }

    if last && pid == INIT_PID {
        let cv = k.procs.init_exit.clone();
        sched::broadcast(&cv);
    }

    drop(k);
    trace!("thread {:?} exited with {}", tid, exitval);
}

#[cfg(test)]
mod tests {
    use crate::error::KernelError;
    use crate::{boot, task};

    #[test]
    fn join_returns_the_exit_value() {
        let status = boot(
            task(|_| {
                let tid = crate::create_thread(task(|_| 42), b"").unwrap();
                assert_eq!(crate::thread_join(tid), Ok(42));
                // The record is gone; a second join sees a stale id.
                assert_eq!(crate::thread_join(tid), Err(KernelError::NoThread));
                let cx = crate::sched::context();
                let k = cx.kernel.state.lock();
                // Only our own record remains.
                assert_eq!(k.threads.len(), 1);
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn join_self_is_rejected() {
        let status = boot(
            task(|_| {
                let me = crate::thread_self();
                assert_eq!(crate::thread_join(me), Err(KernelError::Precondition));
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn detached_threads_cannot_be_joined() {
        let status = boot(
            task(|_| {
                let tid = crate::create_thread(
                    task(|_| {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        7
                    }),
                    b"",
                )
                .unwrap();
                crate::thread_detach(tid).unwrap();
                assert_eq!(crate::thread_join(tid), Err(KernelError::Precondition));
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn joiners_wake_on_detach() {
        let status = boot(
            task(|_| {
                let target = crate::create_thread(
                    task(|_| {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        1
                    }),
                    b"",
                )
                .unwrap();
                let waiter = crate::create_thread(
                    // A waiter that only arrives after the detached thread
                    // exits finds the record already reclaimed.
                    task(move |_| match crate::thread_join(target) {
                        Err(KernelError::Precondition) | Err(KernelError::NoThread) => 0,
                        other => {
                            let _ = other;
                            1
                        }
                    }),
                    b"",
                )
                .unwrap();
                std::thread::sleep(std::time::Duration::from_millis(10));
                crate::thread_detach(target).unwrap();
                assert_eq!(crate::thread_join(waiter), Ok(0));
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn thread_exit_short_circuits_the_task() {
        let status = boot(
            task(|_| {
                let tid = crate::create_thread(
                    task(|_| {
                        crate::thread_exit(5);
                    }),
                    b"",
                )
                .unwrap();
                assert_eq!(crate::thread_join(tid), Ok(5));
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }
}
