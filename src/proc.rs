//! Process management
//!
//! The process table is a fixed array of PCBs keyed by pid, with a free
//! list so reaped pids can be re-issued. A process is `Alive` while it has
//! at least one live thread, becomes a `Zombie` when its last thread
//! exits, and returns to `Free` when its parent reaps it.
//!
//! pid 0 is the idle process: the boot context, with no task and no
//! threads. pid 1 is init: it adopts orphans, and at exit it drains every
//! remaining child before the kernel halts.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use log::debug;

use crate::error::{KernelError, KernelResult};
use crate::sched::{self, CondVar, KGuard, Kernel, SchedCause};
use crate::streams::{self, FcbId};
use crate::thread::{self, Tid};
use crate::{Task, MAX_FILEID, MAX_PROC};

/// Process id: an index into the process table.
pub type Pid = usize;

/// The idle process, i.e. the boot context.
pub(crate) const IDLE_PID: Pid = 0;

/// The init process. Orphans are re-parented to it.
pub(crate) const INIT_PID: Pid = 1;

/// Process state tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PState {
    Free,
    Alive,
    Zombie,
}

/// Process Control Block.
pub(crate) struct Pcb {
    pub state: PState,
    pub parent: Option<Pid>,
    /// All children, alive and zombie
    pub children: Vec<Pid>,
    /// Zombie children awaiting reaping, newest first
    pub exited: VecDeque<Pid>,
    /// Waited on by `wait_child`
    pub child_exit: CondVar,
    /// File-id table
    pub fidt: [Option<FcbId>; MAX_FILEID],
    pub main_task: Option<Task>,
    /// Argument length, kept after the bytes are released at teardown
    pub argl: usize,
    pub args: Vec<u8>,
    pub main_thread: Option<Tid>,
    /// All thread records of this process
    pub threads: Vec<Tid>,
    pub thread_count: usize,
    pub exitval: i32,
}

impl Pcb {
    fn new() -> Self {
        Self {
            state: PState::Free,
            parent: None,
            children: Vec::new(),
            exited: VecDeque::new(),
            child_exit: CondVar::new(),
            fidt: [None; MAX_FILEID],
            main_task: None,
            argl: 0,
            args: Vec::new(),
            main_thread: None,
            threads: Vec::new(),
            thread_count: 0,
            exitval: 0,
        }
    }
}

/// The process table.
pub(crate) struct ProcTable {
    table: Vec<Pcb>,
    /// Free pids; freshly released pids go to the front
    free: VecDeque<Pid>,
    pub process_count: usize,
    /// Broadcast when init becomes a zombie; `boot` waits here
    pub init_exit: CondVar,
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            table: (0..MAX_PROC).map(|_| Pcb::new()).collect(),
            free: (0..MAX_PROC).collect(),
            process_count: 0,
            init_exit: CondVar::new(),
        }
    }

    pub fn pcb(&self, pid: Pid) -> &Pcb {
        &self.table[pid]
    }

    pub fn pcb_mut(&mut self, pid: Pid) -> &mut Pcb {
        &mut self.table[pid]
    }

    /// Look up a non-free PCB.
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        let pcb = self.table.get(pid)?;
        if pcb.state == PState::Free {
            None
        } else {
            Some(pcb)
        }
    }

    fn acquire(&mut self) -> Option<Pid> {
        let pid = self.free.pop_front()?;
        self.table[pid].state = PState::Alive;
        self.process_count += 1;
        Some(pid)
    }

    fn release(&mut self, pid: Pid) {
        self.table[pid] = Pcb::new();
        self.free.push_front(pid);
        self.process_count -= 1;
    }
}

/// Build the table's boot state: the idle process gets pid 0.
pub(crate) fn init_processes(k: &mut KGuard<'_>) {
    let idle = k.procs.acquire().expect("fresh process table");
    assert_eq!(idle, IDLE_PID, "the idle process must have pid 0");
    // idle has no task and no threads; it is the boot thread's context
}

// =============================================================================
// Process syscalls
// =============================================================================

/// Create a new process running `task`, or an empty one when `task` is
/// `None` (used only for the idle process at boot).
///
/// Children of ordinary processes inherit the parent's open streams and a
/// private copy of the argument bytes.
pub fn exec(task: Option<Task>, args: &[u8]) -> KernelResult<Pid> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    do_exec(&mut k, &cx.kernel, cx.pid, task, args)
}

pub(crate) fn do_exec(
    k: &mut KGuard<'_>,
    kernel: &Arc<Kernel>,
    curpid: Pid,
    task: Option<Task>,
    args: &[u8],
) -> KernelResult<Pid> {
    let pid = k.procs.acquire().ok_or(KernelError::Exhausted)?;

    if pid > INIT_PID {
        // Ordinary process: link under the caller and inherit its streams.
        k.procs.pcb_mut(pid).parent = Some(curpid);
        k.procs.pcb_mut(curpid).children.push(pid);

        let fidt = k.procs.pcb(curpid).fidt;
        for id in fidt.iter().flatten() {
            streams::incref(k, *id);
        }
        k.procs.pcb_mut(pid).fidt = fidt;
    }

    {
        let pcb = k.procs.pcb_mut(pid);
        pcb.main_task = task.clone();
        pcb.argl = args.len();
        pcb.args = args.to_vec();
    }

    // Spawning the main thread is the last step: once it wakes it may run.
    if let Some(task) = task {
        let tid = thread::spawn_task_thread(k, kernel, pid, task, args.to_vec(), true);
        k.procs.pcb_mut(pid).main_thread = Some(tid);
    }

    debug!(
        "exec: pid {} (parent {:?}, main thread {:?})",
        pid,
        k.procs.pcb(pid).parent,
        k.procs.pcb(pid).main_thread
    );
    Ok(pid)
}

/// Return the pid of the current process.
pub fn get_pid() -> Pid {
    sched::context().pid
}

/// Return the pid of the current process's parent, if it has one.
pub fn get_ppid() -> Option<Pid> {
    let cx = sched::context();
    let k = cx.kernel.state.lock();
    k.procs.pcb(cx.pid).parent
}

/// Wait for a child to exit and reap it.
///
/// With `Some(cpid)`, waits for that specific child; fails if the pid is
/// out of range or not a direct child of the caller. With `None`, waits
/// for any child; fails if the caller has no children at all. Returns the
/// reaped child's pid and exit status.
pub fn wait_child(cpid: Option<Pid>) -> KernelResult<(Pid, i32)> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    match cpid {
        Some(p) => wait_specific_child(&mut k, cx.pid, p),
        None => wait_any_child(&mut k, cx.pid),
    }
}

pub(crate) fn wait_any_child(k: &mut KGuard<'_>, pid: Pid) -> KernelResult<(Pid, i32)> {
    let cv = k.procs.pcb(pid).child_exit.clone();
    loop {
        let pcb = k.procs.pcb(pid);
        if pcb.children.is_empty() {
            return Err(KernelError::NoProcess);
        }
        if !pcb.exited.is_empty() {
            break;
        }
        sched::wait(k, &cv, SchedCause::User);
    }

    let child = *k.procs.pcb(pid).exited.front().expect("checked non-empty");
    debug_assert_eq!(k.procs.pcb(child).state, PState::Zombie);
    let status = cleanup_zombie(k, child);
    Ok((child, status))
}

fn wait_specific_child(k: &mut KGuard<'_>, pid: Pid, cpid: Pid) -> KernelResult<(Pid, i32)> {
    if cpid >= MAX_PROC {
        return Err(KernelError::NoProcess);
    }
    let cv = k.procs.pcb(pid).child_exit.clone();
    loop {
        // Re-validated every wakeup: a sibling waiter may have reaped the
        // child while we slept.
        let child = k.procs.get(cpid).ok_or(KernelError::NoProcess)?;
        if child.parent != Some(pid) {
            return Err(KernelError::NoProcess);
        }
        if child.state != PState::Alive {
            break;
        }
        sched::wait(k, &cv, SchedCause::User);
    }

    let status = cleanup_zombie(k, cpid);
    Ok((cpid, status))
}

/// Remove a zombie from its parent's lists, publish its status, and free
/// its pid for re-issue.
fn cleanup_zombie(k: &mut KGuard<'_>, cpid: Pid) -> i32 {
    let status = k.procs.pcb(cpid).exitval;
    if let Some(pp) = k.procs.pcb(cpid).parent {
        let ppcb = k.procs.pcb_mut(pp);
        ppcb.children.retain(|&c| c != cpid);
        ppcb.exited.retain(|&c| c != cpid);
    }
    debug!("reap: pid {} status {}", cpid, status);
    k.procs.release(cpid);
    status
}

/// Terminate the current process with the given status. Never returns.
///
/// Records the status as the process exit value, then exits the current
/// thread; the process itself dies when its last thread is gone.
pub fn exit(status: i32) -> ! {
    let cx = sched::context();
    {
        let mut k = cx.kernel.state.lock();
        k.procs.pcb_mut(cx.pid).exitval = status;
    }
    sched::exit_thread(status)
}

// =============================================================================
// Last-thread teardown helpers (called from the thread exit path)
// =============================================================================

/// Hand all children of a dying process to init: live ones join init's
/// children list, zombies move to init's exited list with a wakeup.
pub(crate) fn reparent_children(k: &mut KGuard<'_>, pid: Pid) {
    let children = mem::take(&mut k.procs.pcb_mut(pid).children);
    for &c in &children {
        k.procs.pcb_mut(c).parent = Some(INIT_PID);
    }
    k.procs.pcb_mut(INIT_PID).children.extend(children);

    let exited = mem::take(&mut k.procs.pcb_mut(pid).exited);
    if !exited.is_empty() {
        k.procs.pcb_mut(INIT_PID).exited.extend(exited);
        let cv = k.procs.pcb(INIT_PID).child_exit.clone();
        sched::broadcast(&cv);
    }
}

/// Put the dying process on its parent's exited list and wake the parent.
pub(crate) fn notify_parent(k: &mut KGuard<'_>, pid: Pid) {
    let parent = k.procs.pcb(pid).parent.expect("non-init process has a parent");
    k.procs.pcb_mut(parent).exited.push_front(pid);
    let cv = k.procs.pcb(parent).child_exit.clone();
    sched::broadcast(&cv);
}

/// Release a dying process's resources and mark it a zombie. `current` is
/// the exiting thread, whose record the exit path still needs.
pub(crate) fn teardown(k: &mut KGuard<'_>, pid: Pid, current: Tid) {
    debug_assert!(k.procs.pcb(pid).children.is_empty());
    debug_assert!(k.procs.pcb(pid).exited.is_empty());

    // Close every open stream.
    let fidt = mem::replace(&mut k.procs.pcb_mut(pid).fidt, [None; MAX_FILEID]);
    for id in fidt.into_iter().flatten() {
        let _ = streams::decref(k, id);
    }

    {
        let pcb = k.procs.pcb_mut(pid);
        pcb.args = Vec::new();
        pcb.main_thread = None;
        pcb.state = PState::Zombie;
    }

    // Sweep exited thread records nobody joined. All threads are dead by
    // now, so no joiner can still hold a reference.
    let threads = k.procs.pcb(pid).threads.clone();
    for tid in threads {
        if tid == current {
            continue;
        }
        if let Some(ptcb) = k.threads.get(tid) {
            debug_assert!(ptcb.exited && ptcb.refcount == 0);
            thread::free_ptcb(k, tid);
        }
    }

    debug!("process {} is now a zombie", pid);
}

#[cfg(test)]
mod tests {
    use crate::error::KernelError;
    use crate::{boot, task};

    #[test]
    fn exec_and_wait_round_trip() {
        let status = boot(
            task(|_| {
                let child = crate::exec(Some(task(|_| 17)), b"").unwrap();
                let (pid, status) = crate::wait_child(Some(child)).unwrap();
                assert_eq!(pid, child);
                assert_eq!(status, 17);
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn wait_any_with_no_children_fails() {
        let status = boot(
            task(|_| match crate::wait_child(None) {
                Err(KernelError::NoProcess) => 0,
                _ => 1,
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn wait_for_non_child_fails() {
        let status = boot(
            task(|_| {
                assert_eq!(
                    crate::wait_child(Some(crate::MAX_PROC)),
                    Err(KernelError::NoProcess)
                );
                assert_eq!(
                    crate::wait_child(Some(crate::get_pid())),
                    Err(KernelError::NoProcess)
                );
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn pids_and_ppids_line_up() {
        let status = boot(
            task(|_| {
                assert_eq!(crate::get_pid(), 1);
                assert_eq!(crate::get_ppid(), None);
                let child = crate::exec(
                    Some(task(|_| {
                        assert_eq!(crate::get_ppid(), Some(1));
                        0
                    })),
                    b"",
                )
                .unwrap();
                let (pid, status) = crate::wait_child(None).unwrap();
                assert_eq!(pid, child);
                status
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn orphans_are_adopted_by_init() {
        let status = boot(
            task(|_| {
                // The middle process exits while its own child still runs,
                // so the grandchild is re-parented to init (that's us).
                let middle = crate::exec(
                    Some(task(|_| {
                        let _grandchild = crate::exec(
                            Some(task(|_| {
                                std::thread::sleep(std::time::Duration::from_millis(30));
                                9
                            })),
                            b"",
                        )
                        .unwrap();
                        // Exit without waiting: the grandchild is orphaned.
                        3
                    })),
                    b"",
                )
                .unwrap();
                let (pid, status) = crate::wait_child(Some(middle)).unwrap();
                assert_eq!(pid, middle);
                assert_eq!(status, 3);
                // init's own drain loop will reap the adopted grandchild on
                // exit; nothing further to assert here beyond a clean halt.
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn reaped_pids_are_reissued() {
        let status = boot(
            task(|_| {
                let a = crate::exec(Some(task(|_| 1)), b"").unwrap();
                let (p1, _) = crate::wait_child(None).unwrap();
                assert_eq!(p1, a);
                // The freshest released pid is handed out again.
                let b = crate::exec(Some(task(|_| 2)), b"").unwrap();
                assert_eq!(b, a);
                let (p2, s2) = crate::wait_child(None).unwrap();
                assert_eq!(p2, b);
                assert_eq!(s2, 2);
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }
}
