//! ukern — the concurrency core and IPC fabric of a small educational
//! Unix-like kernel, hosted on OS threads.
//!
//! The kernel exposes a Unix-like system-call surface: processes with
//! threads, reference-counted file handles, anonymous byte pipes, and
//! stream sockets that reuse pipes as their transport. Every kernel
//! thread is backed by a host OS thread; one mutex per kernel instance
//! serializes the core, and all blocking happens on condition variables
//! tied to that mutex.
//!
//! ## Usage
//!
//! [`boot`] creates a fresh kernel, runs the given task as the init
//! process (pid 1), and returns its exit status once everything has wound
//! down. All other calls in this crate are syscalls and may only be made
//! from inside a task:
//!
//! ```
//! use ukern::{boot, task};
//!
//! let status = boot(
//!     task(|_| {
//!         let (r, w) = ukern::pipe().unwrap();
//!         ukern::write(w, b"hello").unwrap();
//!         let mut buf = [0u8; 8];
//!         let n = ukern::read(r, &mut buf).unwrap();
//!         assert_eq!(&buf[..n], b"hello");
//!         0
//!     }),
//!     b"",
//! );
//! assert_eq!(status, 0);
//! ```
//!
//! Kernel instances are independent: concurrent `boot` calls (say, from
//! parallel tests) share no state.

use std::sync::Arc;

use log::info;

pub mod error;
pub mod pipe;
pub mod proc;
pub mod procinfo;
mod sched;
pub mod socket;
pub mod streams;
pub mod thread;

pub use error::{KernelError, KernelResult};
pub use pipe::pipe;
pub use proc::{exec, exit, get_pid, get_ppid, wait_child, Pid};
pub use procinfo::{open_info, ProcInfo};
pub use socket::{accept, connect, listen, shutdown, socket, Port, ShutdownMode};
pub use streams::{close, dup2, read, write, Fid};
pub use thread::{create_thread, thread_detach, thread_exit, thread_join, thread_self, Tid};

use proc::{PState, IDLE_PID, INIT_PID};
use sched::{Context, Kernel, SchedCause};

/// Size of a pipe's cyclic byte buffer.
pub const PIPE_BUFFER_SIZE: usize = 512;

/// Number of process-table slots.
pub const MAX_PROC: usize = 1024;

/// Width of each process's file-id table.
pub const MAX_FILEID: usize = 16;

/// Largest usable port number.
pub const MAX_PORT: Port = 1023;

/// The "no port" port.
pub const NOPORT: Port = 0;

/// Most argument bytes a process-info record carries.
pub const PROCINFO_MAX_ARGS_SIZE: usize = 128;

/// A task: the entry function of a process's main thread or of a thread
/// created with [`create_thread`]. Receives the argument bytes and
/// returns an exit value.
pub type Task = Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>;

/// Wrap a closure as a [`Task`].
pub fn task<F>(f: F) -> Task
where
    F: Fn(&[u8]) -> i32 + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Boot a fresh kernel and run `init` as the init process (pid 1) with
/// the given argument bytes.
///
/// The calling thread becomes the idle process (pid 0) for the duration:
/// it waits for init to exit, drains every kernel thread, and returns
/// init's exit status. Note that init only exits after reaping all of its
/// children, adopted orphans included.
///
/// # Panics
///
/// Panics if called from inside a running kernel.
pub fn boot(init: Task, args: &[u8]) -> i32 {
    let kernel = Kernel::new();
    {
        let mut k = kernel.state.lock();
        proc::init_processes(&mut k);
    }

    sched::install_context(Context {
        kernel: Arc::clone(&kernel),
        pid: IDLE_PID,
        tid: None,
    });
    info!("kernel boot");

    let init_pid = proc::exec(Some(init), args).expect("fresh kernel can exec init");
    assert_eq!(init_pid, INIT_PID, "the init process must have pid 1");

    // Idle until init becomes a zombie.
    {
        let mut k = kernel.state.lock();
        let cv = k.procs.init_exit.clone();
        while k.procs.pcb(INIT_PID).state != PState::Zombie {
            sched::wait(&mut k, &cv, SchedCause::User);
        }
    }

    // Every process is an init descendant and has been reaped, so all
    // kernel threads are finishing; collect their host threads.
    loop {
        let handles: Vec<_> = kernel.handles.lock().drain(..).collect();
        if handles.is_empty() {
            break;
        }
        for handle in handles {
            let _ = handle.join();
        }
    }

    let (status, remaining) = {
        let k = kernel.state.lock();
        (k.procs.pcb(INIT_PID).exitval, k.procs.process_count)
    };
    sched::clear_context();
    // The idle process and the unreaped init zombie are all that's left.
    info!(
        "kernel halted: init status {}, {} process slots in use",
        status, remaining
    );
    status
}
