//! Sockets
//!
//! Stream sockets that reuse pipes as their transport. A socket is born
//! `Unbound` and may be promoted exactly once: to `Listener` by `listen`,
//! or to `Peer` by the connect/accept rendezvous. There is no demotion;
//! closing clears resources but not the tag.
//!
//! ## Rendezvous
//!
//! `connect` enqueues a request on the listener at the target port, wakes
//! the listener, and waits (optionally bounded) on the request's condition
//! variable. `accept` pops a request, reserves a server-side socket on the
//! same port, promotes both sockets to peers cross-linked over a fresh
//! pipe pair, and answers the request. The request record is owned by the
//! connecting thread in every outcome: whoever dequeues it only marks it
//! answered; the connector frees it after waking.
//!
//! ## Lifetime
//!
//! Socket records are reference counted: one reference for the owning
//! file handle, plus a pin taken by `accept` and `connect` around their
//! waits so a concurrent close cannot free the record under them. The
//! peer back-reference is never trusted to be live; it is used only for
//! pairing assertions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use slab::Slab;

use crate::error::{KernelError, KernelResult};
use crate::pipe::{self, PipeId};
use crate::proc::Pid;
use crate::sched::{self, CondVar, KGuard, SchedCause};
use crate::streams::{self, Fid, StreamOps};
use crate::{MAX_PORT, NOPORT};

/// Port number. [`NOPORT`] (0) means "no port".
pub type Port = u16;

/// Which direction(s) of a peer socket to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Read,
    Write,
    Both,
}

/// Key of a socket in the socket table.
pub(crate) type SockId = usize;

/// Key of a connection request in the request table.
type ReqId = usize;

/// Tag-dependent socket body.
pub(crate) enum SocketState {
    Unbound,
    Listener {
        /// Pending connection requests, FIFO
        queue: VecDeque<ReqId>,
        /// Acceptors block here while the queue is empty
        req_available: CondVar,
    },
    Peer {
        /// The other end of the connection; pairing metadata only
        peer: SockId,
        /// Cleared by shutdown(Read) and close
        read_pipe: Option<PipeId>,
        /// Cleared by shutdown(Write) and close
        write_pipe: Option<PipeId>,
    },
}

/// Socket control block.
pub(crate) struct SocketCb {
    /// One for the owning FCB, plus accept/connect pins
    refcount: usize,
    port: Port,
    state: SocketState,
}

/// A pending connection, owned by the connecting thread.
struct ConnRequest {
    /// Set by accept on success
    admitted: bool,
    /// Set once the request has been decided (admitted or rejected)
    answered: bool,
    /// Still linked on a listener's queue
    queued: bool,
    /// The initiating (client) socket
    peer: SockId,
    /// The connector blocks here
    connected: CondVar,
}

/// Kernel-wide socket state: sockets, pending requests, and the port map.
pub(crate) struct SocketTable {
    sockets: Slab<SocketCb>,
    requests: Slab<ConnRequest>,
    /// `port_map[p]` is the listener published on port `p`
    port_map: Vec<Option<SockId>>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self {
            sockets: Slab::new(),
            requests: Slab::new(),
            port_map: vec![None; MAX_PORT as usize + 1],
        }
    }

    /// Number of live sockets. Used by leak assertions in tests.
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Number of pending requests. Used by leak assertions in tests.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}

/// Drop a reference to a socket, releasing the slot at zero.
fn scb_decref(k: &mut KGuard<'_>, sid: SockId) {
    let sock = &mut k.sockets.sockets[sid];
    sock.refcount -= 1;
    if sock.refcount == 0 {
        k.sockets.sockets.remove(sid);
        trace!("socket {}: destroyed", sid);
    }
}

/// Allocate an unbound socket plus its file handle.
fn socket_alloc(k: &mut KGuard<'_>, pid: Pid, port: Port) -> KernelResult<(Fid, SockId)> {
    let sid = k.sockets.sockets.insert(SocketCb {
        refcount: 1,
        port,
        state: SocketState::Unbound,
    });
    let stream: Arc<dyn StreamOps> = Arc::new(SocketStream(sid));
    match streams::reserve(k, pid, vec![stream]) {
        Ok(fids) => Ok((fids[0], sid)),
        Err(e) => {
            k.sockets.sockets.remove(sid);
            Err(e)
        }
    }
}

/// Resolve a fid to the socket behind it.
fn resolve_socket(k: &KGuard<'_>, pid: Pid, fid: Fid) -> KernelResult<SockId> {
    let id = streams::lookup(k, pid, fid)?;
    let fcb = k.files.get(id).expect("fidt entries point at live FCBs");
    let stream = fcb
        .ops
        .as_any()
        .downcast_ref::<SocketStream>()
        .ok_or(KernelError::WrongState)?;
    Ok(stream.0)
}

// =============================================================================
// Socket syscalls
// =============================================================================

/// Create an unbound socket, optionally carrying a port. Returns its fid.
pub fn socket(port: Port) -> KernelResult<Fid> {
    if port > MAX_PORT {
        return Err(KernelError::InvalidArgument);
    }
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let (fid, _) = socket_alloc(&mut k, cx.pid, port)?;
    Ok(fid)
}

/// Promote an unbound socket to a listener and publish it on its port.
///
/// Fails on an invalid fid, a non-socket or non-unbound socket, a missing
/// port, or a port that already has a listener.
pub fn listen(fid: Fid) -> KernelResult<()> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let sid = resolve_socket(&k, cx.pid, fid)?;

    let port = {
        let sock = &k.sockets.sockets[sid];
        if !matches!(sock.state, SocketState::Unbound) {
            return Err(KernelError::WrongState);
        }
        if sock.port == NOPORT {
            return Err(KernelError::InvalidArgument);
        }
        sock.port
    };
    if k.sockets.port_map[port as usize].is_some() {
        return Err(KernelError::PortBusy);
    }

    k.sockets.sockets[sid].state = SocketState::Listener {
        queue: VecDeque::new(),
        req_available: CondVar::new(),
    };
    k.sockets.port_map[port as usize] = Some(sid);
    debug!("listen: socket {} published on port {}", sid, port);
    Ok(())
}

/// Wait for a connection on a listener and return the fid of the
/// server-side peer socket.
///
/// Suspends while the request queue is empty and the listener remains
/// published; fails if the listener is closed while we wait. If the
/// server-side handle cannot be reserved, the connector is still answered
/// (as rejected).
pub fn accept(fid: Fid) -> KernelResult<Fid> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let lsid = resolve_socket(&k, cx.pid, fid)?;

    let port = {
        let sock = &k.sockets.sockets[lsid];
        if !matches!(sock.state, SocketState::Listener { .. }) {
            return Err(KernelError::WrongState);
        }
        sock.port as usize
    };

    // Pin the listener so a close during the wait cannot free it.
    k.sockets.sockets[lsid].refcount += 1;

    loop {
        if k.sockets.port_map[port] != Some(lsid) {
            // Unpublished while we waited: the listener is closing.
            scb_decref(&mut k, lsid);
            return Err(KernelError::WrongState);
        }
        let (empty, cv) = match &k.sockets.sockets[lsid].state {
            SocketState::Listener {
                queue,
                req_available,
            } => (queue.is_empty(), req_available.clone()),
            _ => unreachable!("listeners are never demoted"),
        };
        if !empty {
            break;
        }
        sched::wait(&mut k, &cv, SchedCause::Io);
    }

    let req_id = match &mut k.sockets.sockets[lsid].state {
        SocketState::Listener { queue, .. } => queue.pop_front().expect("checked non-empty"),
        _ => unreachable!("listeners are never demoted"),
    };
    k.sockets.requests[req_id].queued = false;

    // Reserve the server-side socket on the same port.
    let (server_fid, ssid) = match socket_alloc(&mut k, cx.pid, port as Port) {
        Ok(pair) => pair,
        Err(e) => {
            // Still answer the connector, as rejected.
            let req = &mut k.sockets.requests[req_id];
            req.answered = true;
            let cv = req.connected.clone();
            sched::signal(&cv);
            scb_decref(&mut k, lsid);
            return Err(e);
        }
    };

    // Pair the two peers over a fresh pipe pair, one direction each.
    let csid = k.sockets.requests[req_id].peer;
    let server_to_client = pipe::pipe_alloc(&mut k);
    let client_to_server = pipe::pipe_alloc(&mut k);
    k.sockets.sockets[ssid].state = SocketState::Peer {
        peer: csid,
        read_pipe: Some(client_to_server),
        write_pipe: Some(server_to_client),
    };
    k.sockets.sockets[csid].state = SocketState::Peer {
        peer: ssid,
        read_pipe: Some(server_to_client),
        write_pipe: Some(client_to_server),
    };

    let req = &mut k.sockets.requests[req_id];
    req.admitted = true;
    req.answered = true;
    let cv = req.connected.clone();
    sched::signal(&cv);

    scb_decref(&mut k, lsid);
    debug!("accept: port {} paired sockets {} and {}", port, ssid, csid);
    Ok(server_fid)
}

/// Connect an unbound socket to the listener at `port`.
///
/// Enqueues a request, wakes the listener, and waits for admission,
/// indefinitely when `timeout` is `None`. In every outcome the request is
/// dequeued and freed by this thread. Returns `Ok(())` iff admitted.
pub fn connect(fid: Fid, port: Port, timeout: Option<Duration>) -> KernelResult<()> {
    if port == NOPORT || port > MAX_PORT {
        return Err(KernelError::InvalidArgument);
    }
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let sid = resolve_socket(&k, cx.pid, fid)?;
    if !matches!(k.sockets.sockets[sid].state, SocketState::Unbound) {
        return Err(KernelError::WrongState);
    }
    let lsid = k.sockets.port_map[port as usize].ok_or(KernelError::WrongState)?;
    debug_assert!(matches!(
        k.sockets.sockets[lsid].state,
        SocketState::Listener { .. }
    ));

    // Pin our socket for the duration of the wait.
    k.sockets.sockets[sid].refcount += 1;

    let req_id = k.sockets.requests.insert(ConnRequest {
        admitted: false,
        answered: false,
        queued: true,
        peer: sid,
        connected: CondVar::new(),
    });
    let connected = k.sockets.requests[req_id].connected.clone();
    match &mut k.sockets.sockets[lsid].state {
        SocketState::Listener {
            queue,
            req_available,
        } => {
            queue.push_back(req_id);
            let cv = req_available.clone();
            sched::signal(&cv);
        }
        _ => unreachable!("port map entries are listeners"),
    }
    trace!("connect: socket {} queued on port {}", sid, port);

    match timeout {
        None => {
            while !k.sockets.requests[req_id].answered {
                sched::wait(&mut k, &connected, SchedCause::Io);
            }
        }
        Some(limit) => {
            let deadline = Instant::now() + limit;
            while !k.sockets.requests[req_id].answered {
                let now = Instant::now();
                if now >= deadline
                    || sched::timedwait(&mut k, &connected, SchedCause::Io, deadline - now)
                {
                    break;
                }
            }
        }
    }

    scb_decref(&mut k, sid);

    // Whatever happened, this thread owns the request: dequeue and free it.
    if k.sockets.requests[req_id].queued {
        if let Some(l) = k.sockets.port_map[port as usize] {
            if let SocketState::Listener { queue, .. } = &mut k.sockets.sockets[l].state {
                queue.retain(|&r| r != req_id);
            }
        }
    }
    let req = k.sockets.requests.remove(req_id);

    if req.admitted {
        Ok(())
    } else if req.answered {
        // The listener rejected us or closed.
        Err(KernelError::PeerClosed)
    } else {
        Err(KernelError::TimedOut)
    }
}

/// Shut down one or both directions of a peer socket.
///
/// Shutting down an already-closed direction is a no-op; each pipe half is
/// closed at most once because the slot is taken before closing.
pub fn shutdown(fid: Fid, how: ShutdownMode) -> KernelResult<()> {
    let cx = sched::context();
    let mut k = cx.kernel.state.lock();
    let sid = resolve_socket(&k, cx.pid, fid)?;

    let (rp, wp) = match &mut k.sockets.sockets[sid].state {
        SocketState::Peer {
            read_pipe,
            write_pipe,
            ..
        } => match how {
            ShutdownMode::Read => (read_pipe.take(), None),
            ShutdownMode::Write => (None, write_pipe.take()),
            ShutdownMode::Both => (read_pipe.take(), write_pipe.take()),
        },
        _ => return Err(KernelError::WrongState),
    };

    if let Some(p) = rp {
        let _ = pipe::pipe_reader_close(&mut k, p);
    }
    if let Some(p) = wp {
        let _ = pipe::pipe_writer_close(&mut k, p);
    }
    debug!("shutdown: socket {} {:?}", sid, how);
    Ok(())
}

// =============================================================================
// Stream ops
// =============================================================================

/// Operation vector shared by every socket fid; read and write only work
/// once the socket is a peer.
struct SocketStream(SockId);

impl StreamOps for SocketStream {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn read(&self, k: &mut KGuard<'_>, buf: &mut [u8]) -> KernelResult<usize> {
        let pipe = match &k.sockets.sockets[self.0].state {
            SocketState::Peer {
                read_pipe: Some(p), ..
            } => *p,
            _ => return Err(KernelError::WrongState),
        };
        pipe::pipe_read(k, pipe, buf)
    }

    fn write(&self, k: &mut KGuard<'_>, buf: &[u8]) -> KernelResult<usize> {
        let pipe = match &k.sockets.sockets[self.0].state {
            SocketState::Peer {
                write_pipe: Some(p),
                ..
            } => *p,
            _ => return Err(KernelError::WrongState),
        };
        pipe::pipe_write(k, pipe, buf)
    }

    fn close(&self, k: &mut KGuard<'_>) -> KernelResult<()> {
        let sid = self.0;
        enum Cleanup {
            Nothing,
            Peer(Option<PipeId>, Option<PipeId>),
            Listener(Vec<ReqId>, CondVar, Port),
        }

        let port = k.sockets.sockets[sid].port;
        let cleanup = match &mut k.sockets.sockets[sid].state {
            SocketState::Unbound => Cleanup::Nothing,
            SocketState::Peer {
                peer,
                read_pipe,
                write_pipe,
            } => {
                trace!("close: peer socket {} (peer {})", sid, *peer);
                Cleanup::Peer(read_pipe.take(), write_pipe.take())
            }
            SocketState::Listener {
                queue,
                req_available,
            } => Cleanup::Listener(queue.drain(..).collect(), req_available.clone(), port),
        };

        match cleanup {
            Cleanup::Nothing => {}
            Cleanup::Peer(rp, wp) => {
                if let Some(p) = rp {
                    let _ = pipe::pipe_reader_close(k, p);
                }
                if let Some(p) = wp {
                    let _ = pipe::pipe_writer_close(k, p);
                }
            }
            Cleanup::Listener(reqs, req_available, port) => {
                // Every queued connector is answered as rejected; the
                // request records stay owned by their connectors.
                for r in reqs {
                    let req = &mut k.sockets.requests[r];
                    req.queued = false;
                    req.answered = true;
                    let cv = req.connected.clone();
                    sched::signal(&cv);
                }
                k.sockets.port_map[port as usize] = None;
                // Unblock any acceptor so it observes the unpublication.
                sched::broadcast(&req_available);
                debug!("close: listener {} unpublished from port {}", sid, port);
            }
        }

        scb_decref(k, sid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ShutdownMode;
    use crate::error::KernelError;
    use crate::{boot, task};

    #[test]
    fn listen_preconditions() {
        let status = boot(
            task(|_| {
                // No port at all.
                let s0 = crate::socket(crate::NOPORT).unwrap();
                assert_eq!(crate::listen(s0), Err(KernelError::InvalidArgument));

                // Out-of-range port at creation.
                assert_eq!(
                    crate::socket(crate::MAX_PORT + 1),
                    Err(KernelError::InvalidArgument)
                );

                // Occupied port.
                let s1 = crate::socket(50).unwrap();
                crate::listen(s1).unwrap();
                let s2 = crate::socket(50).unwrap();
                assert_eq!(crate::listen(s2), Err(KernelError::PortBusy));

                // Double listen on the same socket.
                assert_eq!(crate::listen(s1), Err(KernelError::WrongState));

                // A pipe fid is not a socket.
                let (r, w) = crate::pipe().unwrap();
                assert_eq!(crate::listen(r), Err(KernelError::WrongState));

                for fid in [s0, s1, s2, r, w] {
                    crate::close(fid).unwrap();
                }
                let cx = crate::sched::context();
                let k = cx.kernel.state.lock();
                assert_eq!(k.sockets.len(), 0);
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn connect_without_listener_fails_fast() {
        let status = boot(
            task(|_| {
                let s = crate::socket(crate::NOPORT).unwrap();
                assert_eq!(
                    crate::connect(s, 77, None),
                    Err(KernelError::WrongState)
                );
                assert_eq!(
                    crate::connect(s, crate::NOPORT, None),
                    Err(KernelError::InvalidArgument)
                );
                crate::close(s).unwrap();
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn shutdown_requires_a_peer() {
        let status = boot(
            task(|_| {
                let s = crate::socket(10).unwrap();
                assert_eq!(
                    crate::shutdown(s, ShutdownMode::Both),
                    Err(KernelError::WrongState)
                );
                let mut buf = [0u8; 4];
                assert_eq!(crate::read(s, &mut buf), Err(KernelError::WrongState));
                assert_eq!(crate::write(s, b"x"), Err(KernelError::WrongState));
                crate::close(s).unwrap();
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn closing_a_listener_wakes_the_acceptor() {
        let status = boot(
            task(|_| {
                let l = crate::socket(300).unwrap();
                crate::listen(l).unwrap();
                let acceptor = crate::create_thread(
                    // A slow acceptor may also arrive after the close and
                    // find the fid gone; either way it must not hang.
                    task(move |_| match crate::accept(l) {
                        Err(_) => 0,
                        Ok(_) => 1,
                    }),
                    b"",
                )
                .unwrap();
                std::thread::sleep(std::time::Duration::from_millis(20));
                crate::close(l).unwrap();
                assert_eq!(crate::thread_join(acceptor), Ok(0));
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }

    #[test]
    fn closing_a_listener_rejects_queued_connectors() {
        let status = boot(
            task(|_| {
                let l = crate::socket(301).unwrap();
                crate::listen(l).unwrap();
                let connector = crate::create_thread(
                    task(|_| {
                        let c = crate::socket(crate::NOPORT).unwrap();
                        let res = match crate::connect(c, 301, None) {
                            Err(KernelError::PeerClosed) => 0,
                            _ => 1,
                        };
                        crate::close(c).unwrap();
                        res
                    }),
                    b"",
                )
                .unwrap();
                // Close only once the request has landed in the queue.
                loop {
                    let cx = crate::sched::context();
                    let k = cx.kernel.state.lock();
                    if k.sockets.pending_requests() > 0 {
                        break;
                    }
                    drop(k);
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                crate::close(l).unwrap();
                assert_eq!(crate::thread_join(connector), Ok(0));

                let cx = crate::sched::context();
                let k = cx.kernel.state.lock();
                assert_eq!(k.sockets.pending_requests(), 0);
                0
            }),
            b"",
        );
        assert_eq!(status, 0);
    }
}
