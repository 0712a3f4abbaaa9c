// src/reactor.rs
//! The event loop.
//!
//! One reactor thread owns the listener, the epoll instance, the slab's free
//! list and every socket read and write. Workers only parse and build. A
//! connection is registered edge-triggered and one-shot, so after each event
//! it stays disarmed until its current owner re-arms it; whoever re-arms must
//! have released the connection's lock first.

use crate::config::ServerConfig;
use crate::conn::{ConnState, Connection, Drain, Fill};
use crate::error::ServeResult;
use crate::http::BUSY_TEXT;
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::resolver::DocumentRoot;
use crate::slab::ConnectionSlab;
use crate::syscalls::{self, EV_HANGUP, EV_READABLE, EV_WRITABLE, Epoll, Interest, epoll_event};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const LISTENER_TOKEN: u64 = u64::MAX;

/// What a worker runs against a connection that has bytes to look at.
type Step = fn(&mut Connection, &DocumentRoot) -> Interest;

/// State shared between the reactor and the workers.
struct Shared {
    epoll: Epoll,
    slots: Arc<[Mutex<Connection>]>,
    root: DocumentRoot,
    metrics: Arc<ServerMetrics>,
    step: Step,
    /// Slots a worker could not re-arm; only the reactor may free them.
    orphans: Sender<usize>,
}

pub struct Reactor {
    shared: Arc<Shared>,
    slab: ConnectionSlab,
    pool: WorkerPool<usize>,
    listener: OwnedFd,
    orphans: Receiver<usize>,
    events: Vec<epoll_event>,
    poll_timeout_ms: i32,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(
        listener: OwnedFd,
        config: &ServerConfig,
        metrics: Arc<ServerMetrics>,
        shutdown: Arc<AtomicBool>,
    ) -> ServeResult<Self> {
        Self::with_step(listener, config, metrics, shutdown, Connection::process)
    }

    fn with_step(
        listener: OwnedFd,
        config: &ServerConfig,
        metrics: Arc<ServerMetrics>,
        shutdown: Arc<AtomicBool>,
        step: Step,
    ) -> ServeResult<Self> {
        let epoll = Epoll::new()?;
        epoll.add_listener(listener.as_raw_fd(), LISTENER_TOKEN)?;

        let slab = ConnectionSlab::new(config.max_connections);
        let (orphan_tx, orphan_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            epoll,
            slots: slab.entries(),
            root: config.document_root(),
            metrics,
            step,
            orphans: orphan_tx,
        });

        let worker_shared = Arc::clone(&shared);
        let pool = WorkerPool::new(
            config.workers,
            config.max_queued_requests,
            config.pin_workers,
            move |slot| process_slot(&worker_shared, slot),
        )?;

        Ok(Self {
            shared,
            slab,
            pool,
            listener,
            orphans: orphan_rx,
            events: syscalls::empty_events(config.max_events),
            poll_timeout_ms: config.poll_timeout_ms,
            shutdown,
        })
    }

    /// Run until the shutdown flag is raised, then close every connection.
    pub fn run(&mut self) -> ServeResult<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            let n = match self.shared.epoll.wait(&mut self.events, self.poll_timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "epoll_wait failed");
                    self.close_all();
                    return Err(e.into());
                }
            };

            for i in 0..n {
                // epoll_event is packed; copy the fields out.
                let token = self.events[i].u64;
                let flags = self.events[i].events;

                if token == LISTENER_TOKEN {
                    self.accept_all();
                } else {
                    self.dispatch(token as usize, flags);
                }
            }
            self.reap_orphans();
        }

        self.close_all();
        Ok(())
    }

    /// Accept until the listener would block. The listener is edge-triggered,
    /// so anything left in the backlog here waits for the next connection.
    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(&self.listener) {
                Ok(Some((socket, peer))) => self.admit(socket, peer),
                Ok(None) => return,
                Err(e) => match accept_step(&e) {
                    AcceptStep::Retry => {
                        tracing::debug!(error = %e, "accept failed for one peer");
                    }
                    AcceptStep::Stop => {
                        tracing::warn!(error = %e, "accept failed");
                        return;
                    }
                },
            }
        }
    }

    fn admit(&mut self, socket: OwnedFd, peer: SocketAddr) {
        let Some(slot) = self.slab.allocate() else {
            tracing::warn!(%peer, active = self.slab.len(), "connection table full, rejecting");
            syscalls::send_best_effort(socket.as_raw_fd(), BUSY_TEXT.as_bytes());
            self.shared.metrics.inc_rejected();
            return;
        };

        let fd = socket.as_raw_fd();
        let shared = Arc::clone(&self.shared);
        let entry = &shared.slots[slot];
        entry.lock().open(socket, peer);
        self.shared.metrics.inc_conn();

        if let Err(e) = self.shared.epoll.add(fd, slot as u64, Interest::Read) {
            tracing::warn!(%peer, error = %e, "failed to register connection");
            self.close(slot, &mut entry.lock());
            return;
        }
        tracing::debug!(%peer, slot, "connection accepted");
    }

    fn dispatch(&mut self, slot: usize, flags: u32) {
        let shared = Arc::clone(&self.shared);
        let Some(entry) = shared.slots.get(slot) else {
            tracing::warn!(slot, "event for unknown slot");
            return;
        };
        let mut conn = entry.lock();
        if conn.state() == ConnState::Free {
            return;
        }

        if flags & EV_HANGUP != 0 {
            tracing::debug!(peer = ?conn.peer(), "peer hung up");
            self.close(slot, &mut conn);
        } else if flags & EV_READABLE != 0 {
            match conn.fill() {
                Ok(Fill::Drained | Fill::BufferFull) => {
                    drop(conn);
                    if let Err(e) = self.pool.submit(slot) {
                        let mut conn = entry.lock();
                        tracing::warn!(peer = ?conn.peer(), error = %e, "dropping connection");
                        self.close(slot, &mut conn);
                    }
                }
                Ok(Fill::PeerClosed) => self.close(slot, &mut conn),
                Err(e) => {
                    tracing::debug!(peer = ?conn.peer(), error = %e, "read failed");
                    self.close(slot, &mut conn);
                }
            }
        } else if flags & EV_WRITABLE != 0 {
            if conn.state() == ConnState::Closing {
                self.close(slot, &mut conn);
                return;
            }
            let before = conn.bytes_sent();
            let drained = conn.drain();
            self.shared.metrics.add_bytes(conn.bytes_sent() - before);

            match drained {
                Ok(Drain::Blocked) => {
                    let fd = conn.raw_fd();
                    drop(conn);
                    self.rearm(slot, entry, fd, Interest::Write);
                }
                Ok(Drain::Complete) if conn.keep_alive() && !self.is_shutting_down() => {
                    conn.reset();
                    let fd = conn.raw_fd();
                    drop(conn);
                    self.rearm(slot, entry, fd, Interest::Read);
                }
                Ok(Drain::Complete) => self.close(slot, &mut conn),
                Err(e) => {
                    tracing::debug!(peer = ?conn.peer(), error = %e, "write failed");
                    self.close(slot, &mut conn);
                }
            }
        }
    }

    fn rearm(&mut self, slot: usize, entry: &Mutex<Connection>, fd: Option<RawFd>, interest: Interest) {
        let Some(fd) = fd else { return };
        if let Err(e) = self.shared.epoll.modify(fd, slot as u64, interest) {
            let mut conn = entry.lock();
            tracing::warn!(peer = ?conn.peer(), error = %e, "failed to re-arm connection");
            self.close(slot, &mut conn);
        }
    }

    /// Deregister, release the mapping and socket, return the slot.
    fn close(&mut self, slot: usize, conn: &mut Connection) {
        if let Some(fd) = conn.raw_fd() {
            if let Err(e) = self.shared.epoll.delete(fd) {
                tracing::debug!(error = %e, "epoll delete failed");
            }
        }
        tracing::debug!(peer = ?conn.peer(), served = conn.requests_served(), "connection closed");
        conn.close();
        if self.slab.is_allocated(slot) {
            self.slab.free(slot);
            self.shared.metrics.dec_conn();
        }
    }

    /// Close every slot a worker handed back after a failed re-arm.
    fn reap_orphans(&mut self) {
        let shared = Arc::clone(&self.shared);
        while let Ok(slot) = self.orphans.try_recv() {
            let Some(entry) = shared.slots.get(slot) else {
                continue;
            };
            let mut conn = entry.lock();
            if conn.state() != ConnState::Free {
                self.close(slot, &mut conn);
            }
        }
    }

    fn close_all(&mut self) {
        self.pool.shutdown();
        let shared = Arc::clone(&self.shared);
        for slot in 0..self.slab.capacity() {
            if self.slab.is_allocated(slot) {
                self.close(slot, &mut shared.slots[slot].lock());
            }
        }
        tracing::info!("all connections closed");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn active_connections(&self) -> usize {
        self.slab.len()
    }
}

/// Worker side: parse + build for one slot, then hand it back to epoll.
fn process_slot(shared: &Shared, slot: usize) {
    let Some(entry) = shared.slots.get(slot) else {
        return;
    };

    let (fd, interest) = {
        let mut conn = entry.lock();
        let Some(fd) = conn.raw_fd() else {
            return;
        };
        let interest = run_guarded(&mut conn, |conn| (shared.step)(conn, &shared.root));
        if interest == Interest::Write {
            if let Some(status) = conn.status() {
                shared.metrics.record_response(status);
            }
        }
        (fd, interest)
    };

    // The lock is released; only now may the next event fire.
    if let Err(e) = shared.epoll.modify(fd, slot as u64, interest) {
        tracing::error!(slot, error = %e, "failed to re-arm connection from worker");
        // Disarmed for good; no event will bring it back to the reactor.
        let _ = shared.orphans.send(slot);
    }
}

#[cfg(feature = "catch-panic")]
fn run_guarded<F>(conn: &mut Connection, step: F) -> Interest
where
    F: FnOnce(&mut Connection) -> Interest,
{
    use std::panic::{AssertUnwindSafe, catch_unwind};

    match catch_unwind(AssertUnwindSafe(|| step(conn))) {
        Ok(interest) => interest,
        Err(_) => {
            tracing::error!(peer = ?conn.peer(), "request processing panicked");
            conn.fail_internal()
        }
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run_guarded<F>(conn: &mut Connection, step: F) -> Interest
where
    F: FnOnce(&mut Connection) -> Interest,
{
    step(conn)
}

#[derive(Debug, PartialEq, Eq)]
enum AcceptStep {
    /// The failure belonged to one pending connection; keep accepting.
    Retry,
    Stop,
}

fn accept_step(err: &io::Error) -> AcceptStep {
    if err.kind() == io::ErrorKind::Interrupted {
        return AcceptStep::Retry;
    }
    match err.raw_os_error() {
        Some(
            libc::ECONNABORTED
            | libc::EPROTO
            | libc::ENETDOWN
            | libc::ENETUNREACH
            | libc::ENOPROTOOPT
            | libc::EHOSTDOWN
            | libc::EHOSTUNREACH
            | libc::ENONET
            | libc::EOPNOTSUPP,
        ) => AcceptStep::Retry,
        // EMFILE, ENFILE, ENOBUFS, ENOMEM and anything unexpected.
        _ => AcceptStep::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Status;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    fn start(config: ServerConfig) -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<usize>) {
        start_with(config, Connection::process)
    }

    fn start_with(
        config: ServerConfig,
        step: Step,
    ) -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<usize>) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = syscalls::create_listen_socket(addr, 16).unwrap();
        let local = syscalls::local_addr(&listener).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(ServerMetrics::new());
        let mut reactor =
            Reactor::with_step(listener, &config, metrics, Arc::clone(&shutdown), step).unwrap();
        let handle = thread::spawn(move || {
            reactor.run().unwrap();
            reactor.active_connections()
        });
        (local, shutdown, handle)
    }

    fn config_for(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            doc_root: dir.path().to_path_buf(),
            max_path_len: 4096,
            workers: 2,
            poll_timeout_ms: 20,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_busy_rejection_when_table_full() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig { max_connections: 1, ..config_for(&dir) };
        let (addr, shutdown, handle) = start(config);

        let _first = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reply = String::new();
        second.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, BUSY_TEXT);

        shutdown.store(true, Ordering::Release);
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_peer_close_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig { max_connections: 1, ..config_for(&dir) };
        let (addr, shutdown, handle) = start(config);

        let first = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(first);
        thread::sleep(Duration::from_millis(100));

        let mut second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        second.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
        let mut reply = String::new();
        second.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", reply);

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_closes_idle_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, shutdown, handle) = start(config_for(&dir));

        let mut idle = TcpStream::connect(addr).unwrap();
        idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        thread::sleep(Duration::from_millis(50));

        shutdown.store(true, Ordering::Release);
        assert_eq!(handle.join().unwrap(), 0);

        let mut rest = Vec::new();
        idle.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    static GATE: AtomicBool = AtomicBool::new(false);

    fn gated_process(conn: &mut Connection, root: &DocumentRoot) -> Interest {
        while !GATE.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }
        conn.process(root)
    }

    fn request(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
        stream
    }

    #[test]
    fn test_full_request_queue_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            workers: 1,
            max_queued_requests: 1,
            ..config_for(&dir)
        };
        let (addr, shutdown, handle) = start_with(config, gated_process);

        // The first request holds the only worker, the second fills the queue.
        let mut first = request(addr);
        thread::sleep(Duration::from_millis(100));
        let mut second = request(addr);
        thread::sleep(Duration::from_millis(100));

        let mut overflow = request(addr);
        let mut rest = Vec::new();
        overflow.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty(), "{:?}", String::from_utf8_lossy(&rest));

        GATE.store(true, Ordering::Release);
        for stream in [&mut first, &mut second] {
            let mut reply = String::new();
            stream.read_to_string(&mut reply).unwrap();
            assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", reply);
        }

        shutdown.store(true, Ordering::Release);
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[cfg(feature = "catch-panic")]
    #[test]
    fn test_panicking_step_becomes_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        fs::write(&path, b"<h1>hello</h1>").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let root = DocumentRoot::new(dir.path()).with_max_path_len(4096);

        let (ours, mut peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut conn = Connection::empty();
        conn.open(OwnedFd::from(ours), "127.0.0.1:4000".parse().unwrap());
        peer.write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(matches!(conn.fill().unwrap(), Fill::Drained));

        let interest = run_guarded(&mut conn, |conn| {
            conn.process(&root);
            assert!(conn.has_mapping());
            panic!("failure after the response was staged");
        });

        assert_eq!(interest, Interest::Write);
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.status(), Some(Status::InternalError));
        assert!(!conn.keep_alive());
        assert!(!conn.has_mapping());

        assert!(matches!(conn.drain().unwrap(), Drain::Complete));
        conn.close();
        let mut reply = String::new();
        peer.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 500 "), "{}", reply);
        assert!(reply.contains("Connection: close\r\n"), "{}", reply);
    }

    #[test]
    fn test_failed_worker_rearm_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = syscalls::create_listen_socket(addr, 16).unwrap();
        let metrics = Arc::new(ServerMetrics::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut reactor = Reactor::new(listener, &config_for(&dir), metrics, shutdown).unwrap();

        let (ours, mut peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        reactor.admit(OwnedFd::from(ours), "127.0.0.1:4000".parse().unwrap());
        assert_eq!(reactor.active_connections(), 1);
        let slot = (0..reactor.slab.capacity())
            .find(|&slot| reactor.slab.is_allocated(slot))
            .unwrap();

        peer.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
        let fd = {
            let mut conn = reactor.shared.slots[slot].lock();
            assert!(matches!(conn.fill().unwrap(), Fill::Drained));
            conn.raw_fd().unwrap()
        };

        // Pull the descriptor out from under the worker so its re-arm fails.
        reactor.shared.epoll.delete(fd).unwrap();
        process_slot(&reactor.shared, slot);
        assert_eq!(reactor.active_connections(), 1);

        reactor.reap_orphans();
        assert_eq!(reactor.active_connections(), 0);
        assert_eq!(reactor.shared.slots[slot].lock().state(), ConnState::Free);

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_accept_errors_for_one_peer_keep_draining() {
        for errno in [
            libc::ECONNABORTED,
            libc::EPROTO,
            libc::ENETDOWN,
            libc::EHOSTUNREACH,
            libc::EINTR,
        ] {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(accept_step(&err), AcceptStep::Retry, "{}", err);
        }
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(accept_step(&err), AcceptStep::Stop, "{}", err);
        }
    }
}
