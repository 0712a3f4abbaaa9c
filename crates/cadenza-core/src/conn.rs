// src/conn.rs
use crate::http::{READ_BUF_SIZE, Status, WRITE_BUF_SIZE};
use crate::parser::{ParseVerdict, RequestParser};
use crate::resolver::{DocumentRoot, MappedFile, Resolution};
use crate::response::{Segments, WriteBuf, build_response};
use crate::scanner::ReadBuf;
use crate::syscalls::{self, Interest};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnState {
    /// Slot unused; no socket.
    #[default]
    Free = 0,
    /// Armed for read-readiness, waiting for request bytes.
    Reading = 1,
    /// Handed to a worker for parse + build.
    Processing = 2,
    /// Response staged; armed for write-readiness.
    Writing = 3,
    /// No response could be built; the reactor closes on the next event.
    Closing = 4,
}

/// How a non-blocking fill ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The socket reported would-block.
    Drained,
    /// No room left in the read buffer.
    BufferFull,
    /// Zero-length read: the peer closed its side.
    PeerClosed,
}

/// How a non-blocking drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The socket buffer filled up; wait for write-readiness and resume.
    Blocked,
    /// Every staged byte has been sent.
    Complete,
}

/// One client connection slot.
///
/// A slot is allocated once and recycled: [`Connection::open`] on accept,
/// [`Connection::reset`] between keep-alive requests, [`Connection::close`]
/// when the socket goes away. Only one thread touches a slot at a time; the
/// one-shot epoll registration decides which.
pub struct Connection {
    socket: Option<OwnedFd>,
    peer: Option<SocketAddr>,
    state: ConnState,
    read_buf: ReadBuf,
    write_buf: WriteBuf,
    parser: RequestParser,
    file: Option<MappedFile>,
    send_file: bool,
    bytes_sent: usize,
    keep_alive: bool,
    status: Option<Status>,
    requests_served: u32,
}

impl Connection {
    pub fn empty() -> Self {
        Self::with_capacity(READ_BUF_SIZE, WRITE_BUF_SIZE)
    }

    pub fn with_capacity(read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            socket: None,
            peer: None,
            state: ConnState::Free,
            read_buf: ReadBuf::new(read_capacity),
            write_buf: WriteBuf::new(write_capacity),
            parser: RequestParser::new(),
            file: None,
            send_file: false,
            bytes_sent: 0,
            keep_alive: false,
            status: None,
            requests_served: 0,
        }
    }

    /// Take ownership of a freshly accepted socket.
    pub fn open(&mut self, socket: OwnedFd, peer: SocketAddr) {
        self.clear_request();
        self.socket = Some(socket);
        self.peer = Some(peer);
        self.requests_served = 0;
        self.state = ConnState::Reading;
    }

    /// Prepare for the next request on the same socket.
    pub fn reset(&mut self) {
        self.clear_request();
        self.state = ConnState::Reading;
    }

    /// Release the mapping and the socket. The caller must have removed the
    /// descriptor from epoll first.
    pub fn close(&mut self) {
        self.clear_request();
        self.socket = None;
        self.peer = None;
        self.state = ConnState::Free;
    }

    fn clear_request(&mut self) {
        self.file = None;
        self.send_file = false;
        self.read_buf.clear();
        self.write_buf.clear();
        self.parser.reset();
        self.bytes_sent = 0;
        self.keep_alive = false;
        self.status = None;
    }

    /// Receive until the socket would block, the peer closes, or the buffer
    /// is full. Never blocks.
    pub fn fill(&mut self) -> io::Result<Fill> {
        let fd = self.fd()?;
        loop {
            let tail = self.read_buf.free_tail();
            if tail.is_empty() {
                self.state = ConnState::Processing;
                return Ok(Fill::BufferFull);
            }
            match syscalls::recv_nonblocking(fd, tail)? {
                None => {
                    self.state = ConnState::Processing;
                    return Ok(Fill::Drained);
                }
                Some(0) => return Ok(Fill::PeerClosed),
                Some(n) => self.read_buf.commit(n),
            }
        }
    }

    /// Parse what has been received and, once the request is complete,
    /// resolve the file and stage the response. Runs on a worker thread.
    ///
    /// Returns the readiness the connection must be re-armed for.
    pub fn process(&mut self, root: &DocumentRoot) -> Interest {
        let verdict = self.parser.advance(&mut self.read_buf);
        let mut keep_alive = self.parser.head().keep_alive;

        let status = match verdict {
            ParseVerdict::NeedMoreData if !self.read_buf.is_full() => {
                self.state = ConnState::Reading;
                return Interest::Read;
            }
            ParseVerdict::NeedMoreData => {
                tracing::debug!(peer = ?self.peer, "request exceeds read buffer");
                keep_alive = false;
                Status::BadRequest
            }
            ParseVerdict::BadRequest => Status::BadRequest,
            ParseVerdict::Complete => {
                let url = self.parser.head().url.slice(self.read_buf.bytes());
                match root.resolve(url) {
                    Resolution::File(file) => {
                        self.file = Some(file);
                        Status::Ok
                    }
                    Resolution::BadRequest => Status::BadRequest,
                    Resolution::NotFound => Status::NotFound,
                    Resolution::Forbidden => Status::Forbidden,
                    Resolution::InternalError => Status::InternalError,
                }
            }
        };

        self.respond(status, keep_alive)
    }

    /// Replace whatever was staged with a 500 and drop keep-alive.
    pub fn fail_internal(&mut self) -> Interest {
        self.file = None;
        self.respond(Status::InternalError, false)
    }

    fn respond(&mut self, status: Status, keep_alive: bool) -> Interest {
        self.requests_served += 1;
        self.bytes_sent = 0;
        match build_response(&mut self.write_buf, status, self.file.as_ref(), keep_alive) {
            Ok(send_file) => {
                if !send_file {
                    self.file = None;
                }
                self.send_file = send_file;
                self.keep_alive = keep_alive;
                self.status = Some(status);
                self.state = ConnState::Writing;
            }
            Err(e) => {
                tracing::warn!(peer = ?self.peer, error = %e, "dropping connection");
                self.file = None;
                self.send_file = false;
                self.keep_alive = false;
                self.status = None;
                self.state = ConnState::Closing;
            }
        }
        tracing::debug!(peer = ?self.peer, status = ?self.status, "response staged");
        Interest::Write
    }

    /// Send staged bytes until done or the socket would block. Resumes from
    /// where the previous call stopped. The mapping is released on completion.
    pub fn drain(&mut self) -> io::Result<Drain> {
        let fd = self.fd()?;
        let body = if self.send_file {
            self.file.as_ref().map(MappedFile::bytes)
        } else {
            None
        };
        let segments = Segments::new(self.write_buf.as_bytes(), body);

        while self.bytes_sent < segments.total_len() {
            let slices = segments.remaining(self.bytes_sent);
            match syscalls::sendv_nonblocking(fd, &slices)? {
                None => return Ok(Drain::Blocked),
                Some(0) => return Err(io::ErrorKind::WriteZero.into()),
                Some(n) => self.bytes_sent += n,
            }
        }

        self.file = None;
        self.send_file = false;
        Ok(Drain::Complete)
    }

    fn fd(&self) -> io::Result<RawFd> {
        self.raw_fd()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    #[inline(always)]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    #[inline(always)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline(always)]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the socket stays open once the staged response is sent.
    #[inline(always)]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Status of the staged response, if one was built.
    #[inline(always)]
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    #[inline(always)]
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    #[inline(always)]
    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    #[inline(always)]
    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    #[inline(always)]
    pub fn has_mapping(&self) -> bool {
        self.file.is_some()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::empty()
    }
}
