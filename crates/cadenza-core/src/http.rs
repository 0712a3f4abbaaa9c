// src/http.rs

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

/// Body sent for a file that exists but is empty.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

/// Sent verbatim to a client accepted while every connection slot is busy.
pub const BUSY_TEXT: &str = "Internal server busy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
}

impl Method {
    /// Case-insensitive method token lookup.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case(b"HEAD") {
            Some(Method::Head)
        } else {
            None
        }
    }
}

/// Every status this server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed body for error statuses. `Ok` has none: its body is a file.
    pub fn error_text(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => {
                Some("Your request has bad syntax or is inherently impossible to satisfy.\n")
            }
            Status::Forbidden => Some("You do not have permission to get file from this server.\n"),
            Status::NotFound => Some("The requested file was not found on this server.\n"),
            Status::InternalError => {
                Some("There was an unusual problem serving the requested file.\n")
            }
        }
    }
}

/// Offset + length into a connection's read buffer.
///
/// Spans never own bytes: they are only meaningful against the buffer they
/// were cut from, and only until that buffer is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    #[inline(always)]
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    #[inline(always)]
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end()]
    }
}

/// What the parser extracted from the request line and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHead {
    pub method: Method,
    pub url: Span,
    pub content_length: usize,
    pub host: Option<Span>,
    /// HTTP/1.1 connections are only kept open on an explicit `Connection: keep-alive`.
    pub keep_alive: bool,
}
