// src/response.rs
use crate::http::{EMPTY_FILE_BODY, Status};
use crate::resolver::MappedFile;
use arrayvec::ArrayVec;
use std::io::IoSlice;

/// The write buffer ran out of room while a response was being composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("response does not fit in the {capacity}-byte write buffer")]
pub struct BuildError {
    pub capacity: usize,
}

/// Fixed-capacity staging area for the status line, headers and any
/// in-buffer body.
pub struct WriteBuf {
    data: Box<[u8]>,
    len: usize,
}

impl WriteBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), BuildError> {
        let end = self.len + bytes.len();
        if end > self.data.len() {
            return Err(BuildError {
                capacity: self.data.len(),
            });
        }
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    pub fn add_status_line(&mut self, status: Status) -> Result<(), BuildError> {
        let mut code = itoa::Buffer::new();
        self.append(b"HTTP/1.1 ")?;
        self.append(code.format(status.code()).as_bytes())?;
        self.append(b" ")?;
        self.append(status.reason().as_bytes())?;
        self.append(b"\r\n")
    }

    pub fn add_content_length(&mut self, len: usize) -> Result<(), BuildError> {
        let mut digits = itoa::Buffer::new();
        self.append(b"Content-Length: ")?;
        self.append(digits.format(len).as_bytes())?;
        self.append(b"\r\n")
    }

    pub fn add_connection(&mut self, keep_alive: bool) -> Result<(), BuildError> {
        if keep_alive {
            self.append(b"Connection: keep-alive\r\n")
        } else {
            self.append(b"Connection: close\r\n")
        }
    }

    pub fn add_blank_line(&mut self) -> Result<(), BuildError> {
        self.append(b"\r\n")
    }

    /// `Content-Length`, `Connection` and the blank line closing the head.
    pub fn add_headers(&mut self, content_len: usize, keep_alive: bool) -> Result<(), BuildError> {
        self.add_content_length(content_len)?;
        self.add_connection(keep_alive)?;
        self.add_blank_line()
    }

    pub fn add_content(&mut self, body: &[u8]) -> Result<(), BuildError> {
        self.append(body)
    }
}

/// Stage a complete response in `buf`.
///
/// For a non-empty file only the head is staged; the body is the mapped
/// file itself and travels as the second segment of [`Segments`]. Returns
/// whether that second segment is part of the response.
pub fn build_response(
    buf: &mut WriteBuf,
    status: Status,
    file: Option<&MappedFile>,
    keep_alive: bool,
) -> Result<bool, BuildError> {
    buf.clear();
    buf.add_status_line(status)?;

    if let Some(text) = status.error_text() {
        buf.add_headers(text.len(), keep_alive)?;
        buf.add_content(text.as_bytes())?;
        return Ok(false);
    }

    match file {
        Some(file) if !file.is_empty() => {
            buf.add_headers(file.len(), keep_alive)?;
            Ok(true)
        }
        _ => {
            buf.add_headers(EMPTY_FILE_BODY.len(), keep_alive)?;
            buf.add_content(EMPTY_FILE_BODY.as_bytes())?;
            Ok(false)
        }
    }
}

/// Scatter/gather view of a staged response: the write buffer, then the
/// mapped file when there is one.
pub struct Segments<'a> {
    head: &'a [u8],
    body: &'a [u8],
}

impl<'a> Segments<'a> {
    pub fn new(head: &'a [u8], body: Option<&'a [u8]>) -> Self {
        Self {
            head,
            body: body.unwrap_or(&[]),
        }
    }

    #[inline(always)]
    pub fn total_len(&self) -> usize {
        self.head.len() + self.body.len()
    }

    /// I/O slices still to send once `sent` bytes have gone out.
    pub fn remaining(&self, sent: usize) -> ArrayVec<IoSlice<'a>, 2> {
        let mut slices = ArrayVec::new();
        if sent < self.head.len() {
            slices.push(IoSlice::new(&self.head[sent..]));
            if !self.body.is_empty() {
                slices.push(IoSlice::new(self.body));
            }
        } else {
            let offset = sent - self.head.len();
            if offset < self.body.len() {
                slices.push(IoSlice::new(&self.body[offset..]));
            }
        }
        slices
    }
}
