// src/parser.rs
use crate::http::{Method, RequestHead, Span};
use crate::scanner::{LineStatus, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseVerdict {
    NeedMoreData,
    Complete,
    BadRequest,
}

#[derive(Debug)]
struct Malformed;

/// Incremental HTTP/1.1 request parser.
///
/// The parser never copies request bytes: method, URL and headers are
/// recorded as spans into the `ReadBuf` it is driven against. Feeding the
/// same bytes in one chunk or one byte at a time reaches the same verdict.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParseState,
    line_start: usize,
    body_start: usize,
    head: RequestHead,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline(always)]
    pub fn state(&self) -> ParseState {
        self.state
    }

    #[inline(always)]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Offset in the read buffer where the line being parsed started.
    #[inline(always)]
    pub fn line_start(&self) -> usize {
        self.line_start
    }

    /// Consume as much of `buf` as possible.
    ///
    /// `BadRequest` and `Complete` are terminal for the current request;
    /// calling again after `Complete` keeps returning `Complete`.
    pub fn advance(&mut self, buf: &mut ReadBuf) -> ParseVerdict {
        loop {
            match self.state {
                ParseState::Done => return ParseVerdict::Complete,
                ParseState::Body => {
                    if buf.filled() - self.body_start >= self.head.content_length {
                        self.state = ParseState::Done;
                        return ParseVerdict::Complete;
                    }
                    return ParseVerdict::NeedMoreData;
                }
                ParseState::RequestLine | ParseState::Headers => {}
            }

            self.line_start = buf.cursor();
            match buf.scan_line() {
                LineStatus::Incomplete => return ParseVerdict::NeedMoreData,
                LineStatus::Malformed => return ParseVerdict::BadRequest,
                LineStatus::Complete => {}
            }

            // Terminator bytes sit right before the new cursor.
            let line = Span::new(self.line_start, buf.cursor() - 2 - self.line_start);
            let step = match self.state {
                ParseState::RequestLine => self.parse_request_line(buf.bytes(), line),
                ParseState::Headers => self.parse_header(buf.bytes(), line, buf.cursor()),
                ParseState::Body | ParseState::Done => unreachable!("handled above"),
            };
            if step.is_err() {
                return ParseVerdict::BadRequest;
            }
        }
    }

    fn parse_request_line(&mut self, bytes: &[u8], line: Span) -> Result<(), Malformed> {
        let text = line.slice(bytes);

        let method_end = find_blank(text, 0).ok_or(Malformed)?;
        match Method::from_token(&text[..method_end]) {
            Some(Method::Get) => self.head.method = Method::Get,
            _ => return Err(Malformed),
        }

        let url_start = skip_blanks(text, method_end + 1);
        let url_end = find_blank(text, url_start).ok_or(Malformed)?;
        let version_start = skip_blanks(text, url_end + 1);
        if !text[version_start..].eq_ignore_ascii_case(b"HTTP/1.1") {
            return Err(Malformed);
        }

        let mut url = &text[url_start..url_end];
        let mut offset = url_start;
        if url.len() >= 7 && url[..7].eq_ignore_ascii_case(b"http://") {
            let slash = memchr::memchr(b'/', &url[7..]).ok_or(Malformed)?;
            offset += 7 + slash;
            url = &url[7 + slash..];
        }
        if url.first() != Some(&b'/') {
            return Err(Malformed);
        }

        self.head.url = Span::new(line.start + offset, url.len());
        self.state = ParseState::Headers;
        tracing::debug!(url = %String::from_utf8_lossy(url), "request line parsed");
        Ok(())
    }

    fn parse_header(&mut self, bytes: &[u8], line: Span, next: usize) -> Result<(), Malformed> {
        let text = line.slice(bytes);

        if text.is_empty() {
            if self.head.method == Method::Head || self.head.content_length == 0 {
                self.state = ParseState::Done;
            } else {
                self.body_start = next;
                self.state = ParseState::Body;
            }
            return Ok(());
        }

        if let Some(value) = header_value(text, b"Connection:") {
            self.head.keep_alive = text[value..].eq_ignore_ascii_case(b"keep-alive");
        } else if let Some(value) = header_value(text, b"Content-Length:") {
            self.head.content_length = parse_length(&text[value..]).ok_or(Malformed)?;
        } else if let Some(value) = header_value(text, b"Host:") {
            self.head.host = Some(Span::new(line.start + value, text.len() - value));
        } else {
            tracing::debug!(header = %String::from_utf8_lossy(text), "ignoring unknown header");
        }
        Ok(())
    }
}

#[inline(always)]
fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn find_blank(text: &[u8], from: usize) -> Option<usize> {
    text[from..].iter().position(|&b| is_blank(b)).map(|i| from + i)
}

fn skip_blanks(text: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < text.len() && is_blank(text[i]) {
        i += 1;
    }
    i
}

/// Offset of the value if `text` starts with `name` (case-insensitive).
fn header_value(text: &[u8], name: &[u8]) -> Option<usize> {
    if text.len() >= name.len() && text[..name.len()].eq_ignore_ascii_case(name) {
        Some(skip_blanks(text, name.len()))
    } else {
        None
    }
}

fn parse_length(value: &[u8]) -> Option<usize> {
    let digits = match value.iter().rposition(|&b| !is_blank(b)) {
        Some(last) => &value[..=last],
        None => return None,
    };
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
