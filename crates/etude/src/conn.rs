// src/conn.rs
//! Per-connection request parser and response builder.
//!
//! A `Conn` is resumable: every readiness cycle appends bytes to the read
//! buffer and `process` picks the state machine up where it stopped. Parsed
//! fields are kept as spans into the read buffer.

use crate::error::ConnError;
use crate::http::{
    self, CheckState, EMPTY_FILE_BODY, HttpCode, LineStatus, Method, header_value, parse_length,
};
use crate::mapped::MappedFile;
use crate::syscalls::Interest;
use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Cursor, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info, trace};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 2048;
/// Capacity of the resolved file path, including a terminator byte.
pub const FILENAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn get(self, buf: &[u8]) -> &[u8] {
        &buf[self.start..self.end]
    }
}

/// How far a flush got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The socket would block; wait for write readiness.
    Pending,
    /// The whole response went out.
    Done { keep_alive: bool },
    /// Nothing was queued.
    Idle,
}

enum Step {
    More,
    Complete,
    Bad,
}

pub struct Conn {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,

    read_buf: Vec<u8>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
    line: Span,
    check_state: CheckState,

    method: Method,
    url: Span,
    version: Span,
    host: Span,
    content_length: usize,
    keep_alive: bool,

    write_buf: Vec<u8>,
    write_idx: usize,
    file: Option<MappedFile>,
    file_size: usize,
    iv_count: usize,
    bytes_sent: usize,
    bytes_to_send: usize,
}

impl Conn {
    /// A vacant slot. Buffers are allocated on first use.
    pub fn empty() -> Self {
        Self {
            stream: None,
            peer: None,
            read_buf: Vec::new(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            line: Span::default(),
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: Span::default(),
            version: Span::default(),
            host: Span::default(),
            content_length: 0,
            keep_alive: false,
            write_buf: Vec::new(),
            write_idx: 0,
            file: None,
            file_size: 0,
            iv_count: 0,
            bytes_sent: 0,
            bytes_to_send: 0,
        }
    }

    /// Attach a freshly accepted socket and reset all request state.
    pub fn init(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.ensure_buffers();
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.reset_request();
    }

    fn ensure_buffers(&mut self) {
        if self.read_buf.len() != READ_BUF_SIZE {
            self.read_buf = vec![0; READ_BUF_SIZE];
        }
        if self.write_buf.len() != WRITE_BUF_SIZE {
            self.write_buf = vec![0; WRITE_BUF_SIZE];
        }
    }

    /// Prepare for the next request on the same socket.
    pub fn reset_request(&mut self) {
        self.read_buf.fill(0);
        self.write_buf.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.line = Span::default();
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url = Span::default();
        self.version = Span::default();
        self.host = Span::default();
        self.content_length = 0;
        self.keep_alive = false;
        self.write_idx = 0;
        self.file = None;
        self.file_size = 0;
        self.iv_count = 0;
        self.bytes_sent = 0;
        self.bytes_to_send = 0;
    }

    /// Detach and drop the socket, returning the slot to its vacant state.
    pub fn close(&mut self) {
        self.stream = None;
        self.peer = None;
        self.reset_request();
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn check_state(&self) -> CheckState {
        self.check_state
    }

    pub fn url(&self) -> &[u8] {
        self.url.get(&self.read_buf)
    }

    pub fn version(&self) -> &[u8] {
        self.version.get(&self.read_buf)
    }

    pub fn host(&self) -> &[u8] {
        self.host.get(&self.read_buf)
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Status line and headers built so far.
    pub fn response_head(&self) -> &[u8] {
        &self.write_buf[..self.write_idx]
    }

    // ---- Socket I/O ----

    /// Drain the socket into the read buffer until it would block.
    pub fn read(&mut self) -> Result<usize, ConnError> {
        let mut stream = self.stream.take().ok_or(ConnError::NotConnected)?;
        let res = self.read_from(&mut stream);
        self.stream = Some(stream);
        res
    }

    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<usize, ConnError> {
        if self.read_idx >= self.read_buf.len() {
            return Err(ConnError::ReadBufferFull);
        }
        let mut total = 0;
        while self.read_idx < self.read_buf.len() {
            match src.read(&mut self.read_buf[self.read_idx..]) {
                Ok(0) => return Err(ConnError::PeerClosed),
                Ok(n) => {
                    self.read_idx += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Flush the header buffer and mapped body with vectored writes.
    pub fn write(&mut self) -> Result<Flush, ConnError> {
        let mut stream = self.stream.take().ok_or(ConnError::NotConnected)?;
        let res = self.write_to(&mut stream);
        self.stream = Some(stream);
        res
    }

    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<Flush, ConnError> {
        if self.bytes_to_send == 0 {
            self.reset_request();
            return Ok(Flush::Idle);
        }

        loop {
            let head_len = self.write_idx;
            let body: &[u8] = match (&self.file, self.iv_count) {
                (Some(file), 2) => file.as_slice(),
                _ => &[],
            };
            let (head, body) = if self.bytes_sent < head_len {
                (&self.write_buf[self.bytes_sent..head_len], body)
            } else {
                (&[][..], &body[self.bytes_sent - head_len..])
            };

            let res = dst.write_vectored(&[IoSlice::new(head), IoSlice::new(body)]);
            match res {
                Ok(0) => {
                    self.file = None;
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    if self.bytes_sent >= self.bytes_to_send {
                        let keep_alive = self.keep_alive;
                        self.file = None;
                        if keep_alive {
                            self.reset_request();
                        }
                        return Ok(Flush::Done { keep_alive });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.file = None;
                    return Err(e.into());
                }
            }
        }
    }

    // ---- Request processing ----

    /// Advance the parser over buffered bytes and, once a request is complete,
    /// build its response. Returns the interest to re-arm, or `None` to close.
    pub fn process(&mut self, doc_root: &Path) -> Option<Interest> {
        let code = self.process_read(doc_root);
        if code == HttpCode::NoRequest {
            return Some(Interest::Read);
        }
        match self.process_write(code) {
            Ok(()) => Some(Interest::Write),
            Err(e) => {
                debug!(peer = ?self.peer, "failed to build response: {}", e);
                None
            }
        }
    }

    fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            match self.read_buf[self.checked_idx] {
                b'\r' => {
                    if self.checked_idx + 1 == self.read_idx {
                        return LineStatus::Incomplete;
                    }
                    if self.read_buf[self.checked_idx + 1] != b'\n' {
                        return LineStatus::Malformed;
                    }
                    self.line = Span { start: self.start_line, end: self.checked_idx };
                    self.checked_idx += 2;
                    return LineStatus::Complete;
                }
                b'\n' => {
                    self.line = Span { start: self.start_line, end: self.checked_idx };
                    self.checked_idx += 1;
                    return LineStatus::Complete;
                }
                _ => self.checked_idx += 1,
            }
        }
        LineStatus::Incomplete
    }

    fn process_read(&mut self, doc_root: &Path) -> HttpCode {
        loop {
            if self.check_state == CheckState::Content {
                let body_end = self.checked_idx.saturating_add(self.content_length);
                if self.read_idx >= body_end {
                    return self.do_request(doc_root);
                }
                return HttpCode::NoRequest;
            }

            match self.parse_line() {
                LineStatus::Complete => {}
                LineStatus::Incomplete => return HttpCode::NoRequest,
                LineStatus::Malformed => return HttpCode::BadRequest,
            }
            let line = self.line;
            self.start_line = self.checked_idx;

            let step = match self.check_state {
                CheckState::RequestLine => self.parse_request_line(line),
                _ => self.parse_header(line),
            };
            match step {
                Step::More => continue,
                Step::Complete => return self.do_request(doc_root),
                Step::Bad => return HttpCode::BadRequest,
            }
        }
    }

    fn parse_request_line(&mut self, line: Span) -> Step {
        let text = line.get(&self.read_buf);
        info!(peer = ?self.peer, "{}", String::from_utf8_lossy(text));

        let is_ws = |c: &u8| *c == b' ' || *c == b'\t';
        let Some(method_end) = text.iter().position(is_ws) else {
            return Step::Bad;
        };
        let method = Method::from_bytes(&text[..method_end]);
        if method != Method::Get {
            return Step::Bad;
        }

        let url_start = text.len() - http::trim_start(&text[method_end..]).len();
        let Some(url_len) = text[url_start..].iter().position(is_ws) else {
            return Step::Bad;
        };
        let url_end = url_start + url_len;
        let version_start = text.len() - http::trim_start(&text[url_end..]).len();

        if !text[version_start..].eq_ignore_ascii_case(b"HTTP/1.1") {
            return Step::Bad;
        }

        let mut target_start = url_start;
        let target = &text[target_start..url_end];
        if target.len() >= 7 && target[..7].eq_ignore_ascii_case(b"http://") {
            target_start += 7;
            match text[target_start..url_end].iter().position(|&c| c == b'/') {
                Some(slash) => target_start += slash,
                None => return Step::Bad,
            }
        }
        if text.get(target_start) != Some(&b'/') || target_start >= url_end {
            return Step::Bad;
        }

        self.method = method;
        self.url = Span { start: line.start + target_start, end: line.start + url_end };
        self.version = Span { start: line.start + version_start, end: line.end };
        self.check_state = CheckState::Headers;
        Step::More
    }

    fn parse_header(&mut self, line: Span) -> Step {
        let text = line.get(&self.read_buf);
        if text.is_empty() {
            if self.content_length != 0 {
                self.check_state = CheckState::Content;
                return Step::More;
            }
            return Step::Complete;
        }

        if let Some(value) = header_value(text, b"Connection:") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if let Some(value) = header_value(text, b"Content-Length:") {
            self.content_length = parse_length(value);
        } else if let Some(value) = header_value(text, b"Host:") {
            self.host = Span { start: line.end - value.len(), end: line.end };
        } else {
            trace!("ignoring header {}", String::from_utf8_lossy(text));
        }
        Step::More
    }

    fn do_request(&mut self, doc_root: &Path) -> HttpCode {
        let mut real_file = doc_root.as_os_str().as_bytes().to_vec();
        real_file.extend_from_slice(self.url.get(&self.read_buf));
        real_file.truncate(FILENAME_LEN - 1);
        let path = Path::new(OsStr::from_bytes(&real_file));

        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return HttpCode::NotFound,
        };
        if meta.permissions().mode() & (libc::S_IROTH as u32) == 0 {
            return HttpCode::Forbidden;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %path.display(), "open failed: {}", e);
                return HttpCode::InternalError;
            }
        };
        self.file_size = meta.len() as usize;
        if self.file_size > 0 {
            match MappedFile::map(&file, self.file_size) {
                Ok(mapped) => self.file = Some(mapped),
                Err(e) => {
                    debug!(path = %path.display(), "mmap failed: {}", e);
                    self.file_size = 0;
                    return HttpCode::InternalError;
                }
            }
        }
        HttpCode::FileReady
    }

    fn process_write(&mut self, code: HttpCode) -> Result<(), ConnError> {
        let status = code.status().ok_or(ConnError::ResponseOverflow)?;
        self.add_status_line(status, code.reason())?;

        if code == HttpCode::FileReady && self.file.is_some() {
            self.add_headers(self.file_size)?;
            self.iv_count = 2;
            self.bytes_to_send = self.write_idx + self.file_size;
            return Ok(());
        }

        let body = code.error_body().unwrap_or(EMPTY_FILE_BODY);
        self.add_headers(body.len())?;
        self.add_response(format_args!("{}", body))?;
        self.iv_count = 1;
        self.bytes_to_send = self.write_idx;
        Ok(())
    }

    /// Format into the unused part of the write buffer. Refuses, without
    /// advancing, anything that would not leave room for a terminator byte.
    pub fn add_response(&mut self, args: fmt::Arguments<'_>) -> Result<(), ConnError> {
        let limit = WRITE_BUF_SIZE - 1;
        if self.write_idx >= limit {
            return Err(ConnError::ResponseOverflow);
        }
        let remaining = limit - self.write_idx;
        let mut cursor = Cursor::new(&mut self.write_buf[self.write_idx..limit]);
        if cursor.write_fmt(args).is_err() {
            return Err(ConnError::ResponseOverflow);
        }
        let written = cursor.position() as usize;
        if written >= remaining {
            return Err(ConnError::ResponseOverflow);
        }
        self.write_idx += written;
        Ok(())
    }

    fn add_status_line(&mut self, status: u16, reason: &str) -> Result<(), ConnError> {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, reason))
    }

    fn add_headers(&mut self, content_len: usize) -> Result<(), ConnError> {
        self.add_response(format_args!("Content-Length: {}\r\n", content_len))?;
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(format_args!("Connection: {}\r\n", connection))?;
        self.add_response(format_args!("\r\n"))
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::empty()
    }
}
