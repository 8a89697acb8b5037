// src/http.rs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get, Post, Put, Delete, Patch, Head, Options, Trace, Connect, Unknown,
}

impl Method {
    /// Methods are matched case-insensitively.
    pub fn from_bytes(b: &[u8]) -> Self {
        const TABLE: [(&[u8], Method); 9] = [
            (b"GET", Method::Get),
            (b"POST", Method::Post),
            (b"PUT", Method::Put),
            (b"DELETE", Method::Delete),
            (b"PATCH", Method::Patch),
            (b"HEAD", Method::Head),
            (b"OPTIONS", Method::Options),
            (b"TRACE", Method::Trace),
            (b"CONNECT", Method::Connect),
        ];
        TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(b))
            .map(|&(_, m)| m)
            .unwrap_or(Method::Unknown)
    }
}

/// Where the parser is within the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Content,
}

/// Result of scanning for one line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Complete,
    Malformed,
    Incomplete,
}

/// Outcome of reading a request. Everything except `NoRequest` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// More bytes are needed.
    NoRequest,
    FileReady,
    BadRequest,
    NotFound,
    Forbidden,
    InternalError,
}

impl HttpCode {
    pub fn status(self) -> Option<u16> {
        match self {
            HttpCode::FileReady => Some(200),
            HttpCode::BadRequest => Some(400),
            HttpCode::Forbidden => Some(403),
            HttpCode::NotFound => Some(404),
            HttpCode::InternalError => Some(500),
            HttpCode::NoRequest => None,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HttpCode::FileReady => "OK",
            HttpCode::BadRequest => "Bad Request",
            HttpCode::Forbidden => "Forbidden",
            HttpCode::NotFound => "Not Found",
            HttpCode::InternalError => "Internal Error",
            HttpCode::NoRequest => "",
        }
    }

    /// Fixed body for error responses.
    pub fn error_body(self) -> Option<&'static str> {
        match self {
            HttpCode::BadRequest => Some(BAD_REQUEST_BODY),
            HttpCode::Forbidden => Some(FORBIDDEN_BODY),
            HttpCode::NotFound => Some(NOT_FOUND_BODY),
            HttpCode::InternalError => Some(INTERNAL_ERROR_BODY),
            HttpCode::FileReady | HttpCode::NoRequest => None,
        }
    }
}

pub const BAD_REQUEST_BODY: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const FORBIDDEN_BODY: &str = "You do not have permission to get file from this server.\n";
pub const NOT_FOUND_BODY: &str = "The requested file was not found on this server.\n";
pub const INTERNAL_ERROR_BODY: &str = "There was an unusual problem serving the requested file.\n";

/// Body sent for a zero-length file, which cannot be mapped.
pub const EMPTY_FILE_BODY: &str = "it's Empty!";

/// Written to an accepted socket when the connection table is full.
pub const BUSY_BODY: &[u8] = b"Internal server busy";

/// If `line` starts with `name` (case-insensitive), return the value with
/// leading spaces and tabs removed.
pub fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() < name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    Some(trim_start(&line[name.len()..]))
}

pub fn trim_start(b: &[u8]) -> &[u8] {
    let skip = b.iter().take_while(|&&c| c == b' ' || c == b'\t').count();
    &b[skip..]
}

/// Leading decimal digits as a length; anything else counts as zero.
pub fn parse_length(b: &[u8]) -> usize {
    b.iter()
        .take_while(|c| c.is_ascii_digit())
        .fold(0usize, |acc, &c| {
            acc.saturating_mul(10).saturating_add((c - b'0') as usize)
        })
}
