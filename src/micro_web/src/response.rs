// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{Error as WriteError, Write};

use crate::common::ascii::{COLON, CR, LF, SP};
use crate::common::codec::html_escape;
use crate::common::{Body, Version};

/// The product token reported in the `Server` response header.
pub const SERVER_NAME: &str = "micro_web";

/// Wrapper over a response status code, per RFC 7231 §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    /// 100, Continue
    Continue,
    /// 200, OK
    OK,
    /// 201, Created
    Created,
    /// 204, No Content
    NoContent,
    /// 301, Moved Permanently
    MovedPermanently,
    /// 302, Found
    Found,
    /// 304, Not Modified
    NotModified,
    /// 400, Bad Request
    BadRequest,
    /// 401, Unauthorized
    Unauthorized,
    /// 403, Forbidden
    Forbidden,
    /// 404, Not Found
    NotFound,
    /// 405, Method Not Allowed
    MethodNotAllowed,
    /// 408, Request Timeout
    RequestTimeout,
    /// 413, Payload Too Large
    PayloadTooLarge,
    /// 500, Internal Server Error
    InternalServerError,
    /// 501, Not Implemented
    NotImplemented,
    /// 503, Service Unavailable
    ServiceUnavailable,
}

impl StatusCode {
    /// Returns the status code as bytes.
    pub fn raw(self) -> &'static [u8; 3] {
        match self {
            Self::Continue => b"100",
            Self::OK => b"200",
            Self::Created => b"201",
            Self::NoContent => b"204",
            Self::MovedPermanently => b"301",
            Self::Found => b"302",
            Self::NotModified => b"304",
            Self::BadRequest => b"400",
            Self::Unauthorized => b"401",
            Self::Forbidden => b"403",
            Self::NotFound => b"404",
            Self::MethodNotAllowed => b"405",
            Self::RequestTimeout => b"408",
            Self::PayloadTooLarge => b"413",
            Self::InternalServerError => b"500",
            Self::NotImplemented => b"501",
            Self::ServiceUnavailable => b"503",
        }
    }

    /// Returns the status code as a number.
    pub fn code(self) -> u16 {
        match self {
            Self::Continue => 100,
            Self::OK => 200,
            Self::Created => 201,
            Self::NoContent => 204,
            Self::MovedPermanently => 301,
            Self::Found => 302,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::RequestTimeout => 408,
            Self::PayloadTooLarge => 413,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Returns the reason phrase for the status code.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Continue => "Continue",
            Self::OK => "OK",
            Self::Created => "Created",
            Self::NoContent => "No Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::RequestTimeout => "Request Timeout",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// Maps a numeric code onto a `StatusCode`. Unknown codes fall back to
    /// 500, which is the honest answer for a code we cannot produce.
    pub fn from_code(code: u16) -> Self {
        match code {
            100 => Self::Continue,
            200 => Self::OK,
            201 => Self::Created,
            204 => Self::NoContent,
            301 => Self::MovedPermanently,
            302 => Self::Found,
            304 => Self::NotModified,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            405 => Self::MethodNotAllowed,
            408 => Self::RequestTimeout,
            413 => Self::PayloadTooLarge,
            501 => Self::NotImplemented,
            503 => Self::ServiceUnavailable,
            _ => Self::InternalServerError,
        }
    }
}

struct StatusLine {
    http_version: Version,
    status_code: StatusCode,
}

impl StatusLine {
    fn new(http_version: Version, status_code: StatusCode) -> Self {
        Self {
            http_version,
            status_code,
        }
    }

    fn write_all<T: Write>(&self, mut buf: T) -> Result<(), WriteError> {
        buf.write_all(self.http_version.raw())?;
        buf.write_all(&[SP])?;
        buf.write_all(self.status_code.raw())?;
        buf.write_all(&[SP])?;
        buf.write_all(self.status_code.reason().as_bytes())?;
        buf.write_all(&[CR, LF])?;
        Ok(())
    }
}

/// The headers attached to an HTTP response.
///
/// `Server`, `Date` and the `Connection` disposition are always written;
/// the remaining fields are written when set.
pub struct ResponseHeaders {
    content_length: Option<u64>,
    content_type: Option<String>,
    server: String,
    close: bool,
    chunked: bool,
    last_modified: Option<i64>,
    location: Option<String>,
    www_authenticate: Option<String>,
    set_cookie: Option<String>,
    extra: Vec<(String, String)>,
}

impl Default for ResponseHeaders {
    fn default() -> Self {
        Self {
            content_length: None,
            content_type: None,
            server: String::from(SERVER_NAME),
            close: false,
            chunked: false,
            last_modified: None,
            location: None,
            www_authenticate: None,
            set_cookie: None,
            extra: Vec::new(),
        }
    }
}

impl ResponseHeaders {
    fn write_one<T: Write>(buf: &mut T, name: &[u8], value: &[u8]) -> Result<(), WriteError> {
        buf.write_all(name)?;
        buf.write_all(&[COLON, SP])?;
        buf.write_all(value)?;
        buf.write_all(&[CR, LF])
    }

    /// Writes the headers to `buf`, terminated by the blank line.
    pub fn write_all<T: Write>(&self, buf: &mut T) -> Result<(), WriteError> {
        Self::write_one(buf, b"Server", self.server.as_bytes())?;
        Self::write_one(
            buf,
            b"Date",
            utils::time::http_date(utils::time::unix_time()).as_bytes(),
        )?;
        let disposition: &[u8] = if self.close { b"close" } else { b"keep-alive" };
        Self::write_one(buf, b"Connection", disposition)?;

        if let Some(ref location) = self.location {
            Self::write_one(buf, b"Location", location.as_bytes())?;
        }
        if let Some(ref challenge) = self.www_authenticate {
            Self::write_one(buf, b"WWW-Authenticate", challenge.as_bytes())?;
        }
        if let Some(ref cookie) = self.set_cookie {
            Self::write_one(buf, b"Set-Cookie", cookie.as_bytes())?;
        }
        if let Some(mtime) = self.last_modified {
            Self::write_one(buf, b"Last-Modified", utils::time::http_date(mtime).as_bytes())?;
        }
        for (name, value) in &self.extra {
            Self::write_one(buf, name.as_bytes(), value.as_bytes())?;
        }
        if let Some(ref content_type) = self.content_type {
            Self::write_one(buf, b"Content-Type", content_type.as_bytes())?;
        }
        if self.chunked {
            Self::write_one(buf, b"Transfer-Encoding", b"chunked")?;
        } else if let Some(content_length) = self.content_length {
            Self::write_one(
                buf,
                b"Content-Length",
                content_length.to_string().as_bytes(),
            )?;
        }
        buf.write_all(&[CR, LF])
    }

    fn set_content_length(&mut self, content_length: u64) {
        self.content_length = Some(content_length);
    }
}

/// The source of a response body.
pub enum ResponseBody {
    /// No body at all (204, 304, HEAD).
    Empty,
    /// A body already materialized in memory.
    InMemory(Body),
    /// A file streamed by the background writer after the head is written.
    File(FileSource),
}

/// An open file plus the number of bytes still to stream from it.
pub struct FileSource {
    /// The open document.
    pub file: File,
    /// Bytes remaining until EOF accounting says the response is complete.
    pub remaining: u64,
}

/// Wrapper over an HTTP response.
///
/// Created from a `Version` and a `StatusCode`; the body and the optional
/// headers are filled in afterwards. `write_all` emits head and in-memory
/// body; file bodies only emit the head here and leave the payload to the
/// connection's background writer.
pub struct Response {
    status_line: StatusLine,
    /// The response headers.
    pub headers: ResponseHeaders,
    body: ResponseBody,
}

impl Response {
    /// Creates a new HTTP `Response` with an empty body.
    pub fn new(http_version: Version, status_code: StatusCode) -> Self {
        Self {
            status_line: StatusLine::new(http_version, status_code),
            headers: ResponseHeaders::default(),
            body: ResponseBody::Empty,
        }
    }

    /// Updates the body of the `Response`, setting `Content-Length`.
    pub fn set_body(&mut self, body: Body) {
        self.headers.set_content_length(body.len() as u64);
        self.body = ResponseBody::InMemory(body);
    }

    /// Attaches an open file of `len` bytes as the response body. The
    /// payload is streamed by the background writer.
    pub fn set_file(&mut self, file: File, len: u64) {
        self.headers.set_content_length(len);
        self.body = ResponseBody::File(FileSource {
            file,
            remaining: len,
        });
    }

    /// Announces a body of `len` bytes without attaching one, for HEAD
    /// responses.
    pub fn set_content_length_only(&mut self, len: u64) {
        self.headers.set_content_length(len);
    }

    /// Updates the content type of the `Response`.
    pub fn set_content_type<T: Into<String>>(&mut self, content_type: T) {
        self.headers.content_type = Some(content_type.into());
    }

    /// Sets the `Connection` disposition of the response.
    pub fn set_close(&mut self, close: bool) {
        self.headers.close = close;
    }

    /// Returns `true` when the response announces `Connection: close`.
    pub fn close(&self) -> bool {
        self.headers.close
    }

    /// Sets the `Location` header.
    pub fn set_location<T: Into<String>>(&mut self, location: T) {
        self.headers.location = Some(location.into());
    }

    /// Sets the `WWW-Authenticate` challenge.
    pub fn set_www_authenticate<T: Into<String>>(&mut self, challenge: T) {
        self.headers.www_authenticate = Some(challenge.into());
    }

    /// Sets the `Set-Cookie` header.
    pub fn set_cookie<T: Into<String>>(&mut self, cookie: T) {
        self.headers.set_cookie = Some(cookie.into());
    }

    /// Sets the `Last-Modified` header from Unix seconds.
    pub fn set_last_modified(&mut self, mtime: i64) {
        self.headers.last_modified = Some(mtime);
    }

    /// Appends an uninterpreted header line.
    pub fn add_header<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.headers.extra.push((name.into(), value.into()));
    }

    /// Marks the response as chunk-encoded; `Content-Length` is then
    /// omitted from the head.
    pub fn set_chunked(&mut self) {
        self.headers.chunked = true;
    }

    /// Writes the status line and headers to `buf`.
    pub fn write_head<T: Write>(&self, buf: &mut T) -> Result<(), WriteError> {
        self.status_line.write_all(&mut *buf)?;
        self.headers.write_all(buf)
    }

    /// Writes the head and any in-memory body to `buf`. A file body is not
    /// written here; the caller takes it via `take_file_source`.
    pub fn write_all<T: Write>(&self, buf: &mut T) -> Result<(), WriteError> {
        self.write_head(buf)?;
        if let ResponseBody::InMemory(ref body) = self.body {
            buf.write_all(body.raw())?;
        }
        Ok(())
    }

    /// Detaches the file source, if this response streams a file.
    pub fn take_file_source(&mut self) -> Option<FileSource> {
        match std::mem::replace(&mut self.body, ResponseBody::Empty) {
            ResponseBody::File(source) => Some(source),
            other => {
                self.body = other;
                None
            }
        }
    }

    /// Returns the status code of the response.
    pub fn status(&self) -> StatusCode {
        self.status_line.status_code
    }

    /// Returns the HTTP version of the response.
    pub fn http_version(&self) -> Version {
        self.status_line.http_version
    }

    /// Returns the announced content length, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.content_length
    }
}

/// Builds the minimal HTML error body used by the `error` helper.
pub fn error_body(status: StatusCode, message: &str) -> Body {
    let reason = status.reason();
    let escaped = html_escape(message);
    Body::new(format!(
        "<html><head><title>Document Error: {reason}</title></head>\
         <body><h2>Access Error: {} {reason}</h2><p>{escaped}</p></body></html>",
        status.code(),
    ))
}

/// Builds a complete error response with the standard HTML body.
pub fn error_response(version: Version, status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(version, status);
    response.set_content_type("text/html");
    response.set_body(error_body(status, message));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_to_string(response: &Response) -> String {
        let mut buf = Vec::new();
        response.write_all(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::OK.raw(), b"200");
        assert_eq!(StatusCode::NotModified.raw(), b"304");
        assert_eq!(StatusCode::Unauthorized.raw(), b"401");
        assert_eq!(StatusCode::PayloadTooLarge.code(), 413);
        assert_eq!(StatusCode::from_code(404), StatusCode::NotFound);
        assert_eq!(StatusCode::from_code(999), StatusCode::InternalServerError);
        assert_eq!(StatusCode::RequestTimeout.reason(), "Request Timeout");
    }

    #[test]
    fn test_write_response_with_body() {
        let mut response = Response::new(Version::Http11, StatusCode::OK);
        response.set_content_type("text/plain");
        response.set_body(Body::new("This is a test"));

        let text = write_to_string(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: micro_web\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 14\r\n"));
        assert!(text.ends_with("\r\n\r\nThis is a test"));
    }

    #[test]
    fn test_write_response_close_and_location() {
        let mut response = Response::new(Version::Http10, StatusCode::Found);
        response.set_close(true);
        response.set_location("/login.html");

        let text = write_to_string(&response);
        assert!(text.starts_with("HTTP/1.0 302 Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Location: /login.html\r\n"));
        // No body was set, so no Content-Length is announced.
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_challenge_and_cookie_headers() {
        let mut response = Response::new(Version::Http11, StatusCode::Unauthorized);
        response.set_www_authenticate("Basic realm=\"site\"");
        response.set_cookie("-goahead-session-=abc; Path=/; HttpOnly");
        let text = write_to_string(&response);
        assert!(text.contains("WWW-Authenticate: Basic realm=\"site\"\r\n"));
        assert!(text.contains("Set-Cookie: -goahead-session-=abc; Path=/; HttpOnly\r\n"));
    }

    #[test]
    fn test_chunked_omits_content_length() {
        let mut response = Response::new(Version::Http11, StatusCode::OK);
        response.set_content_length_only(10);
        response.set_chunked();
        let text = write_to_string(&response);
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_last_modified_format() {
        let mut response = Response::new(Version::Http11, StatusCode::OK);
        response.set_last_modified(784_111_777);
        let text = write_to_string(&response);
        assert!(text.contains("Last-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\n"));
    }

    #[test]
    fn test_file_source_detach() {
        let temp = utils::tempfile::TempFile::new().unwrap();
        let file = std::fs::File::open(temp.as_path()).unwrap();
        let mut response = Response::new(Version::Http11, StatusCode::OK);
        response.set_file(file, 0);
        assert_eq!(response.content_length(), Some(0));
        assert!(response.take_file_source().is_some());
        assert!(response.take_file_source().is_none());
    }

    #[test]
    fn test_error_response_body() {
        let response = error_response(Version::Http11, StatusCode::NotFound, "no <such> page");
        let text = write_to_string(&response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Access Error: 404 Not Found"));
        assert!(text.contains("no &lt;such&gt; page"));
    }
}
