// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::{Read, Seek, SeekFrom, Write};

use crate::buffer::IoBuffer;
use crate::common::ascii::{CR, CRLF_LEN, LF};
use crate::common::{Body, HttpHeaderError, RequestError, Version};
pub use crate::common::ConnectionError;
use crate::request::{find, Request, RequestLine};
use crate::response::{FileSource, Response, StatusCode};

/// Bytes read from the stream per `try_read` pass.
const READ_CHUNK: usize = 1024;
/// Bytes moved from the response source to the socket per background
/// writer turn.
const WRITER_CHUNK: usize = 4096;

/// Size limits enforced while parsing a request.
#[derive(Clone, Debug)]
pub struct HttpLimits {
    /// Maximum length of the request line or any header line.
    pub max_line_len: usize,
    /// Maximum request body size, declared or accumulated (chunked).
    pub max_body_len: u32,
    /// Ceiling for buffered response bytes.
    pub write_buffer_ceiling: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_line_len: 1024,
            max_body_len: 64 * 1024,
            write_buffer_ceiling: 256 * 1024,
        }
    }
}

/// Describes the state machine of an HTTP connection.
///
/// The chunk states are sub-states of the body phase, entered when the
/// request announced `Transfer-Encoding: chunked`.
#[derive(Debug, PartialEq, Eq)]
enum ConnectionState {
    WaitingForRequestLine,
    WaitingForHeaders,
    WaitingForBody,
    WaitingForChunkSize,
    WaitingForChunkData(u32),
    WaitingForChunkDataEnd,
    WaitingForChunkTrailer,
    RequestReady,
}

/// Progress report of a background writer turn.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteProgress {
    /// The source has more bytes to deliver; call again on writability.
    Pending,
    /// The source is exhausted and the response body is fully sent.
    Complete,
}

/// A deferred body producer invoked from the event loop whenever the
/// socket is writable and no buffered response bytes remain.
pub trait BackgroundWrite {
    /// Moves some bytes from the source to `stream`, with partial-write
    /// accounting. A `WouldBlock` from the stream is reported as
    /// `Pending`, never as an error.
    fn write_some(&mut self, stream: &mut dyn Write) -> std::io::Result<WriteProgress>;
}

impl BackgroundWrite for FileSource {
    fn write_some(&mut self, stream: &mut dyn Write) -> std::io::Result<WriteProgress> {
        let mut chunk = [0u8; WRITER_CHUNK];
        while self.remaining > 0 {
            let want = (self.remaining as usize).min(WRITER_CHUNK);
            let got = self.file.read(&mut chunk[..want])?;
            if got == 0 {
                // The file shrank underneath us; there is nothing more to
                // send, so account the response as complete.
                self.remaining = 0;
                break;
            }
            let written = match stream.write(&chunk[..got]) {
                Ok(written) => written,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e),
            };
            self.remaining -= written as u64;
            if written < got {
                // Seek the source back over the undrained tail and retry
                // when the socket drains.
                self.file
                    .seek(SeekFrom::Current(-((got - written) as i64)))?;
                return Ok(WriteProgress::Pending);
            }
        }
        Ok(WriteProgress::Complete)
    }
}

/// A wrapper over an HTTP connection.
///
/// Reads from a non-blocking stream into a cursor buffer, advances the
/// request state machine as bytes become available, and drains queued
/// response bytes (then the background writer, if one is installed) on
/// writability. At most one parsed request is held at a time; further
/// pipelined bytes stay buffered until the current request completes.
pub struct HttpConnection<T> {
    /// Stream implementing `Read` and `Write`.
    stream: T,
    /// The state of the request currently being received.
    state: ConnectionState,
    /// Buffered bytes not yet consumed by the parser.
    read_buf: IoBuffer,
    /// Buffered response bytes not yet accepted by the socket.
    write_buf: IoBuffer,
    /// A partial request that is still being received.
    pending_request: Option<Request>,
    /// Body bytes still to be read in the content-length framing.
    body_bytes_to_be_read: u32,
    /// Body bytes accumulated so far.
    body_vec: Vec<u8>,
    /// The fully received request waiting to be dispatched.
    parsed_request: Option<Request>,
    /// The deferred body producer, at most one per request.
    background: Option<Box<dyn BackgroundWrite>>,
    /// Set when the enqueued response asked for `Connection: close`.
    close_after_write: bool,
    /// Version of the most recent request, used for interim and error
    /// responses.
    version: Version,
    limits: HttpLimits,
}

impl<T: Read + Write> HttpConnection<T> {
    /// Creates an empty connection over `stream`.
    pub fn new(stream: T, limits: HttpLimits) -> Self {
        // The read buffer must hold one full line plus a read chunk.
        let read_ceiling = limits.max_line_len + READ_CHUNK;
        let write_ceiling = limits.write_buffer_ceiling;
        Self {
            stream,
            state: ConnectionState::WaitingForRequestLine,
            read_buf: IoBuffer::new(READ_CHUNK, read_ceiling),
            write_buf: IoBuffer::new(0, write_ceiling),
            pending_request: None,
            body_bytes_to_be_read: 0,
            body_vec: vec![],
            parsed_request: None,
            background: None,
            close_after_write: false,
            version: Version::default(),
            limits,
        }
    }

    /// Reads new bytes from the stream and advances the request state
    /// machine. Meant for non-blocking streams; call on every `EPOLLIN`.
    ///
    /// # Errors
    /// `StreamError` when an IO operation fails, `ConnectionClosed` when
    /// the peer closed the stream, `ParseError` when the bytes received do
    /// not form a valid request.
    pub fn try_read(&mut self) -> Result<(), ConnectionError> {
        match self.read_buf.fill_from(&mut self.stream, READ_CHUNK) {
            // A read of zero bytes means the client closed the connection.
            Ok(0) => return Err(ConnectionError::ConnectionClosed),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // Buffer at its ceiling: parse what is there; the parser raises
            // the size error if it cannot make progress either.
            Err(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {}
            Err(e) => return Err(ConnectionError::StreamError(e)),
        }
        self.parse_buffered()
    }

    /// Advances the state machine over already-buffered bytes. Called after
    /// a request completes, to pick up a pipelined successor that arrived
    /// in the same read.
    pub fn parse_buffered(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Hold while a parsed request awaits dispatch: within one
            // connection the next request is not parsed until the current
            // one completes.
            if self.parsed_request.is_some() {
                return Ok(());
            }
            let progressed = match self.state {
                ConnectionState::WaitingForRequestLine => self.parse_request_line()?,
                ConnectionState::WaitingForHeaders => self.parse_headers()?,
                ConnectionState::WaitingForBody => self.parse_body()?,
                ConnectionState::WaitingForChunkSize => self.parse_chunk_size()?,
                ConnectionState::WaitingForChunkData(remaining) => {
                    self.parse_chunk_data(remaining)?
                }
                ConnectionState::WaitingForChunkDataEnd => self.parse_chunk_data_end()?,
                ConnectionState::WaitingForChunkTrailer => self.parse_chunk_trailer()?,
                ConnectionState::RequestReady => {
                    // Reset the state machine for the next request and hand
                    // the finished one over.
                    self.state = ConnectionState::WaitingForRequestLine;
                    self.body_bytes_to_be_read = 0;
                    self.parsed_request = self.pending_request.take();
                    true
                }
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    // Takes one CRLF-terminated line out of the read buffer. `None` means
    // more bytes are needed; a line longer than the limit is an error.
    fn take_line(&mut self) -> Result<Option<Vec<u8>>, RequestError> {
        match find(self.read_buf.unread(), &[CR, LF]) {
            Some(line_end) => {
                let line = self.read_buf.unread()[..line_end].to_vec();
                self.read_buf.consume(line_end + CRLF_LEN);
                Ok(Some(line))
            }
            None => {
                if self.read_buf.len() > self.limits.max_line_len {
                    return Err(RequestError::HeaderError(
                        HttpHeaderError::SizeLimitExceeded(self.limits.max_line_len),
                    ));
                }
                Ok(None)
            }
        }
    }

    fn parse_request_line(&mut self) -> Result<bool, ConnectionError> {
        // Tolerate blank lines ahead of the request line.
        while let Some(&byte) = self.read_buf.unread().first() {
            if byte == CR || byte == LF {
                self.read_buf.consume(1);
            } else {
                break;
            }
        }
        match self.take_line().map_err(ConnectionError::ParseError)? {
            Some(line) => {
                let request_line =
                    RequestLine::try_from(&line).map_err(ConnectionError::ParseError)?;
                let request = Request::from_request_line(request_line)
                    .map_err(ConnectionError::ParseError)?;
                self.version = request.http_version();
                self.pending_request = Some(request);
                self.state = ConnectionState::WaitingForHeaders;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn parse_headers(&mut self) -> Result<bool, ConnectionError> {
        let line = match self.take_line().map_err(ConnectionError::ParseError)? {
            Some(line) => line,
            None => return Ok(false),
        };
        let request = self
            .pending_request
            .as_mut()
            .ok_or(ConnectionError::ParseError(RequestError::InvalidRequest))?;

        if !line.is_empty() {
            match request.headers.parse_header_line(&line) {
                // An unsupported value on a non-framing header is ignored.
                Ok(_)
                | Err(RequestError::HeaderError(HttpHeaderError::UnsupportedValue(_, _))) => {}
                Err(e) => return Err(ConnectionError::ParseError(e)),
            }
            return Ok(true);
        }

        // Blank line: the header section is complete.
        let chunked = request.headers.chunked();
        let content_length = request.headers.content_length();
        let expect = request.headers.expect();
        if chunked {
            if expect {
                self.enqueue_interim_continue()?;
            }
            self.body_vec.clear();
            self.state = ConnectionState::WaitingForChunkSize;
        } else if content_length > 0 {
            if content_length > self.limits.max_body_len {
                return Err(ConnectionError::ParseError(RequestError::PayloadTooLarge));
            }
            if expect {
                self.enqueue_interim_continue()?;
            }
            self.body_bytes_to_be_read = content_length;
            self.body_vec.clear();
            self.state = ConnectionState::WaitingForBody;
        } else {
            self.state = ConnectionState::RequestReady;
        }
        Ok(true)
    }

    fn enqueue_interim_continue(&mut self) -> Result<(), ConnectionError> {
        let response = Response::new(self.version, StatusCode::Continue);
        self.enqueue_response(response)
    }

    fn parse_body(&mut self) -> Result<bool, ConnectionError> {
        if self.read_buf.is_empty() {
            return Ok(false);
        }
        let take = (self.body_bytes_to_be_read as usize).min(self.read_buf.len());
        self.body_vec
            .extend_from_slice(&self.read_buf.unread()[..take]);
        self.read_buf.consume(take);
        self.body_bytes_to_be_read -= take as u32;
        if self.body_bytes_to_be_read > 0 {
            return Ok(false);
        }

        self.finish_body()?;
        Ok(true)
    }

    fn parse_chunk_size(&mut self) -> Result<bool, ConnectionError> {
        let line = match self.take_line().map_err(ConnectionError::ParseError)? {
            Some(line) => line,
            None => return Ok(false),
        };
        // The size token may be followed by chunk extensions after ';'.
        let token = line
            .split(|&byte| byte == b';')
            .next()
            .unwrap_or(&[])
            .to_vec();
        let token = std::str::from_utf8(&token)
            .map_err(|_| ConnectionError::ParseError(RequestError::InvalidChunk("bad size line")))?
            .trim()
            .to_string();
        let size = u32::from_str_radix(&token, 16).map_err(|_| {
            ConnectionError::ParseError(RequestError::InvalidChunk("bad size line"))
        })?;

        if size == 0 {
            self.state = ConnectionState::WaitingForChunkTrailer;
            return Ok(true);
        }
        // The cumulative limit is enforced as soon as a chunk announces it
        // will be crossed, before its payload is consumed.
        if self.body_vec.len() as u64 + u64::from(size) > u64::from(self.limits.max_body_len) {
            return Err(ConnectionError::ParseError(RequestError::PayloadTooLarge));
        }
        self.state = ConnectionState::WaitingForChunkData(size);
        Ok(true)
    }

    fn parse_chunk_data(&mut self, remaining: u32) -> Result<bool, ConnectionError> {
        if self.read_buf.is_empty() {
            return Ok(false);
        }
        let take = (remaining as usize).min(self.read_buf.len());
        self.body_vec
            .extend_from_slice(&self.read_buf.unread()[..take]);
        self.read_buf.consume(take);
        let left = remaining - take as u32;
        if left > 0 {
            self.state = ConnectionState::WaitingForChunkData(left);
            return Ok(false);
        }
        self.state = ConnectionState::WaitingForChunkDataEnd;
        Ok(true)
    }

    fn parse_chunk_data_end(&mut self) -> Result<bool, ConnectionError> {
        match self.read_buf.get_block(CRLF_LEN) {
            Some(bytes) if bytes == [CR, LF] => {
                self.read_buf.consume(CRLF_LEN);
                self.state = ConnectionState::WaitingForChunkSize;
                Ok(true)
            }
            Some(_) => Err(ConnectionError::ParseError(RequestError::InvalidChunk(
                "chunk data not CRLF terminated",
            ))),
            None => Ok(false),
        }
    }

    fn parse_chunk_trailer(&mut self) -> Result<bool, ConnectionError> {
        let line = match self.take_line().map_err(ConnectionError::ParseError)? {
            Some(line) => line,
            None => return Ok(false),
        };
        if line.is_empty() {
            self.finish_body()?;
            return Ok(true);
        }
        // Trailer fields are accepted and dropped.
        Ok(true)
    }

    fn finish_body(&mut self) -> Result<(), ConnectionError> {
        let request = self
            .pending_request
            .as_mut()
            .ok_or(ConnectionError::ParseError(RequestError::InvalidRequest))?;
        request.body = Some(Body::new(std::mem::take(&mut self.body_vec)));
        self.state = ConnectionState::RequestReady;
        Ok(())
    }

    /// Returns the fully parsed request, if one is waiting for dispatch.
    pub fn pop_parsed_request(&mut self) -> Option<Request> {
        self.parsed_request.take()
    }

    /// Queues `response` for transmission, serializing head and in-memory
    /// body into the write buffer. A file body installs the background
    /// writer instead of being buffered.
    ///
    /// # Errors
    /// `StreamError` with `OutOfMemory` when the response does not fit the
    /// write buffer ceiling.
    pub fn enqueue_response(&mut self, mut response: Response) -> Result<(), ConnectionError> {
        let mut bytes: Vec<u8> = Vec::new();
        response
            .write_all(&mut bytes)
            .map_err(ConnectionError::StreamError)?;
        self.write_buf.put_slice(&bytes).map_err(|_| {
            ConnectionError::StreamError(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "response exceeds the write buffer limit",
            ))
        })?;
        if let Some(source) = response.take_file_source() {
            self.install_background_writer(Box::new(source));
        }
        self.close_after_write |= response.close();
        Ok(())
    }

    /// Queues raw, already-framed response bytes, as produced by a
    /// streaming handler.
    pub fn enqueue_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.write_buf.put_slice(bytes).map_err(|_| {
            ConnectionError::StreamError(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "response exceeds the write buffer limit",
            ))
        })
    }

    /// Installs the deferred body producer for the current response.
    /// Installing a second writer while one is active is a programming
    /// error.
    pub fn install_background_writer(&mut self, writer: Box<dyn BackgroundWrite>) {
        debug_assert!(
            self.background.is_none(),
            "a background writer is already installed"
        );
        self.background = Some(writer);
    }

    /// Marks the connection for closing once queued bytes are drained.
    pub fn set_close_after_write(&mut self) {
        self.close_after_write = true;
    }

    /// Returns `true` if there are bytes (buffered or deferred) waiting to
    /// be written to the stream.
    pub fn pending_write(&self) -> bool {
        !self.write_buf.is_empty() || self.background.is_some()
    }

    /// Returns `true` when the connection is to be closed after its queued
    /// bytes drain.
    pub fn close_requested(&self) -> bool {
        self.close_after_write
    }

    /// Writes as much of the queued response as the stream accepts; once
    /// the buffer is drained, gives the background writer a turn. Call on
    /// every `EPOLLOUT`.
    ///
    /// # Errors
    /// `StreamError` when an IO operation fails, `ConnectionClosed` when
    /// the stream accepted zero bytes, `InvalidWrite` when nothing was
    /// queued.
    pub fn try_write(&mut self) -> Result<(), ConnectionError> {
        if !self.pending_write() {
            return Err(ConnectionError::InvalidWrite);
        }
        while !self.write_buf.is_empty() {
            match self.write_buf.drain_to(&mut self.stream) {
                Ok(0) => return Err(ConnectionError::ConnectionClosed),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ConnectionError::StreamError(e)),
            }
        }
        if let Some(writer) = self.background.as_mut() {
            match writer.write_some(&mut self.stream) {
                Ok(WriteProgress::Complete) => self.background = None,
                Ok(WriteProgress::Pending) => {}
                Err(e) => return Err(ConnectionError::StreamError(e)),
            }
        }
        Ok(())
    }

    /// The HTTP version of the most recently parsed request line.
    pub fn http_version(&self) -> Version {
        self.version
    }

    /// Returns `true` while a request is being received or awaits
    /// dispatch, for request-timeout accounting.
    pub fn receiving_request(&self) -> bool {
        self.parsed_request.is_some()
            || !matches!(self.state, ConnectionState::WaitingForRequestLine)
            || !self.read_buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Method;
    use std::os::unix::net::UnixStream;

    fn connection() -> (UnixStream, HttpConnection<UnixStream>) {
        let (sender, receiver) = UnixStream::pair().unwrap();
        receiver.set_nonblocking(true).unwrap();
        (sender, HttpConnection::new(receiver, HttpLimits::default()))
    }

    fn small_limits() -> HttpLimits {
        HttpLimits {
            max_line_len: 128,
            max_body_len: 32,
            write_buffer_ceiling: 4096,
        }
    }

    #[test]
    fn test_read_simple_request() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: device.local\r\n\r\n")
            .unwrap();
        conn.try_read().unwrap();

        let request = conn.pop_parsed_request().unwrap();
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/index.html");
        assert_eq!(request.headers.host(), Some("device.local"));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_read_segmented_request() {
        let (mut sender, mut conn) = connection();
        sender.write_all(b"GET /a/very/deep").unwrap();
        conn.try_read().unwrap();
        assert!(conn.pop_parsed_request().is_none());

        sender.write_all(b"/path HTTP/1.1\r\nHo").unwrap();
        conn.try_read().unwrap();
        assert!(conn.pop_parsed_request().is_none());

        sender.write_all(b"st: x\r\n\r\n").unwrap();
        conn.try_read().unwrap();
        let request = conn.pop_parsed_request().unwrap();
        assert_eq!(request.path(), "/a/very/deep/path");
        assert_eq!(request.headers.host(), Some("x"));
    }

    #[test]
    fn test_read_request_with_body() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(b"PUT /file.txt HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world")
            .unwrap();
        conn.try_read().unwrap();
        let request = conn.pop_parsed_request().unwrap();
        assert_eq!(request.body.unwrap().raw(), b"hello world");
    }

    #[test]
    fn test_read_chunked_body() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(
                b"POST /action/login HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .unwrap();
        conn.try_read().unwrap();
        let request = conn.pop_parsed_request().unwrap();
        assert_eq!(request.body.unwrap().raw(), b"hello world");
    }

    #[test]
    fn test_read_chunked_body_segmented() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nab")
            .unwrap();
        conn.try_read().unwrap();
        assert!(conn.pop_parsed_request().is_none());
        sender.write_all(b"c\r\n0\r\n").unwrap();
        conn.try_read().unwrap();
        assert!(conn.pop_parsed_request().is_none());
        sender.write_all(b"\r\n").unwrap();
        conn.try_read().unwrap();
        assert_eq!(conn.pop_parsed_request().unwrap().body.unwrap().raw(), b"abc");
    }

    #[test]
    fn test_chunked_trailer_ignored() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(
                b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                  2\r\nok\r\n0\r\nX-Checksum: abc\r\n\r\n",
            )
            .unwrap();
        conn.try_read().unwrap();
        assert_eq!(conn.pop_parsed_request().unwrap().body.unwrap().raw(), b"ok");
    }

    #[test]
    fn test_content_length_over_limit() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        receiver.set_nonblocking(true).unwrap();
        let mut conn = HttpConnection::new(receiver, small_limits());
        sender
            .write_all(b"PUT /big HTTP/1.1\r\nContent-Length: 33\r\n\r\n")
            .unwrap();
        assert_eq!(
            conn.try_read().unwrap_err(),
            ConnectionError::ParseError(RequestError::PayloadTooLarge)
        );
    }

    #[test]
    fn test_chunked_over_limit() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        receiver.set_nonblocking(true).unwrap();
        let mut conn = HttpConnection::new(receiver, small_limits());
        // Two chunks of 20 bytes cross the 32 byte cap on the second size
        // line, before its payload arrives.
        sender
            .write_all(b"PUT /big HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n14\r\n")
            .unwrap();
        sender.write_all(&[b'a'; 20]).unwrap();
        sender.write_all(b"\r\n14\r\n").unwrap();
        assert_eq!(
            conn.try_read().unwrap_err(),
            ConnectionError::ParseError(RequestError::PayloadTooLarge)
        );
    }

    #[test]
    fn test_invalid_chunk_size() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n")
            .unwrap();
        assert_eq!(
            conn.try_read().unwrap_err(),
            ConnectionError::ParseError(RequestError::InvalidChunk("bad size line"))
        );
    }

    #[test]
    fn test_invalid_header_is_terminal() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(b"GET / HTTP/1.1\r\nContent-Length: alpha\r\n\r\n")
            .unwrap();
        assert!(matches!(
            conn.try_read().unwrap_err(),
            ConnectionError::ParseError(RequestError::HeaderError(_))
        ));
    }

    #[test]
    fn test_line_over_limit() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        receiver.set_nonblocking(true).unwrap();
        let mut conn = HttpConnection::new(receiver, small_limits());
        sender.write_all(b"GET /").unwrap();
        sender.write_all(&[b'a'; 200]).unwrap();
        let mut result = Ok(());
        for _ in 0..4 {
            result = conn.try_read();
            if result.is_err() {
                break;
            }
        }
        assert_eq!(
            result.unwrap_err(),
            ConnectionError::ParseError(RequestError::HeaderError(
                HttpHeaderError::SizeLimitExceeded(128)
            ))
        );
    }

    #[test]
    fn test_expect_sends_interim_continue() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(
                b"PUT /f HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
            )
            .unwrap();
        conn.try_read().unwrap();
        assert!(conn.pop_parsed_request().is_none());
        assert!(conn.pending_write());
        conn.try_write().unwrap();

        let mut buf = [0u8; 256];
        let got = sender.read(&mut buf).unwrap();
        assert!(std::str::from_utf8(&buf[..got])
            .unwrap()
            .starts_with("HTTP/1.1 100 Continue\r\n"));

        sender.write_all(b"body").unwrap();
        conn.try_read().unwrap();
        assert_eq!(conn.pop_parsed_request().unwrap().body.unwrap().raw(), b"body");
    }

    #[test]
    fn test_pipelined_request_held_until_popped() {
        let (mut sender, mut conn) = connection();
        sender
            .write_all(b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n")
            .unwrap();
        conn.try_read().unwrap();
        let first = conn.pop_parsed_request().unwrap();
        assert_eq!(first.path(), "/first");
        // The second request is parsed only after the first was taken.
        conn.parse_buffered().unwrap();
        let second = conn.pop_parsed_request().unwrap();
        assert_eq!(second.path(), "/second");
    }

    #[test]
    fn test_blank_lines_before_request_tolerated() {
        let (mut sender, mut conn) = connection();
        sender.write_all(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n").unwrap();
        conn.try_read().unwrap();
        assert_eq!(conn.pop_parsed_request().unwrap().path(), "/");
    }

    #[test]
    fn test_connection_closed_on_eof() {
        let (sender, mut conn) = connection();
        drop(sender);
        assert_eq!(
            conn.try_read().unwrap_err(),
            ConnectionError::ConnectionClosed
        );
    }

    #[test]
    fn test_try_write_response() {
        let (mut sender, mut conn) = connection();
        let mut response = Response::new(Version::Http11, StatusCode::OK);
        response.set_body(Body::new("response body"));
        conn.enqueue_response(response).unwrap();
        assert!(conn.pending_write());
        conn.try_write().unwrap();
        assert!(!conn.pending_write());

        let mut buf = [0u8; 512];
        let got = sender.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..got]).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nresponse body"));
    }

    #[test]
    fn test_try_write_nothing_queued() {
        let (_sender, mut conn) = connection();
        assert_eq!(conn.try_write().unwrap_err(), ConnectionError::InvalidWrite);
    }

    #[test]
    fn test_close_disposition_tracked() {
        let (_sender, mut conn) = connection();
        let mut response = Response::new(Version::Http10, StatusCode::OK);
        response.set_close(true);
        conn.enqueue_response(response).unwrap();
        assert!(conn.close_requested());
    }

    #[test]
    fn test_background_writer_streams_file() {
        let temp = utils::tempfile::TempFile::new().unwrap();
        let payload = vec![b'z'; 10_000];
        std::fs::write(temp.as_path(), &payload).unwrap();
        let file = std::fs::File::open(temp.as_path()).unwrap();

        let (mut sender, mut conn) = connection();
        sender.set_nonblocking(false).unwrap();
        let mut response = Response::new(Version::Http11, StatusCode::OK);
        response.set_file(file, payload.len() as u64);
        conn.enqueue_response(response).unwrap();
        assert!(conn.pending_write());

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while conn.pending_write() {
            conn.try_write().unwrap();
            loop {
                sender.set_nonblocking(true).unwrap();
                match sender.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("read failed: {}", e),
                }
            }
        }
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 10000\r\n"));
        let body_start = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&received[body_start..], payload.as_slice());
    }

    #[test]
    #[should_panic(expected = "background writer")]
    fn test_double_background_writer_panics() {
        let temp = utils::tempfile::TempFile::new().unwrap();
        let (_sender, mut conn) = connection();
        let first = std::fs::File::open(temp.as_path()).unwrap();
        let second = std::fs::File::open(temp.as_path()).unwrap();
        conn.install_background_writer(Box::new(FileSource {
            file: first,
            remaining: 1,
        }));
        conn.install_background_writer(Box::new(FileSource {
            file: second,
            remaining: 1,
        }));
    }
}
