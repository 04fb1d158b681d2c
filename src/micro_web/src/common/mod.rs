// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Display, Error, Formatter};

pub mod codec;
pub mod headers;

pub mod ascii {
    pub const CR: u8 = b'\r';
    pub const COLON: u8 = b':';
    pub const LF: u8 = b'\n';
    pub const SP: u8 = b' ';
    pub const CRLF_LEN: usize = 2;
}

/// Errors associated with parsing a header field.
#[derive(Debug, PartialEq, Eq)]
pub enum HttpHeaderError {
    /// The header line is not a `name: value` pair.
    InvalidFormat(String),
    /// The value of the header cannot be interpreted, e.g. a non-numeric
    /// `Content-Length`.
    InvalidValue(String, String),
    /// The header is recognized but its value asks for a feature this
    /// implementation does not provide.
    UnsupportedValue(String, String),
    /// A header line exceeded the configured size limit.
    SizeLimitExceeded(usize),
}

impl Display for HttpHeaderError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        match self {
            Self::InvalidFormat(line) => write!(f, "Invalid header format: {}", line),
            Self::InvalidValue(name, value) => {
                write!(f, "Invalid value for header {}: {}", name, value)
            }
            Self::UnsupportedValue(name, value) => {
                write!(f, "Unsupported value for header {}: {}", name, value)
            }
            Self::SizeLimitExceeded(limit) => {
                write!(f, "Header line longer than the limit of {} bytes", limit)
            }
        }
    }
}

/// Errors associated with parsing an HTTP request from the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    /// The HTTP method is not supported or it is invalid.
    InvalidHttpMethod(&'static str),
    /// Request URI is invalid.
    InvalidUri(&'static str),
    /// The HTTP version in the request is not supported or it is invalid.
    InvalidHttpVersion(&'static str),
    /// A header invalidates the request.
    HeaderError(HttpHeaderError),
    /// A chunked body could not be decoded.
    InvalidChunk(&'static str),
    /// The declared or received body exceeds the configured limit.
    PayloadTooLarge,
    /// The request is invalid and cannot be served.
    InvalidRequest,
}

impl RequestError {
    /// The status code reported to the client for this parse failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PayloadTooLarge => 413,
            _ => 400,
        }
    }
}

impl Display for RequestError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        match self {
            Self::InvalidHttpMethod(inner) => write!(f, "Invalid HTTP method: {}", inner),
            Self::InvalidUri(inner) => write!(f, "Invalid URI: {}", inner),
            Self::InvalidHttpVersion(inner) => write!(f, "Invalid HTTP version: {}", inner),
            Self::HeaderError(inner) => write!(f, "Invalid header: {}", inner),
            Self::InvalidChunk(inner) => write!(f, "Invalid chunked body: {}", inner),
            Self::PayloadTooLarge => write!(f, "Request body too large."),
            Self::InvalidRequest => write!(f, "Invalid request."),
        }
    }
}

/// Errors associated with an HTTP connection.
#[derive(Debug)]
pub enum ConnectionError {
    /// The request parsing has failed.
    ParseError(RequestError),
    /// Could not perform a stream operation successfully.
    StreamError(std::io::Error),
    /// Attempted to read or write on a closed connection.
    ConnectionClosed,
    /// Attempted to write on a stream when there was nothing to write.
    InvalidWrite,
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        match self {
            Self::ParseError(inner) => write!(f, "Parsing error: {}", inner),
            Self::StreamError(inner) => write!(f, "Stream error: {}", inner),
            Self::ConnectionClosed => write!(f, "Connection closed."),
            Self::InvalidWrite => write!(f, "Invalid write attempt."),
        }
    }
}

/// The body associated with an HTTP request or response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Body {
    /// Body of the HTTP message as bytes.
    pub body: Vec<u8>,
}

impl Body {
    /// Creates a new `Body` from anything convertible to bytes.
    pub fn new<T: Into<Vec<u8>>>(body: T) -> Self {
        Self { body: body.into() }
    }

    /// Returns the body as a byte slice.
    pub fn raw(&self) -> &[u8] {
        self.body.as_slice()
    }

    /// Returns the length of the `Body`.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Checks if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Supported HTTP methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method.
    Get,
    /// HEAD method.
    Head,
    /// POST method.
    Post,
    /// PUT method.
    Put,
    /// DELETE method.
    Delete,
    /// OPTIONS method.
    Options,
}

impl Method {
    /// Returns a `Method` if the parsing of `bytes` is successful.
    ///
    /// The method is case sensitive, per RFC 7231.
    ///
    /// # Errors
    /// `InvalidHttpMethod` is returned if the method is unsupported.
    pub fn try_from(bytes: &[u8]) -> Result<Self, RequestError> {
        match bytes {
            b"GET" => Ok(Self::Get),
            b"HEAD" => Ok(Self::Head),
            b"POST" => Ok(Self::Post),
            b"PUT" => Ok(Self::Put),
            b"DELETE" => Ok(Self::Delete),
            b"OPTIONS" => Ok(Self::Options),
            _ => Err(RequestError::InvalidHttpMethod("Unsupported HTTP method.")),
        }
    }

    /// Returns the method token as a byte slice.
    pub fn raw(self) -> &'static [u8] {
        match self {
            Self::Get => b"GET",
            Self::Head => b"HEAD",
            Self::Post => b"POST",
            Self::Put => b"PUT",
            Self::Delete => b"DELETE",
            Self::Options => b"OPTIONS",
        }
    }

    /// Returns the method token as a string slice.
    pub fn as_str(self) -> &'static str {
        // The method tokens above are all ASCII.
        std::str::from_utf8(self.raw()).unwrap_or("GET")
    }

    /// Returns `true` for methods that may carry a request body.
    pub fn has_body(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

/// Supported HTTP versions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    #[default]
    Http11,
}

impl Version {
    /// HTTP version as a byte slice.
    pub fn raw(self) -> &'static [u8] {
        match self {
            Self::Http10 => b"HTTP/1.0",
            Self::Http11 => b"HTTP/1.1",
        }
    }

    /// Creates a new HTTP `Version` from a byte slice. The token is case
    /// sensitive and only HTTP/1.0 and HTTP/1.1 are accepted.
    ///
    /// # Errors
    /// Returns `InvalidHttpVersion` when the version is not supported.
    pub fn try_from(bytes: &[u8]) -> Result<Self, RequestError> {
        match bytes {
            b"HTTP/1.0" => Ok(Self::Http10),
            b"HTTP/1.1" => Ok(Self::Http11),
            _ => Err(RequestError::InvalidHttpVersion(
                "Unsupported HTTP version.",
            )),
        }
    }

    /// Returns `true` if this version keeps the connection open by default.
    pub fn default_keep_alive(self) -> bool {
        matches!(self, Self::Http11)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl PartialEq for ConnectionError {
        fn eq(&self, other: &Self) -> bool {
            use self::ConnectionError::*;
            match (self, other) {
                (ParseError(a), ParseError(b)) => a == b,
                (ConnectionClosed, ConnectionClosed) => true,
                (StreamError(_), StreamError(_)) => true,
                (InvalidWrite, InvalidWrite) => true,
                _ => false,
            }
        }
    }

    #[test]
    fn test_method() {
        assert_eq!(Method::try_from(b"GET").unwrap(), Method::Get);
        assert_eq!(Method::try_from(b"HEAD").unwrap(), Method::Head);
        assert_eq!(Method::try_from(b"POST").unwrap(), Method::Post);
        assert_eq!(Method::try_from(b"PUT").unwrap(), Method::Put);
        assert_eq!(Method::try_from(b"DELETE").unwrap(), Method::Delete);
        assert_eq!(Method::try_from(b"OPTIONS").unwrap(), Method::Options);
        assert_eq!(
            Method::try_from(b"get").unwrap_err(),
            RequestError::InvalidHttpMethod("Unsupported HTTP method.")
        );
        assert_eq!(Method::Delete.raw(), b"DELETE");
        assert_eq!(Method::Post.as_str(), "POST");
        assert!(Method::Put.has_body());
        assert!(!Method::Get.has_body());
    }

    #[test]
    fn test_version() {
        assert_eq!(Version::try_from(b"HTTP/1.0").unwrap(), Version::Http10);
        assert_eq!(Version::try_from(b"HTTP/1.1").unwrap(), Version::Http11);
        assert_eq!(
            Version::try_from(b"HTTP/2.0").unwrap_err(),
            RequestError::InvalidHttpVersion("Unsupported HTTP version.")
        );
        assert_eq!(Version::default(), Version::Http11);
        assert!(Version::Http11.default_keep_alive());
        assert!(!Version::Http10.default_keep_alive());
    }

    #[test]
    fn test_body() {
        let body = Body::new("");
        assert!(body.is_empty());
        let body = Body::new("This is a body.");
        assert_eq!(body.len(), 15);
        assert_eq!(body.raw(), b"This is a body.");
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(RequestError::PayloadTooLarge.status_code(), 413);
        assert_eq!(RequestError::InvalidRequest.status_code(), 400);
        assert_eq!(
            RequestError::InvalidChunk("missing size").status_code(),
            400
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", RequestError::InvalidHttpMethod("test")),
            "Invalid HTTP method: test"
        );
        assert_eq!(
            format!(
                "{}",
                RequestError::HeaderError(HttpHeaderError::InvalidValue(
                    "Content-Length".to_string(),
                    "five".to_string()
                ))
            ),
            "Invalid header: Invalid value for header Content-Length: five"
        );
        assert_eq!(
            format!("{}", ConnectionError::ConnectionClosed),
            "Connection closed."
        );
        assert_eq!(
            format!("{}", ConnectionError::InvalidWrite),
            "Invalid write attempt."
        );
    }
}
