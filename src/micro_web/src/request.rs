// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::common::codec::percent_decode;
use crate::common::headers::Headers;
use crate::common::{Body, Method, RequestError, Version};

/// Finds the first occurrence of `sequence` in `bytes`, returning the
/// starting index, or `None` if the sequence is not present.
pub fn find(bytes: &[u8], sequence: &[u8]) -> Option<usize> {
    if sequence.is_empty() || bytes.len() < sequence.len() {
        return None;
    }
    bytes
        .windows(sequence.len())
        .position(|window| window == sequence)
}

/// The first line of an HTTP request: method, URI and version.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: String,
    http_version: Version,
}

impl RequestLine {
    /// Parses `line` (without the trailing CRLF) into a `RequestLine`.
    ///
    /// # Errors
    /// `InvalidRequest` when the line does not have three tokens,
    /// `InvalidHttpMethod`/`InvalidUri`/`InvalidHttpVersion` when a token
    /// does not parse.
    pub fn try_from(line: &[u8]) -> Result<Self, RequestError> {
        let mut tokens = line
            .split(|&byte| byte == b' ')
            .filter(|token| !token.is_empty());
        let method = tokens.next().ok_or(RequestError::InvalidRequest)?;
        let uri = tokens.next().ok_or(RequestError::InvalidRequest)?;
        let version = tokens.next().ok_or(RequestError::InvalidRequest)?;
        if tokens.next().is_some() {
            return Err(RequestError::InvalidRequest);
        }

        let uri = std::str::from_utf8(uri)
            .map_err(|_| RequestError::InvalidUri("URI is not valid UTF-8."))?;
        Ok(RequestLine {
            method: Method::try_from(method)?,
            uri: uri.to_string(),
            http_version: Version::try_from(version)?,
        })
    }

    #[cfg(test)]
    pub fn new(method: Method, uri: &str, http_version: Version) -> Self {
        RequestLine {
            method,
            uri: uri.to_string(),
            http_version,
        }
    }
}

/// Splits a request URI into its decoded, normalized absolute path and the
/// raw query string.
///
/// Absolute-form URIs (`http://host[:port]/path`) are reduced to their
/// path; a fragment, if a client ever sends one, is dropped. Path
/// normalization resolves `.` and `..` segments after percent-decoding and
/// rejects any path that would climb above the root, so handlers can join
/// the result onto the document root safely.
fn split_uri(uri: &str) -> Result<(String, Option<String>), RequestError> {
    let mut rest = uri;
    if let Some(after_scheme) = rest.strip_prefix("http://") {
        // Skip the authority; the path starts at the next '/'.
        match after_scheme.find('/') {
            Some(slash) => rest = &after_scheme[slash..],
            None => rest = "/",
        }
    }
    if !rest.starts_with('/') {
        return Err(RequestError::InvalidUri("URI path must be absolute."));
    }

    let rest = match rest.split_once('#') {
        Some((before, _)) => before,
        None => rest,
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (rest, None),
    };
    Ok((normalize_path(path)?, query))
}

fn normalize_path(raw: &str) -> Result<String, RequestError> {
    let decoded = percent_decode(raw, false);
    if decoded.bytes().any(|byte| byte == 0) {
        return Err(RequestError::InvalidUri("URI contains a NUL byte."));
    }
    let had_trailing_slash = decoded.len() > 1 && decoded.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                // Climbing above the document root is a traversal attempt.
                if segments.pop().is_none() {
                    return Err(RequestError::InvalidUri("URI escapes the root."));
                }
            }
            other => segments.push(other),
        }
    }

    let mut path = String::with_capacity(decoded.len());
    path.push('/');
    path.push_str(&segments.join("/"));
    if had_trailing_slash && path.len() > 1 {
        path.push('/');
    }
    Ok(path)
}

/// A fully parsed HTTP request.
#[derive(Debug)]
pub struct Request {
    /// The parsed request line.
    pub request_line: RequestLine,
    /// The parsed request headers.
    pub headers: Headers,
    /// The request body, present once the content phase completed with a
    /// non-empty payload.
    pub body: Option<Body>,
    path: String,
    query: Option<String>,
}

impl Request {
    /// Builds a request from a parsed request line, deriving the normalized
    /// path and the query string.
    ///
    /// # Errors
    /// `InvalidUri` when the URI is relative, escapes the root or cannot be
    /// decoded.
    pub fn from_request_line(request_line: RequestLine) -> Result<Self, RequestError> {
        let (path, query) = split_uri(&request_line.uri)?;
        Ok(Request {
            request_line,
            headers: Headers::default(),
            body: None,
            path,
            query,
        })
    }

    /// Returns the request method.
    pub fn method(&self) -> Method {
        self.request_line.method
    }

    /// Returns the HTTP version of the request.
    pub fn http_version(&self) -> Version {
        self.request_line.http_version
    }

    /// Returns the URI exactly as received.
    pub fn uri(&self) -> &str {
        &self.request_line.uri
    }

    /// Returns the normalized, percent-decoded absolute path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string, if the URI carried one.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the extension of the last path segment, lowercased.
    pub fn extension(&self) -> Option<String> {
        let last_segment = self.path.rsplit('/').next()?;
        let (stem, extension) = last_segment.rsplit_once('.')?;
        if stem.is_empty() || extension.is_empty() {
            return None;
        }
        Some(extension.to_ascii_lowercase())
    }

    /// Returns `true` if the connection is to be kept open after this
    /// request, honoring an explicit `Connection` header over the version
    /// default.
    pub fn keep_alive(&self) -> bool {
        match self.headers.connection_close() {
            Some(close) => !close,
            None => self.http_version().default_keep_alive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_for(uri: &str) -> Result<Request, RequestError> {
        let line = format!("GET {} HTTP/1.1", uri);
        Request::from_request_line(RequestLine::try_from(line.as_bytes())?)
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abc\r\ndef", b"\r\n"), Some(3));
        assert_eq!(find(b"abcdef", b"\r\n"), None);
        assert_eq!(find(b"ab", b"abcd"), None);
        assert_eq!(find(b"abc", b""), None);
    }

    #[test]
    fn test_request_line() {
        assert_eq!(
            RequestLine::try_from(b"GET /index.html HTTP/1.1").unwrap(),
            RequestLine::new(Method::Get, "/index.html", Version::Http11)
        );
        // Multiple separating spaces are tolerated.
        assert_eq!(
            RequestLine::try_from(b"PUT  /upload   HTTP/1.0").unwrap(),
            RequestLine::new(Method::Put, "/upload", Version::Http10)
        );
        assert_eq!(
            RequestLine::try_from(b"GET /index.html").unwrap_err(),
            RequestError::InvalidRequest
        );
        assert_eq!(
            RequestLine::try_from(b"GET / HTTP/1.1 extra").unwrap_err(),
            RequestError::InvalidRequest
        );
        assert_eq!(
            RequestLine::try_from(b"FETCH / HTTP/1.1").unwrap_err(),
            RequestError::InvalidHttpMethod("Unsupported HTTP method.")
        );
        assert_eq!(
            RequestLine::try_from(b"GET / HTTP/2.0").unwrap_err(),
            RequestError::InvalidHttpVersion("Unsupported HTTP version.")
        );
    }

    #[test]
    fn test_path_and_query() {
        let request = request_for("/a/b.html?x=1&y=2").unwrap();
        assert_eq!(request.path(), "/a/b.html");
        assert_eq!(request.query(), Some("x=1&y=2"));
        assert_eq!(request.extension().unwrap(), "html");

        let request = request_for("/plain").unwrap();
        assert_eq!(request.path(), "/plain");
        assert_eq!(request.query(), None);
        assert_eq!(request.extension(), None);
    }

    #[test]
    fn test_absolute_form_uri() {
        let request = request_for("http://device.local:8080/admin/index.html").unwrap();
        assert_eq!(request.path(), "/admin/index.html");
        let request = request_for("http://device.local").unwrap();
        assert_eq!(request.path(), "/");
    }

    #[test]
    fn test_percent_decoding_and_normalization() {
        assert_eq!(request_for("/a%20b/c").unwrap().path(), "/a b/c");
        assert_eq!(request_for("/a/./b//c").unwrap().path(), "/a/b/c");
        assert_eq!(request_for("/a/../b").unwrap().path(), "/b");
        assert_eq!(request_for("/docs/").unwrap().path(), "/docs/");
        assert_eq!(request_for("/").unwrap().path(), "/");
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(request_for("/../etc/passwd").is_err());
        assert!(request_for("/a/../../etc").is_err());
        // An encoded traversal must not fare better.
        assert!(request_for("/%2e%2e/etc").is_err());
        assert!(request_for("relative/path").is_err());
    }

    #[test]
    fn test_keep_alive() {
        let mut request = request_for("/").unwrap();
        assert!(request.keep_alive());
        request
            .headers
            .parse_header_line(b"Connection: close")
            .unwrap();
        assert!(!request.keep_alive());

        let line = RequestLine::try_from(b"GET / HTTP/1.0").unwrap();
        let mut request = Request::from_request_line(line).unwrap();
        assert!(!request.keep_alive());
        request
            .headers
            .parse_header_line(b"Connection: keep-alive")
            .unwrap();
        assert!(request.keep_alive());
    }

    #[test]
    fn test_dotfile_has_no_extension() {
        let request = request_for("/.hidden").unwrap();
        assert_eq!(request.extension(), None);
    }
}
