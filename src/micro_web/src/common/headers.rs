// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::common::{HttpHeaderError, RequestError};

/// The request headers this implementation acts upon.
///
/// Every header line is retained in the raw map for handlers that want to
/// inspect it, but only the fields below influence parsing and dispatch.
/// Header names are case insensitive; the first occurrence of a name wins,
/// later duplicates are ignored.
#[derive(Debug, Default)]
pub struct Headers {
    /// The number of body bytes announced through `Content-Length`.
    content_length: u32,
    /// Set when `Transfer-Encoding: chunked` was seen. Every HTTP/1.1
    /// server must accept chunked request bodies.
    chunked: bool,
    /// Set when the headers contain `Expect: 100-continue`, which obliges
    /// us to emit an interim 100 response before reading the body.
    expect: bool,
    /// The explicit `Connection` disposition, if any. `None` falls back to
    /// the version default.
    connection_close: Option<bool>,
    /// The `Host` header value.
    host: Option<String>,
    /// The raw `Cookie` header value.
    cookie: Option<String>,
    /// The `Authorization` header split into scheme and details.
    authorization: Option<(String, String)>,
    /// `If-Modified-Since`, parsed to Unix seconds. Unparseable dates are
    /// treated as absent, per RFC 7232.
    if_modified_since: Option<i64>,
    /// The `Referer` header value.
    referer: Option<String>,
    /// The raw `Content-Type` header value.
    content_type: Option<String>,
    /// All header lines as lowercased-name/value pairs, first occurrence
    /// only.
    raw: Vec<(String, String)>,
}

impl Headers {
    /// Parses one header line and updates the structure.
    ///
    /// # Errors
    /// `HeaderError` is returned when the line is not a `name: value` pair,
    /// or when a recognized header carries a value that invalidates the
    /// request (e.g. a non-numeric `Content-Length` or a transfer encoding
    /// we cannot decode).
    pub fn parse_header_line(&mut self, header_line: &[u8]) -> Result<(), RequestError> {
        // Header fields are ASCII, so also valid UTF-8.
        let line = std::str::from_utf8(header_line).map_err(|_| {
            RequestError::HeaderError(HttpHeaderError::InvalidFormat(
                String::from_utf8_lossy(header_line).to_string(),
            ))
        })?;
        let (name, value) = line.split_once(':').ok_or_else(|| {
            RequestError::HeaderError(HttpHeaderError::InvalidFormat(line.to_string()))
        })?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name.is_empty() {
            return Err(RequestError::HeaderError(HttpHeaderError::InvalidFormat(
                line.to_string(),
            )));
        }

        if !self.raw.iter().any(|(existing, _)| *existing == name) {
            self.raw.push((name.clone(), value.to_string()));
        } else if matches!(name.as_str(), "content-length" | "transfer-encoding") {
            // Conflicting body-framing headers are a request smuggling
            // vector, never a client mistake to paper over.
            return Err(RequestError::HeaderError(HttpHeaderError::InvalidValue(
                name,
                value.to_string(),
            )));
        } else {
            return Ok(());
        }

        match name.as_str() {
            "content-length" => match value.parse::<u32>() {
                Ok(content_length) => {
                    self.content_length = content_length;
                    Ok(())
                }
                Err(_) => Err(RequestError::HeaderError(HttpHeaderError::InvalidValue(
                    name,
                    value.to_string(),
                ))),
            },
            "transfer-encoding" => match value.to_ascii_lowercase().as_str() {
                "chunked" => {
                    self.chunked = true;
                    Ok(())
                }
                // An encoding we cannot decode means we cannot frame the
                // body; this must fail the request, not be skipped.
                _ => Err(RequestError::HeaderError(HttpHeaderError::InvalidValue(
                    name,
                    value.to_string(),
                ))),
            },
            "connection" => {
                let value = value.to_ascii_lowercase();
                if value.contains("close") {
                    self.connection_close = Some(true);
                } else if value.contains("keep-alive") {
                    self.connection_close = Some(false);
                }
                Ok(())
            }
            "expect" => match value {
                "100-continue" => {
                    self.expect = true;
                    Ok(())
                }
                _ => Err(RequestError::HeaderError(
                    HttpHeaderError::UnsupportedValue(name, value.to_string()),
                )),
            },
            "host" => {
                self.host = Some(value.to_string());
                Ok(())
            }
            "cookie" => {
                self.cookie = Some(value.to_string());
                Ok(())
            }
            "authorization" => {
                let (scheme, details) = match value.split_once(' ') {
                    Some((scheme, details)) => (scheme, details.trim_start()),
                    None => (value, ""),
                };
                self.authorization = Some((scheme.to_ascii_lowercase(), details.to_string()));
                Ok(())
            }
            "if-modified-since" => {
                self.if_modified_since = utils::time::parse_http_date(value);
                Ok(())
            }
            "referer" => {
                self.referer = Some(value.to_string());
                Ok(())
            }
            "content-type" => {
                self.content_type = Some(value.to_string());
                Ok(())
            }
            // Everything else is retained in the raw map only.
            _ => Ok(()),
        }
    }

    /// Returns the announced content length of the body.
    pub fn content_length(&self) -> u32 {
        self.content_length
    }

    /// Returns `true` if the transfer encoding is chunked.
    pub fn chunked(&self) -> bool {
        self.chunked
    }

    /// Returns `true` if the client expects an interim 100 response.
    pub fn expect(&self) -> bool {
        self.expect
    }

    /// Returns the explicit `Connection: close`/`keep-alive` choice, if the
    /// client sent one.
    pub fn connection_close(&self) -> Option<bool> {
        self.connection_close
    }

    /// Returns the `Host` header value.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Returns the raw `Cookie` header value.
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Returns the `Authorization` scheme (lowercased) and its details.
    pub fn authorization(&self) -> Option<(&str, &str)> {
        self.authorization
            .as_ref()
            .map(|(scheme, details)| (scheme.as_str(), details.as_str()))
    }

    /// Returns `If-Modified-Since` as Unix seconds.
    pub fn if_modified_since(&self) -> Option<i64> {
        self.if_modified_since
    }

    /// Returns the `Referer` header value.
    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    /// Returns the raw `Content-Type` header value.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Case-insensitive lookup in the raw header map. Returns the value of
    /// the first occurrence of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.raw
            .iter()
            .find(|(existing, _)| *existing == name)
            .map(|(_, value)| value.as_str())
    }
}
