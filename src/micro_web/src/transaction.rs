// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-request context handed to handlers and action callbacks.
//!
//! A `Transaction` owns the parsed request, the authentication state, the
//! selected route and everything the handler produces. Short responses are
//! built as a [`Response`] value; handlers that stream emit an explicit
//! head (chunk-encoded when no length was announced) followed by raw
//! framed bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::auth::AuthState;
use crate::common::codec::parse_form_vars;
use crate::common::{Body, Method};
use crate::request::Request;
use crate::response::{error_response, FileSource, Response, StatusCode};
use crate::router::Route;
use crate::session::session_cookie;

/// Lifecycle of a request once its bytes are fully received. The earlier
/// phases (request line, headers, content) are tracked by the connection
/// state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Parsed and ready for route selection and dispatch.
    Ready,
    /// Claimed by a handler which is producing the response.
    Running,
    /// The response is complete (though possibly still draining).
    Complete,
}

/// What the transaction produced, for the connection to transmit.
pub enum TxOutput {
    /// A buffered response, possibly with a file source for the
    /// background writer.
    Response(Box<Response>),
    /// Pre-framed bytes from a streaming handler.
    Raw(Vec<u8>),
}

/// One in-flight request bound to its connection.
pub struct Transaction {
    /// The parsed request.
    pub request: Request,
    /// Authentication state accumulated while verifying this request.
    pub auth: AuthState,
    state: TxState,
    route: Option<Rc<Route>>,
    /// The session bound to this request, if one was looked up or created.
    session_id: Option<String>,
    /// `Set-Cookie` value to announce a session created by this request.
    new_session_cookie: Option<String>,
    /// Decoded query and form variables, first occurrence winning.
    vars: Vec<(String, String)>,
    status: StatusCode,
    response: Option<Response>,
    /// Raw output of a streaming handler: head plus framed body bytes.
    streamed: Vec<u8>,
    head_written: bool,
    chunked: bool,
    announced_length: Option<u64>,
    pending_headers: Vec<(String, String)>,
    content_type: Option<String>,
    /// Challenge attached to a 401 produced by this transaction.
    challenge: Option<String>,
    /// Where the upload handler spooled the request body.
    upload_path: Option<PathBuf>,
    close: bool,
    done: bool,
}

impl Transaction {
    /// Wraps a fully parsed request, decoding its query variables.
    pub fn new(request: Request) -> Self {
        let mut vars = Vec::new();
        if let Some(query) = request.query() {
            vars = parse_form_vars(query);
        }
        Self {
            request,
            auth: AuthState::default(),
            state: TxState::Ready,
            route: None,
            session_id: None,
            new_session_cookie: None,
            vars,
            status: StatusCode::OK,
            response: None,
            streamed: Vec::new(),
            head_written: false,
            chunked: false,
            announced_length: None,
            pending_headers: Vec::new(),
            content_type: None,
            challenge: None,
            upload_path: None,
            close: false,
            done: false,
        }
    }

    /// Merges the request body into the variable set when it carries form
    /// data. Existing (query) variables win over body duplicates.
    pub fn decode_form_body(&mut self) {
        let is_form = self
            .request
            .headers
            .content_type()
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(self.request.method() == Method::Post);
        if !is_form {
            return;
        }
        let Some(body) = self.request.body.as_ref() else {
            return;
        };
        let text = String::from_utf8_lossy(body.raw()).into_owned();
        for (name, value) in parse_form_vars(&text) {
            if !self.vars.iter().any(|(existing, _)| *existing == name) {
                self.vars.push((name, value));
            }
        }
    }

    /// Returns the decoded variable `name`, or `default` if absent.
    pub fn var<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.vars
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
            .unwrap_or(default)
    }

    /// The lifecycle state of the transaction.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Marks the transaction as claimed by a handler. A running
    /// transaction must have a selected route.
    pub fn set_running(&mut self) {
        debug_assert!(
            self.route.is_some(),
            "a running transaction must have a route"
        );
        self.state = TxState::Running;
    }

    /// Returns the selected route.
    pub fn route(&self) -> Option<&Rc<Route>> {
        self.route.as_ref()
    }

    /// Binds the selected route.
    pub fn set_route(&mut self, route: Rc<Route>) {
        self.route = Some(route);
    }

    /// The session bound to this request.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Binds an existing session to this request.
    pub fn set_session_id<S: Into<String>>(&mut self, id: S) {
        self.session_id = Some(id.into());
    }

    /// Binds a session created for this request; its cookie is announced
    /// on the response.
    pub fn set_new_session<S: Into<String>>(&mut self, id: S) {
        let id = id.into();
        self.new_session_cookie = Some(session_cookie(&id));
        self.session_id = Some(id);
    }

    /// Stores the challenge sent if this request ends in a 401.
    pub fn set_challenge<S: Into<String>>(&mut self, challenge: S) {
        self.challenge = Some(challenge.into());
    }

    /// Forces `Connection: close` on the response.
    pub fn set_close(&mut self) {
        self.close = true;
    }

    /// Records where the upload handler spooled the request body.
    pub fn set_upload_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.upload_path = Some(path.into());
    }

    /// The spooled upload file, if the upload handler ran.
    pub fn upload_path(&self) -> Option<&Path> {
        self.upload_path.as_deref()
    }

    /// Returns `true` once `done`, `error` or `redirect` completed the
    /// transaction.
    pub fn is_complete(&self) -> bool {
        self.state == TxState::Complete
    }

    // ---- response production -------------------------------------------

    /// Sets the status code used by `write_headers`.
    pub fn set_status(&mut self, status: u16) {
        self.status = StatusCode::from_code(status);
    }

    /// Announces the body length ahead of `write_headers`; without it the
    /// streamed body is chunk-encoded.
    pub fn set_content_length(&mut self, len: u64) {
        self.announced_length = Some(len);
    }

    /// Sets the `Content-Type` of the streamed response.
    pub fn set_content_type<S: Into<String>>(&mut self, content_type: S) {
        self.content_type = Some(content_type.into());
    }

    /// Adds a response header ahead of `write_headers`.
    pub fn add_header<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.pending_headers.push((name.into(), value.into()));
    }

    /// Writes the response head into the streamed output. The content
    /// length is taken from `set_content_length`; if absent, the body
    /// that follows is chunk-encoded.
    pub fn write_headers(&mut self) {
        if self.head_written {
            return;
        }
        let mut head = Response::new(self.request.http_version(), self.status);
        match self.announced_length {
            Some(len) => head.set_content_length_only(len),
            None => {
                head.set_chunked();
                self.chunked = true;
            }
        }
        if let Some(ref content_type) = self.content_type {
            head.set_content_type(content_type.clone());
        }
        for (name, value) in self.pending_headers.drain(..) {
            head.add_header(name, value);
        }
        if let Some(cookie) = self.new_session_cookie.take() {
            head.set_cookie(cookie);
        }
        head.set_close(self.close || !self.request.keep_alive());
        // Writing into a Vec cannot fail.
        let _ = head.write_head(&mut self.streamed);
        self.head_written = true;
    }

    /// Appends body bytes to the streamed output, chunk-framing them when
    /// the head did not announce a length. Writes the head first if the
    /// handler has not done so.
    pub fn write(&mut self, data: &[u8]) {
        if !self.head_written {
            self.write_headers();
        }
        if data.is_empty() {
            return;
        }
        if self.chunked {
            self.streamed
                .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            self.streamed.extend_from_slice(data);
            self.streamed.extend_from_slice(b"\r\n");
        } else {
            self.streamed.extend_from_slice(data);
        }
    }

    /// Completes the transaction. The head is written first if the
    /// handler never did; a chunked stream gets its terminating zero
    /// chunk.
    pub fn done(&mut self) {
        if self.done {
            return;
        }
        if self.response.is_none() && !self.head_written {
            self.write_headers();
        }
        if self.chunked {
            self.streamed.extend_from_slice(b"0\r\n\r\n");
        }
        self.done = true;
        self.state = TxState::Complete;
    }

    /// Installs a complete response object, e.g. a static file response.
    pub fn set_response(&mut self, response: Response) {
        self.status = response.status();
        self.response = Some(response);
        self.done = true;
        self.state = TxState::Complete;
    }

    /// Renders a minimal HTML error body with the status code and message
    /// and completes the transaction. Heavyweight statuses also close the
    /// connection.
    pub fn error(&mut self, status: u16, message: &str) {
        let status = StatusCode::from_code(status);
        let mut response = error_response(self.request.http_version(), status, message);
        if let (StatusCode::Unauthorized, Some(challenge)) = (status, self.challenge.take()) {
            response.set_www_authenticate(challenge);
        }
        if matches!(
            status,
            StatusCode::BadRequest
                | StatusCode::RequestTimeout
                | StatusCode::PayloadTooLarge
                | StatusCode::InternalServerError
                | StatusCode::ServiceUnavailable
        ) {
            self.close = true;
        }
        self.set_response(response);
    }

    /// Emits a 302 redirect to `location` and completes the transaction.
    pub fn redirect(&mut self, location: &str) {
        let mut response = Response::new(self.request.http_version(), StatusCode::Found);
        response.set_location(location);
        response.set_content_type("text/html");
        response.set_body(Body::new(format!(
            "<html><head></head><body><a href=\"{0}\">{0}</a></body></html>",
            location
        )));
        self.set_response(response);
    }

    /// Consults the status redirect table to pick a destination for
    /// `status`. Without an entry, a success redirects to the site root
    /// and anything else renders the plain error page.
    pub fn redirect_by_status(&mut self, status: u16, redirects: &HashMap<u16, String>) {
        if let Some(target) = redirects.get(&status) {
            let target = target.clone();
            self.redirect(&target);
            return;
        }
        if status == 200 {
            self.redirect("/");
        } else {
            let reason = StatusCode::from_code(status).reason().to_string();
            self.error(status, &reason);
        }
    }

    /// Responds with an in-memory body and the given content type.
    pub fn respond(&mut self, status: u16, content_type: &str, body: &[u8]) {
        let mut response = Response::new(
            self.request.http_version(),
            StatusCode::from_code(status),
        );
        response.set_content_type(content_type);
        response.set_body(Body::new(body.to_vec()));
        self.set_response(response);
    }

    /// The status code the transaction settled on.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Hands the produced output to the connection. Falls back to a 500
    /// when a handler claimed the request but produced nothing.
    pub fn take_output(&mut self) -> TxOutput {
        if let Some(mut response) = self.response.take() {
            if let Some(cookie) = self.new_session_cookie.take() {
                response.set_cookie(cookie);
            }
            response.set_close(self.close || !self.request.keep_alive());
            // HEAD answers carry headers only; drop any body but keep the
            // announced length.
            if self.request.method() == Method::Head {
                if let Some(len) = response.content_length() {
                    let mut head_only =
                        Response::new(response.http_version(), response.status());
                    head_only.headers = std::mem::take(&mut response.headers);
                    head_only.set_content_length_only(len);
                    let _ = response.take_file_source();
                    return TxOutput::Response(Box::new(head_only));
                }
                let _ = response.take_file_source();
            }
            return TxOutput::Response(Box::new(response));
        }
        if self.head_written {
            return TxOutput::Raw(std::mem::take(&mut self.streamed));
        }
        let mut fallback = error_response(
            self.request.http_version(),
            StatusCode::InternalServerError,
            "No response was produced",
        );
        fallback.set_close(true);
        TxOutput::Response(Box::new(fallback))
    }

    /// Returns `true` when the response asked for `Connection: close`.
    pub fn wants_close(&self) -> bool {
        self.close || !self.request.keep_alive()
    }

    /// Detaches a file source queued by `set_response`, if any. Used by
    /// tests; the connection takes the source through the response.
    pub fn take_file_source(&mut self) -> Option<FileSource> {
        self.response.as_mut().and_then(Response::take_file_source)
    }
}
