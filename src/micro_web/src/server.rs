// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The server value owning all process-wide state, and the epoll event
//! loop driving connections on a single thread.
//!
//! The host creates a [`WebServer`], points it at a document root and an
//! optional route/auth file, binds an endpoint with [`WebServer::listen`]
//! and hands the thread to [`WebServer::service_events`]. Everything else
//! (route table, auth engine, session store, handler registry) lives
//! inside the server value and is reachable from action callbacks through
//! [`ServerCore`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::auth::{self, AuthStore};
use crate::common::ConnectionError;
use crate::config::{self, ConfigError};
use crate::connection::{HttpConnection, HttpLimits};
use crate::handlers::action::ActionHandler;
use crate::handlers::file::FileHandler;
use crate::handlers::redirect::RedirectHandler;
use crate::handlers::upload::UploadHandler;
use crate::handlers::{dispatch, AuthHandler, Handler};
use crate::response::{error_response, StatusCode};
use crate::router::{Route, RouteTable};
use crate::session::SessionStore;
use crate::transaction::{Transaction, TxOutput};
use utils::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use utils::time::monotonic_ms;

/// Upper bound on events handled per loop turn.
const MAX_EVENTS: usize = 64;
/// The answer sent to a connection over the capacity limit.
static SERVER_FULL_RESPONSE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
    Server: micro_web\r\n\
    Connection: close\r\n\
    Content-Length: 25\r\n\r\nToo many open connections";

/// Errors raised by the server lifecycle API.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A socket or epoll operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The listen endpoint could not be understood.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The route/auth file could not be loaded or saved.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// `service_events` was called before `listen`.
    #[error("Server is not listening")]
    NotListening,
}

/// Server tunables. Everything has a sensible default for an embedded
/// deployment; the builders override selectively.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Directory static documents are served from.
    pub docroot: PathBuf,
    /// Default document for directory requests.
    pub index: String,
    /// Authentication realm.
    pub realm: String,
    /// Wire-level size limits.
    pub limits: HttpLimits,
    /// Session idle lifetime, seconds.
    pub session_lifespan_secs: u64,
    /// Connection idle timeout, milliseconds.
    pub idle_timeout_ms: u64,
    /// Per-request wall-clock cap, milliseconds.
    pub request_timeout_ms: u64,
    /// Maximum simultaneous connections.
    pub max_connections: usize,
    /// Refuse PUT and DELETE on the document store.
    pub read_only: bool,
    /// Development switch bypassing authentication.
    pub auto_login: bool,
    /// Where the upload handler spools request bodies.
    pub upload_dir: PathBuf,
}

impl ServerConfig {
    /// Creates a configuration serving documents from `docroot`.
    pub fn new<P: Into<PathBuf>>(docroot: P) -> Self {
        Self {
            docroot: docroot.into(),
            index: "index.html".to_string(),
            realm: "site".to_string(),
            limits: HttpLimits::default(),
            session_lifespan_secs: 1800,
            idle_timeout_ms: 60_000,
            request_timeout_ms: 60_000,
            max_connections: 50,
            read_only: false,
            auto_login: false,
            upload_dir: std::env::temp_dir(),
        }
    }

    /// Sets the authentication realm.
    pub fn with_realm<S: Into<String>>(mut self, realm: S) -> Self {
        self.realm = realm.into();
        self
    }

    /// Sets the default document name.
    pub fn with_index<S: Into<String>>(mut self, index: S) -> Self {
        self.index = index.into();
        self
    }

    /// Sets the wire-level size limits.
    pub fn with_limits(mut self, limits: HttpLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the connection idle timeout.
    pub fn with_idle_timeout_ms(mut self, timeout: u64) -> Self {
        self.idle_timeout_ms = timeout;
        self
    }

    /// Sets the per-request wall-clock cap.
    pub fn with_request_timeout_ms(mut self, timeout: u64) -> Self {
        self.request_timeout_ms = timeout;
        self
    }

    /// Sets the connection capacity.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Makes the document store read-only.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enables the development auto-login bypass.
    pub fn with_auto_login(mut self, auto_login: bool) -> Self {
        self.auto_login = auto_login;
        self
    }

    /// Sets the upload spool directory.
    pub fn with_upload_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.upload_dir = dir.into();
        self
    }
}

/// An action callback. Runs on the event-loop thread with access to the
/// process-wide state and the transaction.
pub type ActionFn = Rc<RefCell<dyn FnMut(&mut ServerCore, &mut Transaction)>>;

/// The process-wide state shared by dispatch and action callbacks: the
/// route table, the auth engine, the session store, the status redirect
/// table and the action registry.
pub struct ServerCore {
    /// Server tunables.
    pub config: ServerConfig,
    /// The route table.
    pub router: RouteTable,
    /// The auth engine.
    pub auth: AuthStore,
    /// The session store.
    pub sessions: SessionStore,
    /// Destinations for `redirect_by_status`.
    pub redirects: HashMap<u16, String>,
    /// Named in-process action callbacks.
    pub actions: HashMap<String, ActionFn>,
}

impl ServerCore {
    /// Creates the core state from a configuration.
    pub fn new(config: ServerConfig) -> Self {
        let mut auth = AuthStore::new(config.realm.clone());
        auth.set_auto_login(config.auto_login);
        let sessions = SessionStore::new(config.session_lifespan_secs);
        Self {
            config,
            router: RouteTable::new(),
            auth,
            sessions,
            redirects: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    /// Reads a variable from the request's session.
    pub fn get_session_var(&mut self, tx: &mut Transaction, name: &str) -> Option<String> {
        auth::get_session(&mut self.sessions, tx, false)
            .and_then(|session| session.get_var(name).map(String::from))
    }

    /// Writes a variable into the request's session, creating the session
    /// if the request does not have one yet.
    pub fn set_session_var(&mut self, tx: &mut Transaction, name: &str, value: &str) {
        if let Some(session) = auth::get_session(&mut self.sessions, tx, true) {
            session.set_var(name, value);
        }
    }
}

/// The state of a connection in the event loop.
#[derive(Debug, PartialEq, Eq)]
enum ClientState {
    AwaitingIncoming,
    AwaitingOutgoing,
    Closed,
}

/// Wrapper over `HttpConnection` tracking the epoll interest, activity
/// timestamps and the close decision.
struct ClientConnection {
    connection: HttpConnection<TcpStream>,
    state: ClientState,
    interest: EventSet,
    last_activity: u64,
    request_started: Option<u64>,
}

impl ClientConnection {
    fn new(connection: HttpConnection<TcpStream>) -> Self {
        Self {
            connection,
            state: ClientState::AwaitingIncoming,
            interest: EventSet::IN,
            last_activity: monotonic_ms(),
            request_started: None,
        }
    }

    // Data arrived on the stream. Parse errors turn into the matching
    // error response and close the connection after it drains.
    fn read(&mut self) {
        match self.connection.try_read() {
            Ok(()) => {
                self.last_activity = monotonic_ms();
                if self.request_started.is_none() && self.connection.receiving_request() {
                    self.request_started = Some(self.last_activity);
                }
            }
            Err(ConnectionError::ConnectionClosed) => {
                self.state = ClientState::Closed;
            }
            Err(ConnectionError::ParseError(e)) => {
                let status = StatusCode::from_code(e.status_code());
                let mut response =
                    error_response(self.connection.http_version(), status, &e.to_string());
                response.set_close(true);
                if self.connection.enqueue_response(response).is_err() {
                    self.state = ClientState::Closed;
                }
            }
            Err(ConnectionError::StreamError(e)) => {
                debug!("connection read failed: {}", e);
                self.state = ClientState::Closed;
            }
            Err(ConnectionError::InvalidWrite) => {}
        }
    }

    // The stream is writable: drain queued bytes and run the background
    // writer.
    fn write(&mut self) {
        match self.connection.try_write() {
            Ok(()) => {
                self.last_activity = monotonic_ms();
            }
            Err(ConnectionError::InvalidWrite) => {}
            Err(e) => {
                debug!("connection write failed: {}", e);
                self.state = ClientState::Closed;
            }
        }
    }

    fn is_done(&self) -> bool {
        self.state == ClientState::Closed
    }
}

/// The embedded web server.
pub struct WebServer {
    /// The process-wide state, exposed for embedding code.
    pub core: ServerCore,
    handlers: Vec<Box<dyn Handler>>,
    epoll: Epoll,
    listener: Option<TcpListener>,
    connections: HashMap<RawFd, ClientConnection>,
}

impl WebServer {
    /// Creates a server over `docroot`, registers the built-in handlers
    /// and the login/logout actions, and loads `route_file` if given.
    /// Without a route file a single catch-all file route is installed.
    pub fn open<P: Into<PathBuf>>(
        docroot: P,
        route_file: Option<&Path>,
    ) -> Result<Self, ServerError> {
        Self::open_with_config(ServerConfig::new(docroot), route_file)
    }

    /// As [`WebServer::open`], with explicit configuration.
    pub fn open_with_config(
        config: ServerConfig,
        route_file: Option<&Path>,
    ) -> Result<Self, ServerError> {
        let mut core = ServerCore::new(config);
        if let Some(path) = route_file {
            config::load(path, &mut core.router, &mut core.auth, &mut core.redirects)?;
        }
        if core.router.is_empty() {
            core.router.add(Route::new("/"));
        }
        core.actions.insert(
            "login".to_string(),
            Rc::new(RefCell::new(
                |core: &mut ServerCore, tx: &mut Transaction| {
                    let (auth, sessions, redirects) =
                        (&mut core.auth, &mut core.sessions, &core.redirects);
                    auth::login_action(auth, sessions, redirects, tx);
                },
            )) as ActionFn,
        );
        core.actions.insert(
            "logout".to_string(),
            Rc::new(RefCell::new(
                |core: &mut ServerCore, tx: &mut Transaction| {
                    let (auth, sessions, redirects) =
                        (&mut core.auth, &mut core.sessions, &core.redirects);
                    auth::logout_action(auth, sessions, redirects, tx);
                },
            )) as ActionFn,
        );

        let handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(AuthHandler),
            Box::new(RedirectHandler),
            Box::new(ActionHandler),
            Box::new(UploadHandler),
            Box::new(FileHandler),
        ];
        Ok(Self {
            core,
            handlers,
            epoll: Epoll::new()?,
            listener: None,
            connections: HashMap::new(),
        })
    }

    /// Registers a custom handler behind the built-ins.
    pub fn define_handler(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Registers (or replaces) a named action under `/action/<name>`.
    pub fn define_action<F>(&mut self, name: &str, callback: F)
    where
        F: FnMut(&mut ServerCore, &mut Transaction) + 'static,
    {
        self.core
            .actions
            .insert(name.to_string(), Rc::new(RefCell::new(callback)) as ActionFn);
    }

    /// Adds a user to the auth engine.
    pub fn add_user(
        &mut self,
        name: &str,
        password: &str,
        roles: &str,
    ) -> Result<(), crate::auth::AuthError> {
        self.core.auth.add_user(name, password, roles)
    }

    /// Adds a role to the auth engine.
    pub fn add_role(
        &mut self,
        name: &str,
        abilities: std::collections::HashSet<String>,
    ) -> Result<(), crate::auth::AuthError> {
        self.core.auth.add_role(name, abilities)
    }

    /// Replaces a user's roles, recomputing their abilities.
    pub fn set_user_roles(
        &mut self,
        name: &str,
        roles: &str,
    ) -> Result<(), crate::auth::AuthError> {
        self.core.auth.set_user_roles(name, roles)
    }

    /// Installs a route.
    pub fn add_route(&mut self, route: Route) {
        self.core.router.add(route);
    }

    /// Writes the current route and auth state back to `path`.
    pub fn save_config(&self, path: &Path) -> Result<(), ServerError> {
        config::save(path, &self.core.router, &self.core.auth, &self.core.redirects)?;
        Ok(())
    }

    /// Binds the listening socket. The endpoint has the shape
    /// `[scheme://][host][:port]`; the host defaults to all interfaces
    /// and the port to 80.
    pub fn listen(&mut self, endpoint: &str) -> Result<SocketAddr, ServerError> {
        let (host, port) = parse_endpoint(endpoint)
            .ok_or_else(|| ServerError::InvalidEndpoint(endpoint.to_string()))?;
        let listener = TcpListener::bind((host.as_str(), port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        self.epoll.ctl(
            ControlOperation::Add,
            listener.as_raw_fd(),
            EpollEvent::new(EventSet::IN, listener.as_raw_fd() as u64),
        )?;
        self.listener = Some(listener);
        info!("listening on {}", addr);
        Ok(addr)
    }

    /// The bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Runs the event loop until `terminator` is set. Suspends only in
    /// `epoll_wait`; everything else runs to completion on this thread.
    pub fn service_events(&mut self, terminator: &AtomicBool) -> Result<(), ServerError> {
        if self.listener.is_none() {
            return Err(ServerError::NotListening);
        }
        while !terminator.load(Ordering::Relaxed) {
            self.service_once(500)?;
        }
        info!("service loop terminated");
        Ok(())
    }

    /// One event-loop turn: wait up to `timeout_ms` for socket events,
    /// exchange bytes, dispatch ready requests and sweep timeouts.
    pub fn service_once(&mut self, timeout_ms: i32) -> Result<(), ServerError> {
        let mut events = vec![EpollEvent::default(); MAX_EVENTS];
        let count = match self.epoll.wait(timeout_ms, &mut events) {
            Ok(count) => count,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(ServerError::Io(e)),
        };

        let listener_fd = self.listener.as_ref().map(TcpListener::as_raw_fd);
        for event in events.iter().take(count) {
            let fd = event.fd();
            if Some(fd) == listener_fd {
                self.accept_connections();
                continue;
            }
            let Some(client) = self.connections.get_mut(&fd) else {
                continue;
            };
            let set = event.event_set();
            if set.intersects(EventSet::ERROR | EventSet::READ_HANG_UP | EventSet::HANG_UP) {
                // Let the read path observe the close.
                client.read();
            } else if set.contains(EventSet::IN) {
                client.read();
            } else if set.contains(EventSet::OUT) {
                client.write();
            }
        }

        self.advance_connections();
        self.sweep_timeouts();
        self.core.sessions.sweep();
        Ok(())
    }

    /// Stops listening, drops all connections and closes the handlers.
    pub fn close(&mut self) {
        self.connections.clear();
        self.listener = None;
        for handler in &mut self.handlers {
            handler.close();
        }
        info!("server closed");
    }

    // Accepts whatever the backlog holds. Connections over capacity get a
    // canned 503 and are dropped on the spot.
    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.core.config.max_connections {
                        let _ = stream.write(SERVER_FULL_RESPONSE);
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("cannot make connection non-blocking: {}", e);
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    if let Err(e) = self.epoll.ctl(
                        ControlOperation::Add,
                        fd,
                        EpollEvent::new(EventSet::IN, fd as u64),
                    ) {
                        warn!("cannot watch connection: {}", e);
                        continue;
                    }
                    debug!("accepted connection from {}", peer);
                    let limits = self.core.config.limits.clone();
                    self.connections
                        .insert(fd, ClientConnection::new(HttpConnection::new(stream, limits)));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    // Dispatches ready requests, drains what the sockets accept, updates
    // the epoll interest and reaps finished connections.
    fn advance_connections(&mut self) {
        let Self {
            core,
            handlers,
            epoll,
            connections,
            ..
        } = self;

        let mut dead: Vec<RawFd> = Vec::new();
        for (fd, client) in connections.iter_mut() {
            // A parsed request is dispatched only once the previous
            // response fully drained, keeping responses ordered.
            if client.state != ClientState::Closed && !client.connection.pending_write() {
                if let Some(request) = client.connection.pop_parsed_request() {
                    Self::run_request(core, handlers, client, request);
                    // Pick up a pipelined successor that arrived in the
                    // same read.
                    if let Err(e) = client.connection.parse_buffered() {
                        debug!("pipelined parse failed: {}", e);
                        client.connection.set_close_after_write();
                    }
                }
            }

            // Opportunistic drain; the socket is usually writable.
            if client.state != ClientState::Closed && client.connection.pending_write() {
                client.write();
            }

            if client.connection.receiving_request() || client.connection.pending_write() {
                if client.request_started.is_none() {
                    client.request_started = Some(monotonic_ms());
                }
            } else {
                client.request_started = None;
            }

            if client.state != ClientState::Closed
                && client.connection.close_requested()
                && !client.connection.pending_write()
            {
                client.state = ClientState::Closed;
            }

            if client.state == ClientState::Closed {
                dead.push(*fd);
                continue;
            }

            let desired = if client.connection.pending_write() {
                ClientState::AwaitingOutgoing
            } else {
                ClientState::AwaitingIncoming
            };
            let interest = match desired {
                ClientState::AwaitingOutgoing => EventSet::OUT,
                _ => EventSet::IN,
            };
            if interest != client.interest {
                if let Err(e) =
                    epoll.ctl(ControlOperation::Modify, *fd, EpollEvent::new(interest, *fd as u64))
                {
                    warn!("cannot update connection interest: {}", e);
                    client.state = ClientState::Closed;
                    dead.push(*fd);
                    continue;
                }
                client.interest = interest;
            }
            client.state = desired;
        }
        for fd in dead {
            // Dropping the stream closes the fd, which also removes it
            // from the epoll interest list.
            self.connections.remove(&fd);
        }
    }

    // Routes, authenticates and dispatches one request, then queues its
    // response on the connection.
    fn run_request(
        core: &mut ServerCore,
        handlers: &mut [Box<dyn Handler>],
        client: &mut ClientConnection,
        request: crate::request::Request,
    ) {
        let mut tx = Transaction::new(request);
        if let Some((scheme, details)) = tx.request.headers.authorization() {
            tx.auth.auth_type = Some(scheme.to_string());
            tx.auth.details = Some(details.to_string());
        }

        let route = core.router.select(
            tx.request.path(),
            tx.request.method(),
            tx.request.extension().as_deref(),
        );
        match route {
            Some(route) => {
                tx.set_route(route);
                dispatch(handlers, core, &mut tx);
            }
            None => tx.error(404, "No route for request"),
        }

        let close = tx.wants_close();
        match tx.take_output() {
            TxOutput::Response(response) => {
                if let Err(e) = client.connection.enqueue_response(*response) {
                    debug!("cannot queue response: {}", e);
                    client.state = ClientState::Closed;
                }
            }
            TxOutput::Raw(bytes) => {
                if let Err(e) = client.connection.enqueue_raw(&bytes) {
                    debug!("cannot queue response: {}", e);
                    client.state = ClientState::Closed;
                }
                if close {
                    client.connection.set_close_after_write();
                }
            }
        }
        client.request_started = None;
    }

    // Applies the idle and per-request timers.
    fn sweep_timeouts(&mut self) {
        let now = monotonic_ms();
        let idle_timeout = self.core.config.idle_timeout_ms;
        let request_timeout = self.core.config.request_timeout_ms;
        let mut dead: Vec<RawFd> = Vec::new();

        for (fd, client) in self.connections.iter_mut() {
            if client.state == ClientState::Closed {
                continue;
            }
            if let Some(started) = client.request_started {
                if request_timeout > 0 && now.saturating_sub(started) > request_timeout {
                    // The request ran over its wall-clock cap.
                    let mut response = error_response(
                        client.connection.http_version(),
                        StatusCode::RequestTimeout,
                        "Request timed out",
                    );
                    response.set_close(true);
                    if client.connection.enqueue_response(response).is_err() {
                        client.state = ClientState::Closed;
                        dead.push(*fd);
                        continue;
                    }
                    client.write();
                    client.request_started = None;
                }
            } else if idle_timeout > 0 && now.saturating_sub(client.last_activity) > idle_timeout {
                debug!("closing idle connection");
                client.state = ClientState::Closed;
                dead.push(*fd);
            }
        }
        for fd in dead {
            self.connections.remove(&fd);
        }
    }
}

// `[scheme://][host][:port]` into a bindable pair.
fn parse_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let rest = match endpoint.split_once("://") {
        Some(("http", rest)) => rest,
        Some(_) => return None,
        None => endpoint,
    };
    if rest.is_empty() {
        return Some(("0.0.0.0".to_string(), 80));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().ok()?;
            let host = if host.is_empty() { "0.0.0.0" } else { host };
            Some((host.to_string(), port))
        }
        None => Some((rest.to_string(), 80)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthType;
    use std::io::Read;
    use utils::tempfile::TempDir;

    fn pump(server: &mut WebServer, passes: usize) {
        for _ in 0..passes {
            server.service_once(10).unwrap();
        }
    }

    // Sends one request and pumps the server until the response is
    // complete (by Content-Length, chunked terminator or connection
    // close).
    fn exchange(server: &mut WebServer, client: &mut TcpStream, request: &[u8]) -> Vec<u8> {
        client.write_all(request).unwrap();
        client.set_nonblocking(true).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..100 {
            pump(server, 1);
            loop {
                match client.read(&mut buf) {
                    Ok(0) => return received,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {}", e),
                }
            }
            if response_complete(&received) {
                break;
            }
        }
        received
    }

    fn response_complete(received: &[u8]) -> bool {
        let Some(head_end) = received.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&received[..head_end + 4]).to_lowercase();
        let body = &received[head_end + 4..];
        if head.contains("transfer-encoding: chunked") {
            return received.ends_with(b"0\r\n\r\n");
        }
        for line in head.lines() {
            if let Some(value) = line.strip_prefix("content-length: ") {
                if let Ok(length) = value.trim().parse::<usize>() {
                    return body.len() >= length;
                }
            }
        }
        true
    }

    fn serve(config: ServerConfig) -> (WebServer, SocketAddr) {
        let mut server = WebServer::open_with_config(config, None).unwrap();
        let addr = server.listen("http://127.0.0.1:0").unwrap();
        (server, addr)
    }

    fn connect(server: &mut WebServer, addr: SocketAddr) -> TcpStream {
        let client = TcpStream::connect(addr).unwrap();
        // Let the accept land.
        pump(server, 2);
        client
    }

    fn body_of(response: &[u8]) -> &[u8] {
        let head_end = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        &response[head_end + 4..]
    }

    fn header_of<'a>(response: &'a [u8], name: &str) -> Option<String> {
        let text = String::from_utf8_lossy(response);
        let name = format!("{}: ", name.to_lowercase());
        text.lines()
            .find(|line| line.to_lowercase().starts_with(&name))
            .map(|line| line[name.len()..].trim().to_string())
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("http://127.0.0.1:8080"),
            Some(("127.0.0.1".to_string(), 8080))
        );
        assert_eq!(parse_endpoint(":9090"), Some(("0.0.0.0".to_string(), 9090)));
        assert_eq!(
            parse_endpoint("device.local"),
            Some(("device.local".to_string(), 80))
        );
        assert_eq!(parse_endpoint(""), Some(("0.0.0.0".to_string(), 80)));
        assert_eq!(parse_endpoint("https://x:1"), None);
        assert_eq!(parse_endpoint("host:badport"), None);
    }

    #[test]
    fn test_static_get_end_to_end() {
        let docroot = TempDir::new().unwrap();
        let payload = b"The quick brown fox jumps over the lazy dog..";
        std::fs::write(docroot.as_path().join("index.html"), payload).unwrap();
        let (mut server, addr) = serve(ServerConfig::new(docroot.as_path()));
        let mut client = connect(&mut server, addr);

        let response = exchange(
            &mut server,
            &mut client,
            b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert_eq!(
            header_of(&response, "Content-Length").unwrap(),
            payload.len().to_string()
        );
        assert!(header_of(&response, "Last-Modified").is_some());
        assert!(header_of(&response, "Date").is_some());
        assert_eq!(body_of(&response), payload);
    }

    #[test]
    fn test_if_modified_since_end_to_end() {
        let docroot = TempDir::new().unwrap();
        std::fs::write(docroot.as_path().join("index.html"), b"payload").unwrap();
        let (mut server, addr) = serve(ServerConfig::new(docroot.as_path()));
        let mut client = connect(&mut server, addr);

        // First fetch reveals the Last-Modified stamp.
        let first = exchange(
            &mut server,
            &mut client,
            b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let stamp = header_of(&first, "Last-Modified").unwrap();

        let request = format!(
            "GET /index.html HTTP/1.1\r\nHost: x\r\nIf-Modified-Since: {}\r\n\r\n",
            stamp
        );
        let second = exchange(&mut server, &mut client, request.as_bytes());
        let text = String::from_utf8_lossy(&second);
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{}", text);
        assert!(body_of(&second).is_empty());
    }

    #[test]
    fn test_basic_auth_challenge_and_success() {
        let docroot = TempDir::new().unwrap();
        std::fs::create_dir(docroot.as_path().join("admin")).unwrap();
        std::fs::write(docroot.as_path().join("admin/index.html"), b"secret").unwrap();

        let (mut server, addr) = serve(ServerConfig::new(docroot.as_path()));
        server
            .core
            .router
            .add(Route::new("/admin/").with_auth(AuthType::Basic));
        server.core.auth.add_user("alice", "pw", "admin").unwrap();

        let mut client = connect(&mut server, addr);
        let denied = exchange(
            &mut server,
            &mut client,
            b"GET /admin/index.html HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let text = String::from_utf8_lossy(&denied);
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "{}", text);
        assert_eq!(
            header_of(&denied, "WWW-Authenticate").unwrap(),
            "Basic realm=\"site\""
        );

        let granted = exchange(
            &mut server,
            &mut client,
            b"GET /admin/index.html HTTP/1.1\r\nHost: x\r\n\
              Authorization: Basic YWxpY2U6cHc=\r\n\r\n",
        );
        let text = String::from_utf8_lossy(&granted);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert_eq!(body_of(&granted), b"secret");
    }

    #[test]
    fn test_form_login_session_end_to_end() {
        let docroot = TempDir::new().unwrap();
        std::fs::create_dir(docroot.as_path().join("admin")).unwrap();
        std::fs::write(docroot.as_path().join("admin/index.html"), b"panel").unwrap();

        let (mut server, addr) = serve(ServerConfig::new(docroot.as_path()));
        server
            .core
            .router
            .add(Route::new("/admin/").with_auth(AuthType::Form));
        // The login action itself must be reachable without credentials.
        server
            .core
            .router
            .add(Route::new("/action/").with_handlers(["action"]));
        server.core.auth.add_user("alice", "pw", "admin").unwrap();
        server
            .core
            .redirects
            .insert(401, "/login.html".to_string());

        // Unauthenticated access redirects to the login page.
        let mut client = connect(&mut server, addr);
        let denied = exchange(
            &mut server,
            &mut client,
            b"GET /admin/index.html HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert!(String::from_utf8_lossy(&denied).starts_with("HTTP/1.1 302 Found\r\n"));
        assert_eq!(header_of(&denied, "Location").unwrap(), "/login.html");

        // Login via the form action.
        let mut client = connect(&mut server, addr);
        let body = "username=alice&password=pw";
        let request = format!(
            "POST /action/login HTTP/1.1\r\nHost: x\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let login = exchange(&mut server, &mut client, request.as_bytes());
        let text = String::from_utf8_lossy(&login);
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"), "{}", text);
        assert_eq!(header_of(&login, "Location").unwrap(), "/");
        let cookie = header_of(&login, "Set-Cookie").unwrap();
        let session_pair = cookie.split(';').next().unwrap().to_string();

        // The session cookie now opens the gated route with no challenge.
        let mut client = connect(&mut server, addr);
        let request = format!(
            "GET /admin/index.html HTTP/1.1\r\nHost: x\r\nCookie: {}\r\n\r\n",
            session_pair
        );
        let granted = exchange(&mut server, &mut client, request.as_bytes());
        let text = String::from_utf8_lossy(&granted);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert_eq!(body_of(&granted), b"panel");
    }

    #[test]
    fn test_chunked_upload_over_limit_closes() {
        let docroot = TempDir::new().unwrap();
        let mut limits = HttpLimits::default();
        limits.max_body_len = 64;
        let config = ServerConfig::new(docroot.as_path()).with_limits(limits);
        let (mut server, addr) = serve(config);
        let mut client = connect(&mut server, addr);

        // 5 chunks of 32 bytes cross the 64 byte cap.
        let mut request: Vec<u8> =
            b"PUT /spool.bin HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for _ in 0..5 {
            request.extend_from_slice(b"20\r\n");
            request.extend_from_slice(&[b'x'; 32]);
            request.extend_from_slice(b"\r\n");
        }
        request.extend_from_slice(b"0\r\n\r\n");

        let response = exchange(&mut server, &mut client, &request);
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{}", text);
        assert!(text.to_lowercase().contains("connection: close"));

        // The server closes the connection after the error drains.
        pump(&mut server, 3);
        let mut buf = [0u8; 16];
        let closed = matches!(client.read(&mut buf), Ok(0));
        assert!(closed);
    }

    #[test]
    fn test_keep_alive_two_requests_one_connection() {
        let docroot = TempDir::new().unwrap();
        std::fs::write(docroot.as_path().join("a.txt"), b"first").unwrap();
        std::fs::write(docroot.as_path().join("b.txt"), b"second").unwrap();
        let (mut server, addr) = serve(ServerConfig::new(docroot.as_path()));
        let mut client = connect(&mut server, addr);

        let first = exchange(
            &mut server,
            &mut client,
            b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(body_of(&first), b"first");
        let second = exchange(
            &mut server,
            &mut client,
            b"GET /b.txt HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(body_of(&second), b"second");
        assert_eq!(server_connection_count(&server), 1);
    }

    fn server_connection_count(server: &WebServer) -> usize {
        server.connections.len()
    }

    #[test]
    fn test_http10_closes_by_default() {
        let docroot = TempDir::new().unwrap();
        std::fs::write(docroot.as_path().join("a.txt"), b"x").unwrap();
        let (mut server, addr) = serve(ServerConfig::new(docroot.as_path()));
        let mut client = connect(&mut server, addr);

        let response = exchange(
            &mut server,
            &mut client,
            b"GET /a.txt HTTP/1.0\r\nHost: x\r\n\r\n",
        );
        assert!(String::from_utf8_lossy(&response)
            .to_lowercase()
            .contains("connection: close"));
        pump(&mut server, 3);
        let mut buf = [0u8; 16];
        assert!(matches!(client.read(&mut buf), Ok(0)));
    }

    #[test]
    fn test_custom_action_end_to_end() {
        let docroot = TempDir::new().unwrap();
        let (mut server, addr) = serve(ServerConfig::new(docroot.as_path()));
        server
            .core
            .router
            .add(Route::new("/action/").with_handlers(["action"]));
        server.define_action("status", |_core, tx| {
            let device = tx.var("device", "unknown").to_string();
            tx.set_content_type("text/plain");
            tx.write(format!("status of {}", device).as_bytes());
            tx.done();
        });

        let mut client = connect(&mut server, addr);
        let response = exchange(
            &mut server,
            &mut client,
            b"GET /action/status?device=eth0 HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("status of eth0"));
    }

    #[test]
    fn test_request_timeout_answers_408() {
        let docroot = TempDir::new().unwrap();
        let config = ServerConfig::new(docroot.as_path()).with_request_timeout_ms(30);
        let (mut server, addr) = serve(config);
        let mut client = connect(&mut server, addr);

        // A request head that never completes.
        client.write_all(b"GET /slow HTTP/1.1\r\nHost:").unwrap();
        pump(&mut server, 2);
        std::thread::sleep(std::time::Duration::from_millis(50));
        pump(&mut server, 3);

        client.set_nonblocking(true).unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        for _ in 0..20 {
            pump(&mut server, 1);
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert!(String::from_utf8_lossy(&received).starts_with("HTTP/1.1 408 Request Timeout\r\n"));
    }

    #[test]
    fn test_idle_connection_reaped() {
        let docroot = TempDir::new().unwrap();
        let config = ServerConfig::new(docroot.as_path()).with_idle_timeout_ms(20);
        let (mut server, addr) = serve(config);
        let _client = connect(&mut server, addr);
        assert_eq!(server_connection_count(&server), 1);

        std::thread::sleep(std::time::Duration::from_millis(40));
        pump(&mut server, 2);
        assert_eq!(server_connection_count(&server), 0);
    }

    #[test]
    fn test_server_full_gets_503() {
        let docroot = TempDir::new().unwrap();
        let config = ServerConfig::new(docroot.as_path()).with_max_connections(1);
        let (mut server, addr) = serve(config);
        let _first = connect(&mut server, addr);

        let mut second = TcpStream::connect(addr).unwrap();
        pump(&mut server, 3);
        let mut response = Vec::new();
        second
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        let mut buf = [0u8; 256];
        loop {
            match second.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        assert!(String::from_utf8_lossy(&response)
            .starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }

    #[test]
    fn test_no_route_is_404() {
        let docroot = TempDir::new().unwrap();
        let mut server = WebServer::open_with_config(
            ServerConfig::new(docroot.as_path()),
            None,
        )
        .unwrap();
        // Replace the catch-all with a narrow route.
        server.core.router.remove("/");
        server
            .core
            .router
            .add(Route::new("/api/").with_handlers(["action"]));
        let addr = server.listen("127.0.0.1:0").unwrap();

        let mut client = connect(&mut server, addr);
        let response = exchange(
            &mut server,
            &mut client,
            b"GET /other HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn test_service_events_honors_terminator() {
        let docroot = TempDir::new().unwrap();
        let (mut server, _addr) = serve(ServerConfig::new(docroot.as_path()));
        let terminator = AtomicBool::new(true);
        // Already set: the loop exits without blocking.
        server.service_events(&terminator).unwrap();

        let mut unbound =
            WebServer::open_with_config(ServerConfig::new(docroot.as_path()), None).unwrap();
        assert!(matches!(
            unbound.service_events(&AtomicBool::new(true)),
            Err(ServerError::NotListening)
        ));
    }
}
