// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The server side session store: a cookie-keyed map of per-client
//! variable bags with idle expiry.

use std::collections::HashMap;

use utils::rand;
use utils::time::monotonic_ms;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "-goahead-session-";

/// Session identifiers carry 16 CSPRNG bytes, hex encoded.
const SESSION_ID_BYTES: usize = 16;

/// A per-client variable bag, addressed by the session cookie.
#[derive(Debug)]
pub struct Session {
    id: String,
    vars: HashMap<String, String>,
    /// Monotonic deadline after which the session is evicted.
    expires: u64,
}

impl Session {
    /// Returns the opaque session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the value of `name`, if set.
    pub fn get_var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Sets `name` to `value`.
    pub fn set_var<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.vars.insert(name.into(), value.into());
    }

    /// Removes `name`, returning its previous value.
    pub fn remove_var(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }
}

/// Store of all live sessions, owned by the server value.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    lifespan_ms: u64,
}

impl SessionStore {
    /// Creates a store whose sessions expire after `lifespan_secs` of
    /// inactivity.
    pub fn new(lifespan_secs: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            lifespan_ms: lifespan_secs * 1000,
        }
    }

    /// Creates a session with a fresh identifier and returns its id.
    pub fn create(&mut self) -> String {
        let id = rand::hex_token(SESSION_ID_BYTES);
        let session = Session {
            id: id.clone(),
            vars: HashMap::new(),
            expires: monotonic_ms() + self.lifespan_ms,
        };
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Looks up a session by id. An expired session is evicted and
    /// reported as absent; a live one has its expiry refreshed.
    pub fn lookup(&mut self, id: &str) -> Option<&mut Session> {
        let now = monotonic_ms();
        if let Some(session) = self.sessions.get(id) {
            if session.expires < now {
                self.sessions.remove(id);
                return None;
            }
        }
        let lifespan = self.lifespan_ms;
        self.sessions.get_mut(id).map(|session| {
            session.expires = now + lifespan;
            session
        })
    }

    /// Drops the session `id`.
    pub fn remove(&mut self, id: &str) {
        self.sessions.remove(id);
    }

    /// Evicts every expired session. Called periodically from the event
    /// loop.
    pub fn sweep(&mut self) {
        let now = monotonic_ms();
        self.sessions.retain(|_, session| session.expires >= now);
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` when no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Extracts the session id from a `Cookie` request header value.
pub fn session_id_from_cookie(cookie: &str) -> Option<String> {
    for pair in cookie.split(';') {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => continue,
        };
        if name == SESSION_COOKIE && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Builds the `Set-Cookie` value announcing a newly created session.
pub fn session_cookie(id: &str) -> String {
    format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, id)
}
