// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Authorization management.
//!
//! Users have passwords and a list of roles; a role bundles abilities
//! (verb-like tokens such as `add` or `shutdown`) and may nest other
//! roles. Routes name the abilities they require; once a user is
//! authenticated, their expanded ability set is checked against the
//! route's.
//!
//! Three authentication protocols are supported: HTTP Basic, HTTP Digest
//! (RFC 2617) and web form login. A verified identity is cached in the
//! session store so subsequent requests on the same cookie skip
//! re-verification.

use std::collections::{HashMap, HashSet};

use log::{error, trace};

use crate::common::codec::{base64_decode, base64_encode, constant_time_eq, md5_hex};
use crate::session::{session_id_from_cookie, Session, SessionStore};
use crate::transaction::Transaction;

/// Session variable holding the authenticated username.
pub const SESSION_USERNAME: &str = "_username_";
/// Session variable a login page may set to send the user back after a
/// successful login.
pub const SESSION_REFERRER: &str = "referrer";

/// Role references deeper than this are reported and ignored.
const ROLE_DEPTH_LIMIT: usize = 20;
/// Digest nonces older than this many seconds are stale.
const NONCE_LIFETIME_SECS: i64 = 5 * 60;
/// The opaque token is unused by this implementation; any constant serves.
const DIGEST_OPAQUE: &str = "5ccc069c403ebaf9f0171e9517f40e41";

/// The authentication protocol gating a route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthType {
    /// No authentication required.
    #[default]
    None,
    /// HTTP Basic authentication.
    Basic,
    /// HTTP Digest authentication (RFC 2617).
    Digest,
    /// Web form login backed by the session store.
    Form,
}

impl AuthType {
    /// Parses the configuration file token for an auth type.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "none" => Some(Self::None),
            "basic" => Some(Self::Basic),
            "digest" => Some(Self::Digest),
            "form" => Some(Self::Form),
            _ => None,
        }
    }

    /// The configuration file token for this auth type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Digest => "digest",
            Self::Form => "form",
        }
    }

    /// The `Authorization` header scheme matching this auth type, if it
    /// uses one.
    fn scheme(self) -> Option<&'static str> {
        match self {
            Self::Basic => Some("basic"),
            Self::Digest => Some("digest"),
            Self::None | Self::Form => None,
        }
    }
}

/// Per-request authentication state, accumulated while credentials are
/// parsed and verified.
#[derive(Debug, Default)]
pub struct AuthState {
    /// Scheme of the request's `Authorization` header, lowercased.
    pub auth_type: Option<String>,
    /// The detail portion of the `Authorization` header.
    pub details: Option<String>,
    /// The claimed username.
    pub username: Option<String>,
    /// The password or, for digest, the client's response digest. Once
    /// `encoded` is set this holds the HA1 form.
    pub password: Option<String>,
    /// Set when `password` has been reduced to its MD5 HA1 form.
    pub encoded: bool,
    /// Digest credential fields, as received.
    pub realm: Option<String>,
    /// Server nonce echoed by the client.
    pub nonce: Option<String>,
    /// Nonce use count.
    pub nc: Option<String>,
    /// Client nonce.
    pub cnonce: Option<String>,
    /// Quality of protection token.
    pub qop: Option<String>,
    /// Opaque token echoed by the client.
    pub opaque: Option<String>,
    /// The URI the client computed its digest over.
    pub digest_uri: Option<String>,
    /// The digest this server expects for the stored credentials.
    pub expected_digest: Option<String>,
    /// Cached decision, making `authenticate` idempotent per request.
    decision: Option<bool>,
}

/// A user record: credentials, the raw role list and the expanded
/// abilities.
#[derive(Debug)]
pub struct User {
    name: String,
    /// Cleartext or pre-hashed HA1, as loaded.
    password: String,
    roles: String,
    abilities: HashSet<String>,
}

impl User {
    /// The unique username.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw role list, as configured.
    pub fn roles(&self) -> &str {
        &self.roles
    }

    /// The stored password field.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// The expanded ability set.
    pub fn abilities(&self) -> &HashSet<String> {
        &self.abilities
    }
}

/// A named bundle of abilities.
#[derive(Debug)]
pub struct Role {
    abilities: HashSet<String>,
}

impl Role {
    /// The direct (unexpanded) abilities of the role.
    pub fn abilities(&self) -> &HashSet<String> {
        &self.abilities
    }
}

/// Errors from the user and role management API.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The user already exists.
    #[error("User {0} already exists")]
    UserExists(String),
    /// No user with the given name.
    #[error("Unknown user {0}")]
    UnknownUser(String),
    /// The role already exists.
    #[error("Role {0} already exists")]
    RoleExists(String),
    /// No role with the given name.
    #[error("Unknown role {0}")]
    UnknownRole(String),
    /// A user or role name was empty.
    #[error("Missing name")]
    MissingName,
}

/// The authentication engine: user and role tables, the server secret and
/// the per-protocol verifiers.
#[derive(Debug)]
pub struct AuthStore {
    users: HashMap<String, User>,
    roles: HashMap<String, Role>,
    /// Server secret embedded in digest nonces, drawn from the CSPRNG.
    secret: String,
    realm: String,
    /// Development switch that bypasses all authentication.
    auto_login: bool,
    nonce_counter: u64,
}

/// Outcome of parsing digest credentials.
#[derive(Debug, PartialEq, Eq)]
enum DigestOutcome {
    Ok,
    /// Required fields missing or unparseable: a client error.
    Malformed,
    /// Credentials well-formed but not acceptable (realm, qop or secret
    /// mismatch, unknown user).
    Rejected,
    /// The nonce aged out; the client should retry with a fresh one.
    Stale,
}

impl AuthStore {
    /// Creates an engine for `realm` with a fresh server secret.
    pub fn new<R: Into<String>>(realm: R) -> Self {
        Self {
            users: HashMap::new(),
            roles: HashMap::new(),
            secret: utils::rand::hex_token(16),
            realm: realm.into(),
            auto_login: false,
            nonce_counter: 0,
        }
    }

    /// The authentication realm.
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Enables or disables the development auto-login bypass.
    pub fn set_auto_login(&mut self, enabled: bool) {
        self.auto_login = enabled;
    }

    /// Returns `true` when authentication is bypassed.
    pub fn auto_login(&self) -> bool {
        self.auto_login
    }

    // ---- user and role management --------------------------------------

    /// Adds a user with a password (cleartext or HA1) and a role list,
    /// computing the expanded abilities.
    ///
    /// # Errors
    /// `UserExists` when the name is taken, `MissingName` when it is empty.
    pub fn add_user(&mut self, name: &str, password: &str, roles: &str) -> Result<(), AuthError> {
        if name.is_empty() {
            return Err(AuthError::MissingName);
        }
        if self.users.contains_key(name) {
            return Err(AuthError::UserExists(name.to_string()));
        }
        let abilities = self.compute_abilities_for(roles);
        self.users.insert(
            name.to_string(),
            User {
                name: name.to_string(),
                password: password.to_string(),
                roles: roles.to_string(),
                abilities,
            },
        );
        Ok(())
    }

    /// Removes a user.
    ///
    /// # Errors
    /// `UnknownUser` when no such user exists.
    pub fn remove_user(&mut self, name: &str) -> Result<(), AuthError> {
        self.users
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AuthError::UnknownUser(name.to_string()))
    }

    /// Replaces a user's role list and recomputes their abilities.
    ///
    /// # Errors
    /// `UnknownUser` when no such user exists.
    pub fn set_user_roles(&mut self, name: &str, roles: &str) -> Result<(), AuthError> {
        let abilities = self.compute_abilities_for(roles);
        let user = self
            .users
            .get_mut(name)
            .ok_or_else(|| AuthError::UnknownUser(name.to_string()))?;
        user.roles = roles.to_string();
        user.abilities = abilities;
        Ok(())
    }

    /// Looks up a user by name.
    pub fn lookup_user(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    /// Iterates all users.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Adds a role with its direct abilities.
    ///
    /// # Errors
    /// `RoleExists` when the name is taken, `MissingName` when it is empty.
    pub fn add_role(&mut self, name: &str, abilities: HashSet<String>) -> Result<(), AuthError> {
        if name.is_empty() {
            return Err(AuthError::MissingName);
        }
        if self.roles.contains_key(name) {
            return Err(AuthError::RoleExists(name.to_string()));
        }
        self.roles.insert(name.to_string(), Role { abilities });
        Ok(())
    }

    /// Removes a role. Abilities of users referencing the role are not
    /// recomputed until their role list changes.
    ///
    /// # Errors
    /// `UnknownRole` when no such role exists.
    pub fn remove_role(&mut self, name: &str) -> Result<(), AuthError> {
        self.roles
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AuthError::UnknownRole(name.to_string()))
    }

    /// Looks up a role by name.
    pub fn lookup_role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    /// Iterates all roles with their names.
    pub fn roles(&self) -> impl Iterator<Item = (&String, &Role)> {
        self.roles.iter()
    }

    /// Recomputes the ability set of every user, after bulk changes such
    /// as a configuration load.
    pub fn compute_all_abilities(&mut self) {
        let names: Vec<String> = self.users.keys().cloned().collect();
        for name in names {
            let roles = self.users[&name].roles.clone();
            let abilities = self.compute_abilities_for(&roles);
            if let Some(user) = self.users.get_mut(&name) {
                user.abilities = abilities;
            }
        }
    }

    fn compute_abilities_for(&self, roles: &str) -> HashSet<String> {
        let mut abilities = HashSet::new();
        for token in roles
            .split([' ', '\t', ','])
            .filter(|token| !token.is_empty())
        {
            self.expand_ability(&mut abilities, token, 0);
        }
        abilities
    }

    // A token naming a role expands recursively; any other token is taken
    // directly as an ability.
    fn expand_ability(&self, into: &mut HashSet<String>, token: &str, depth: usize) {
        if depth > ROLE_DEPTH_LIMIT {
            error!("Recursive ability definition for {}", token);
            return;
        }
        match self.roles.get(token) {
            Some(role) => {
                for ability in &role.abilities {
                    self.expand_ability(into, ability, depth + 1);
                }
            }
            None => {
                into.insert(token.to_string());
            }
        }
    }

    /// Returns `true` when `username` exists and holds every ability in
    /// `required`.
    pub fn can(&self, username: &str, required: &HashSet<String>) -> bool {
        match self.users.get(username) {
            Some(user) => required.is_subset(&user.abilities),
            None => false,
        }
    }

    // ---- password verification -----------------------------------------

    // The stored password reduced to HA1 form. A 32-hex-digit field is
    // taken to already be MD5(user:realm:password).
    fn stored_ha1(&self, user: &User) -> String {
        let is_ha1 =
            user.password.len() == 32 && user.password.bytes().all(|b| b.is_ascii_hexdigit());
        if is_ha1 {
            user.password.to_ascii_lowercase()
        } else {
            md5_hex(format!("{}:{}:{}", user.name, self.realm, user.password).as_bytes())
        }
    }

    /// Verifies the credentials in `auth` against the user table. The
    /// cleartext password, if present, is reduced to HA1 first; for digest
    /// requests the client's response is compared against the expected
    /// digest computed while parsing.
    pub fn verify_transaction(&self, auth: &mut AuthState) -> bool {
        let Some(username) = auth.username.clone() else {
            return false;
        };
        if !auth.encoded {
            let cleartext = auth.password.clone().unwrap_or_default();
            auth.password = Some(md5_hex(
                format!("{}:{}:{}", username, self.realm, cleartext).as_bytes(),
            ));
            auth.encoded = true;
        }
        let Some(user) = self.users.get(&username) else {
            trace!("verify: unknown user \"{}\"", username);
            return false;
        };
        let presented = auth.password.clone().unwrap_or_default();
        let success = match auth.expected_digest {
            Some(ref expected) => constant_time_eq(presented.as_bytes(), expected.as_bytes()),
            None => constant_time_eq(presented.as_bytes(), self.stored_ha1(user).as_bytes()),
        };
        if success {
            trace!("User \"{}\" authenticated", username);
        } else {
            trace!("Password for user \"{}\" failed to authenticate", username);
        }
        success
    }

    // ---- challenges and nonces -----------------------------------------

    /// The `WWW-Authenticate` value for a basic challenge.
    pub fn basic_challenge(&self) -> String {
        format!("Basic realm=\"{}\"", self.realm)
    }

    /// The `WWW-Authenticate` value for a digest challenge.
    pub fn digest_challenge(&mut self, stale: bool) -> String {
        let nonce = self.create_nonce();
        format!(
            "Digest realm=\"{}\", domain=\"/\", qop=\"auth\", nonce=\"{}\", opaque=\"{}\", \
             algorithm=\"MD5\", stale=\"{}\"",
            self.realm,
            nonce,
            DIGEST_OPAQUE,
            if stale { "TRUE" } else { "FALSE" }
        )
    }

    /// Creates a nonce for digest authentication (RFC 2617):
    /// base64 of `secret:realm:time:counter`.
    pub fn create_nonce(&mut self) -> String {
        self.create_nonce_at(utils::time::unix_time())
    }

    pub(crate) fn create_nonce_at(&mut self, when: i64) -> String {
        let counter = self.nonce_counter;
        self.nonce_counter += 1;
        base64_encode(format!("{}:{}:{:x}:{:x}", self.secret, self.realm, when, counter).as_bytes())
    }

    // Splits a nonce back into (secret, realm, issue time).
    fn parse_nonce(&self, nonce: &str) -> Option<(String, String, i64)> {
        let decoded = base64_decode(nonce)?;
        let text = String::from_utf8(decoded).ok()?;
        let mut parts = text.splitn(4, ':');
        let secret = parts.next()?.to_string();
        let realm = parts.next()?.to_string();
        let when = i64::from_str_radix(parts.next()?, 16).ok()?;
        Some((secret, realm, when))
    }

    // ---- credential parsing --------------------------------------------

    // Splits basic credentials into username and password. Undecodable
    // details leave empty credentials, which fail verification later.
    fn parse_basic_details(&self, tx: &mut Transaction) {
        let details = tx.auth.details.clone().unwrap_or_default();
        let decoded = base64_decode(details.trim())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default();
        match decoded.split_once(':') {
            Some((username, password)) => {
                tx.auth.username = Some(username.to_string());
                tx.auth.password = Some(password.to_string());
                tx.auth.encoded = false;
            }
            None => {
                tx.auth.username = Some(String::new());
                tx.auth.password = Some(String::new());
            }
        }
    }

    // Parses and validates digest credentials, computing the expected
    // response digest on success.
    fn parse_digest_details(&self, tx: &mut Transaction) -> DigestOutcome {
        let details = tx.auth.details.clone().unwrap_or_default();
        let Some(fields) = parse_kv_list(&details) else {
            return DigestOutcome::Malformed;
        };
        for (key, value) in &fields {
            match key.as_str() {
                "username" | "user" => tx.auth.username = Some(value.clone()),
                "realm" => tx.auth.realm = Some(value.clone()),
                "nonce" => tx.auth.nonce = Some(value.clone()),
                "nc" => tx.auth.nc = Some(value.clone()),
                "cnonce" => tx.auth.cnonce = Some(value.clone()),
                "qop" => tx.auth.qop = Some(value.clone()),
                "opaque" => tx.auth.opaque = Some(value.clone()),
                "uri" => tx.auth.digest_uri = Some(value.clone()),
                "response" => {
                    // The response digest takes the password slot, already
                    // in its encoded form.
                    tx.auth.password = Some(value.clone());
                    tx.auth.encoded = true;
                }
                // Keywords we do not act on are ignored.
                _ => {}
            }
        }

        if tx.auth.username.is_none()
            || tx.auth.realm.is_none()
            || tx.auth.nonce.is_none()
            || tx.auth.digest_uri.is_none()
            || tx.auth.password.is_none()
        {
            return DigestOutcome::Malformed;
        }
        if tx.auth.qop.is_some() && (tx.auth.cnonce.is_none() || tx.auth.nc.is_none()) {
            return DigestOutcome::Malformed;
        }

        // Validate the nonce; this is what bounds replay.
        let nonce = tx.auth.nonce.clone().unwrap_or_default();
        let Some((nonce_secret, nonce_realm, when)) = self.parse_nonce(&nonce) else {
            return DigestOutcome::Rejected;
        };
        if !constant_time_eq(nonce_secret.as_bytes(), self.secret.as_bytes()) {
            trace!("Access denied: nonce mismatch");
            return DigestOutcome::Rejected;
        }
        if nonce_realm != self.realm
            || tx.auth.realm.as_deref() != Some(self.realm.as_str())
        {
            trace!("Access denied: realm mismatch");
            return DigestOutcome::Rejected;
        }
        if tx.auth.qop.as_deref().unwrap_or("auth") != "auth" {
            trace!("Access denied: bad qop");
            return DigestOutcome::Rejected;
        }
        if when + NONCE_LIFETIME_SECS < utils::time::unix_time() {
            trace!("Access denied: nonce is stale");
            return DigestOutcome::Stale;
        }

        let Some(user) = self
            .users
            .get(tx.auth.username.as_deref().unwrap_or_default())
        else {
            trace!("Access denied: user is unknown");
            return DigestOutcome::Rejected;
        };
        tx.auth.expected_digest = Some(self.calc_digest(&tx.auth, tx.request.method().as_str(), user));
        DigestOutcome::Ok
    }

    // The expected response per RFC 2617 §3.2.2.1, from the stored HA1.
    fn calc_digest(&self, auth: &AuthState, method: &str, user: &User) -> String {
        let ha1 = self.stored_ha1(user);
        let uri = auth.digest_uri.as_deref().unwrap_or("");
        let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());
        let nonce = auth.nonce.as_deref().unwrap_or("");
        match auth.qop.as_deref() {
            Some(qop) => md5_hex(
                format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1,
                    nonce,
                    auth.nc.as_deref().unwrap_or(""),
                    auth.cnonce.as_deref().unwrap_or(""),
                    qop,
                    ha2
                )
                .as_bytes(),
            ),
            None => md5_hex(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()),
        }
    }
}

// Parses a comma separated `key=value` list with optional quoting and
// backslash escapes, as used by the Authorization digest header.
fn parse_kv_list(input: &str) -> Option<HashMap<String, String>> {
    let mut fields = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        if key.is_empty() || key.contains(',') {
            return None;
        }
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.char_indices();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        end = Some(i);
                        break;
                    }
                    other => out.push(other),
                }
            }
            let end = end?;
            value = out;
            rest = quoted[end + 1..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].strip_prefix(',').unwrap_or("").trim_start();
        }
        fields.insert(key, value);
    }
    Some(fields)
}

/// Binds the request to its session: an existing one named by the cookie,
/// or (with `create`) a freshly created one whose cookie is announced on
/// the response.
pub fn get_session<'a>(
    sessions: &'a mut SessionStore,
    tx: &mut Transaction,
    create: bool,
) -> Option<&'a mut Session> {
    if tx.session_id().is_none() {
        if let Some(cookie) = tx.request.headers.cookie() {
            if let Some(id) = session_id_from_cookie(cookie) {
                tx.set_session_id(id);
            }
        }
    }
    let known = tx
        .session_id()
        .map(|id| id.to_string())
        .filter(|id| sessions.lookup(id).is_some());
    match known {
        Some(id) => sessions.lookup(&id),
        None if create => {
            let id = sessions.create();
            tx.set_new_session(id.clone());
            sessions.lookup(&id)
        }
        None => None,
    }
}

// Prepares the challenge a 401 for this route carries.
fn ask_login(store: &mut AuthStore, tx: &mut Transaction, auth: AuthType) {
    match auth {
        AuthType::Basic => {
            let challenge = store.basic_challenge();
            tx.set_challenge(challenge);
        }
        AuthType::Digest => {
            let challenge = store.digest_challenge(false);
            tx.set_challenge(challenge);
        }
        AuthType::Form | AuthType::None => {}
    }
}

/// Authenticates and authorizes the request against its selected route.
///
/// Returns `true` when the request may proceed to dispatch. On `false`
/// the transaction already carries the error or redirect response.
/// Calling this twice on the same request yields the same decision and
/// does not touch the session again.
pub fn authenticate(
    store: &mut AuthStore,
    sessions: &mut SessionStore,
    redirects: &HashMap<u16, String>,
    tx: &mut Transaction,
) -> bool {
    let Some(route) = tx.route().cloned() else {
        return true;
    };
    if route.auth() == AuthType::None || store.auto_login() {
        return true;
    }

    // A cached decision makes repeated calls idempotent.
    if let Some(decision) = tx.auth.decision {
        return decision;
    }

    let mut cached = false;
    if tx.request.headers.cookie().is_some() {
        if let Some(session) = get_session(sessions, tx, false) {
            if let Some(username) = session.get_var(SESSION_USERNAME) {
                tx.auth.username = Some(username.to_string());
                cached = true;
            }
        }
    }

    let decision = if cached {
        authorize(store, &route, tx, redirects)
    } else {
        establish_identity(store, sessions, redirects, tx, route.auth())
            && authorize(store, &route, tx, redirects)
    };
    tx.auth.decision = Some(decision);
    decision
}

// Parses and verifies credentials, storing the identity in the session on
// success.
fn establish_identity(
    store: &mut AuthStore,
    sessions: &mut SessionStore,
    redirects: &HashMap<u16, String>,
    tx: &mut Transaction,
    auth: AuthType,
) -> bool {
    if let Some(scheme) = tx.auth.auth_type.clone() {
        if Some(scheme.as_str()) != auth.scheme() {
            tx.error(400, "Access denied. Wrong authentication protocol type.");
            return false;
        }
    }
    if tx.auth.details.is_some() {
        match auth {
            AuthType::Basic => store.parse_basic_details(tx),
            AuthType::Digest => match store.parse_digest_details(tx) {
                DigestOutcome::Ok => {}
                DigestOutcome::Malformed => {
                    tx.error(400, "Bad authorization header.");
                    return false;
                }
                DigestOutcome::Stale => {
                    let challenge = store.digest_challenge(true);
                    tx.set_challenge(challenge);
                    tx.redirect_by_status(401, redirects);
                    return false;
                }
                DigestOutcome::Rejected => {
                    ask_login(store, tx, auth);
                    tx.redirect_by_status(401, redirects);
                    return false;
                }
            },
            AuthType::Form | AuthType::None => {}
        }
    }

    if tx.auth.username.as_deref().unwrap_or("").is_empty() {
        ask_login(store, tx, auth);
        tx.redirect_by_status(401, redirects);
        return false;
    }
    if !store.verify_transaction(&mut tx.auth) {
        // The message never says whether the user or the password was
        // wrong.
        ask_login(store, tx, auth);
        tx.redirect_by_status(401, redirects);
        return false;
    }

    let username = tx.auth.username.clone().unwrap_or_default();
    if let Some(session) = get_session(sessions, tx, true) {
        session.set_var(SESSION_USERNAME, username);
    }
    true
}

// The deferred route ability check.
fn authorize(
    store: &mut AuthStore,
    route: &crate::router::Route,
    tx: &mut Transaction,
    redirects: &HashMap<u16, String>,
) -> bool {
    if route.abilities().is_empty() {
        return true;
    }
    let username = tx.auth.username.clone().unwrap_or_default();
    if store.can(&username, route.abilities()) {
        return true;
    }
    trace!("Access denied: insufficient abilities for \"{}\"", username);
    ask_login(store, tx, route.auth());
    tx.redirect_by_status(401, redirects);
    false
}

/// Verifies the given credentials against the request's route and stores
/// the identity in the session. The form login action is built on this.
pub fn login_user(
    store: &mut AuthStore,
    sessions: &mut SessionStore,
    tx: &mut Transaction,
    username: &str,
    password: &str,
) -> bool {
    if username.is_empty() {
        return false;
    }
    tx.auth.username = Some(username.to_string());
    tx.auth.password = Some(password.to_string());
    tx.auth.encoded = false;
    tx.auth.expected_digest = None;
    if !store.verify_transaction(&mut tx.auth) {
        trace!("Password does not match");
        return false;
    }
    if let Some(session) = get_session(sessions, tx, true) {
        session.set_var(SESSION_USERNAME, username.to_string());
    }
    true
}

/// Drops the authenticated identity from the session. Basic and digest
/// clients get a 401 so the browser forgets its credentials; form clients
/// are sent back through the status redirect table.
pub fn logout_user(
    store: &mut AuthStore,
    sessions: &mut SessionStore,
    redirects: &HashMap<u16, String>,
    tx: &mut Transaction,
) {
    if let Some(session) = get_session(sessions, tx, false) {
        session.remove_var(SESSION_USERNAME);
    }
    let auth = tx.route().map(|route| route.auth()).unwrap_or_default();
    match auth {
        AuthType::Basic | AuthType::Digest => tx.error(401, "Logged out."),
        AuthType::Form | AuthType::None => tx.redirect_by_status(200, redirects),
    }
}

/// The form login action: verifies the posted `username` and `password`,
/// then redirects to the session referrer or the site root.
pub fn login_action(
    store: &mut AuthStore,
    sessions: &mut SessionStore,
    redirects: &HashMap<u16, String>,
    tx: &mut Transaction,
) {
    let username = tx.var("username", "").to_string();
    let password = tx.var("password", "").to_string();
    if login_user(store, sessions, tx, &username, &password) {
        let referrer = get_session(sessions, tx, false)
            .and_then(|session| session.get_var(SESSION_REFERRER).map(String::from));
        match referrer {
            Some(referrer) => tx.redirect(&referrer),
            None => tx.redirect_by_status(200, redirects),
        }
    } else {
        let auth = tx.route().map(|route| route.auth()).unwrap_or_default();
        ask_login(store, tx, auth);
        tx.redirect_by_status(401, redirects);
    }
}

/// The form logout action.
pub fn logout_action(
    store: &mut AuthStore,
    sessions: &mut SessionStore,
    redirects: &HashMap<u16, String>,
    tx: &mut Transaction,
) {
    logout_user(store, sessions, redirects, tx);
}
