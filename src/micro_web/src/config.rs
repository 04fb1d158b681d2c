// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The route and authentication configuration file.
//!
//! A line-oriented text format: each line is `directive key=value …`,
//! `#` starts a comment. Three directives are understood:
//!
//! ```text
//! user name=<n> password=<cleartext-or-ha1> roles=<csv>
//! role name=<n> abilities=<csv>
//! route prefix=<p> [methods=<csv>] [extensions=<csv>] [abilities=<csv>]
//!       [auth=<basic|digest|form|none>] [handler=<csv>]
//!       [status=<code>] [redirect=<target>]
//! ```
//!
//! A route with a 3xx status and a redirect target installs a redirect
//! route; a 4xx status maps the status code onto a destination in the
//! status redirect table (e.g. `status=401 redirect=/login.html`).
//! Write-back reproduces the same shape from the in-memory state and
//! replaces the file atomically.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use log::info;

use crate::auth::{AuthStore, AuthType};
use crate::common::Method;
use crate::router::{Route, RouteTable};
use utils::tempfile::TempFile;

/// Errors raised while loading or saving the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or replaced.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A line could not be parsed.
    #[error("Line {line}: {reason}")]
    Parse {
        /// One-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
}

fn parse_error(line: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::Parse {
        line,
        reason: reason.into(),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(String::from)
        .collect()
}

// One `key=value key=value` tail into a map.
fn parse_pairs(line_no: usize, tokens: &[&str]) -> Result<HashMap<String, String>, ConfigError> {
    let mut pairs = HashMap::new();
    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| parse_error(line_no, format!("expected key=value, got '{}'", token)))?;
        pairs.insert(key.to_string(), value.to_string());
    }
    Ok(pairs)
}

/// Loads the configuration file into the route table, the auth store and
/// the status redirect table, then recomputes all user abilities.
pub fn load(
    path: &Path,
    router: &mut RouteTable,
    auth: &mut AuthStore,
    redirects: &mut HashMap<u16, String>,
) -> Result<(), ConfigError> {
    let text = std::fs::read_to_string(path)?;
    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((directive, rest)) = tokens.split_first() else {
            continue;
        };
        let pairs = parse_pairs(line_no, rest)?;

        match *directive {
            "user" => {
                let name = pairs
                    .get("name")
                    .ok_or_else(|| parse_error(line_no, "user requires name="))?;
                let password = pairs
                    .get("password")
                    .ok_or_else(|| parse_error(line_no, "user requires password="))?;
                let roles = pairs.get("roles").map(String::as_str).unwrap_or("");
                auth.add_user(name, password, &split_csv(roles).join(","))
                    .map_err(|e| parse_error(line_no, e.to_string()))?;
            }
            "role" => {
                let name = pairs
                    .get("name")
                    .ok_or_else(|| parse_error(line_no, "role requires name="))?;
                let abilities = pairs.get("abilities").map(String::as_str).unwrap_or("");
                auth.add_role(name, split_csv(abilities).into_iter().collect())
                    .map_err(|e| parse_error(line_no, e.to_string()))?;
            }
            "route" => {
                let prefix = pairs
                    .get("prefix")
                    .ok_or_else(|| parse_error(line_no, "route requires prefix="))?;
                let status: Option<u16> = match pairs.get("status") {
                    Some(status) => Some(
                        status
                            .parse()
                            .map_err(|_| parse_error(line_no, "bad status="))?,
                    ),
                    None => None,
                };
                let target = pairs.get("redirect");

                // A 4xx status names a destination for redirect-by-status
                // rather than a route.
                if let (Some(status), Some(target)) = (status, target) {
                    if status >= 400 {
                        redirects.insert(status, target.clone());
                        continue;
                    }
                }

                let mut route = Route::new(prefix.clone());
                if let Some(methods) = pairs.get("methods") {
                    let mut parsed = Vec::new();
                    for token in split_csv(methods) {
                        parsed.push(Method::try_from(token.as_bytes()).map_err(|_| {
                            parse_error(line_no, format!("bad method '{}'", token))
                        })?);
                    }
                    route = route.with_methods(parsed);
                }
                if let Some(extensions) = pairs.get("extensions") {
                    route = route.with_extensions(split_csv(extensions));
                }
                if let Some(abilities) = pairs.get("abilities") {
                    route = route.with_abilities(split_csv(abilities));
                }
                if let Some(token) = pairs.get("auth") {
                    let auth_type = AuthType::parse(token)
                        .ok_or_else(|| parse_error(line_no, format!("bad auth '{}'", token)))?;
                    route = route.with_auth(auth_type);
                }
                if let Some(handlers) = pairs.get("handler") {
                    route = route.with_handlers(split_csv(handlers));
                }
                if let Some(target) = target {
                    route = route.with_redirect(status.unwrap_or(302), target.clone());
                }
                router.add(route);
            }
            other => {
                return Err(parse_error(
                    line_no,
                    format!("unknown directive '{}'", other),
                ));
            }
        }
    }
    auth.compute_all_abilities();
    info!(
        "loaded {}: {} routes",
        path.display(),
        router.len()
    );
    Ok(())
}

fn write_route(out: &mut impl Write, route: &Route) -> std::io::Result<()> {
    write!(out, "route prefix={}", route.prefix())?;
    if let Some(methods) = route.methods() {
        let mut methods: Vec<&str> = methods.iter().map(|method| method.as_str()).collect();
        methods.sort_unstable();
        write!(out, " methods={}", methods.join(","))?;
    }
    if let Some(extensions) = route.extensions() {
        let mut extensions: Vec<&str> = extensions.iter().map(String::as_str).collect();
        extensions.sort_unstable();
        write!(out, " extensions={}", extensions.join(","))?;
    }
    if !route.abilities().is_empty() {
        let mut abilities: Vec<&str> = route.abilities().iter().map(String::as_str).collect();
        abilities.sort_unstable();
        write!(out, " abilities={}", abilities.join(","))?;
    }
    if route.auth() != AuthType::None {
        write!(out, " auth={}", route.auth().as_str())?;
    }
    write!(out, " handler={}", route.handlers().join(","))?;
    if let Some((status, target)) = route.redirect() {
        write!(out, " status={} redirect={}", status, target)?;
    }
    writeln!(out)
}

/// Writes the current in-memory state back in the configuration file
/// shape. The file is replaced atomically via a sibling temporary file
/// and rename.
pub fn save(
    path: &Path,
    router: &RouteTable,
    auth: &AuthStore,
    redirects: &HashMap<u16, String>,
) -> Result<(), ConfigError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let temp = match dir {
        Some(dir) => TempFile::new_in(dir)?,
        None => TempFile::new()?,
    };
    {
        let mut out = temp.as_file().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "temporary file already detached")
        })?;
        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        writeln!(out, "#\n#   {} - Authorization data\n#\n", basename)?;

        let mut roles: Vec<_> = auth.roles().collect();
        roles.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (name, role) in roles {
            let mut abilities: Vec<&str> = role.abilities().iter().map(String::as_str).collect();
            abilities.sort_unstable();
            writeln!(out, "role name={} abilities={}", name, abilities.join(","))?;
        }
        writeln!(out)?;

        let mut users: Vec<_> = auth.users().collect();
        users.sort_unstable_by(|a, b| a.name().cmp(b.name()));
        for user in users {
            writeln!(
                out,
                "user name={} password={} roles={}",
                user.name(),
                user.password(),
                split_csv(user.roles()).join(",")
            )?;
        }
        writeln!(out)?;

        for route in router.iter() {
            write_route(&mut out, route)?;
        }
        for (status, target) in redirects {
            writeln!(out, "route prefix=/ status={} redirect={}", status, target)?;
        }
        out.flush()?;
    }

    let temp_path = temp.keep();
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
