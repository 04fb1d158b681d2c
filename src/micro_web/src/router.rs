// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The route table: ordered URL-prefix rules with method, extension and
//! ability filters.

use std::collections::HashSet;
use std::rc::Rc;

use crate::auth::AuthType;
use crate::common::Method;

/// A URL-prefix rule. Immutable once installed in the table.
#[derive(Debug)]
pub struct Route {
    prefix: String,
    /// Methods admitted by this route; `None` admits all.
    methods: Option<HashSet<Method>>,
    /// Extensions admitted by this route; `None` admits all.
    extensions: Option<HashSet<String>>,
    /// Abilities the authenticated user must hold. Checked by the auth
    /// engine after authentication, not during selection.
    abilities: HashSet<String>,
    /// The authentication protocol gating this route.
    auth: AuthType,
    /// Names of the handlers allowed to serve this route, in order.
    handlers: Vec<String>,
    /// Redirect target and status for routes served by the redirect
    /// handler.
    redirect: Option<(u16, String)>,
}

impl Route {
    /// Creates a route for `prefix` served by the file handler with no
    /// filters and no authentication.
    pub fn new<P: Into<String>>(prefix: P) -> Self {
        Self {
            prefix: prefix.into(),
            methods: None,
            extensions: None,
            abilities: HashSet::new(),
            auth: AuthType::None,
            handlers: vec!["file".to_string()],
            redirect: None,
        }
    }

    /// Restricts the route to `methods`.
    pub fn with_methods<I: IntoIterator<Item = Method>>(mut self, methods: I) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    /// Restricts the route to paths with one of `extensions`.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = Some(
            extensions
                .into_iter()
                .map(|e| e.into().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Requires the authenticated user to hold all of `abilities`.
    pub fn with_abilities<I, S>(mut self, abilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abilities = abilities.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the authentication protocol for the route.
    pub fn with_auth(mut self, auth: AuthType) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the ordered handler list for the route.
    pub fn with_handlers<I, S>(mut self, handlers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handlers = handlers.into_iter().map(Into::into).collect();
        self
    }

    /// Makes the route a table-driven redirect to `target` with `status`.
    pub fn with_redirect<S: Into<String>>(mut self, status: u16, target: S) -> Self {
        self.redirect = Some((status, target.into()));
        if !self.handlers.iter().any(|h| h == "redirect") {
            self.handlers.insert(0, "redirect".to_string());
        }
        self
    }

    /// The URL prefix of the route.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The authentication protocol of the route.
    pub fn auth(&self) -> AuthType {
        self.auth
    }

    /// The method filter, if the route has one.
    pub fn methods(&self) -> Option<&HashSet<Method>> {
        self.methods.as_ref()
    }

    /// The extension filter, if the route has one.
    pub fn extensions(&self) -> Option<&HashSet<String>> {
        self.extensions.as_ref()
    }

    /// The abilities required by the route.
    pub fn abilities(&self) -> &HashSet<String> {
        &self.abilities
    }

    /// The ordered handler names for the route.
    pub fn handlers(&self) -> &[String] {
        &self.handlers
    }

    /// The redirect target, for redirect routes.
    pub fn redirect(&self) -> Option<(u16, &str)> {
        self.redirect
            .as_ref()
            .map(|(status, target)| (*status, target.as_str()))
    }

    /// Returns `true` when the route admits a request for `path` with the
    /// given method and extension.
    fn admits(&self, path: &str, method: Method, extension: Option<&str>) -> bool {
        if !path.starts_with(&self.prefix) {
            return false;
        }
        if let Some(ref methods) = self.methods {
            if !methods.contains(&method) {
                return false;
            }
        }
        if let Some(ref extensions) = self.extensions {
            match extension {
                Some(extension) => {
                    if !extensions.contains(extension) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// The ordered route table.
///
/// Routes are kept in descending prefix length order; equal-length
/// prefixes keep their insertion order. Selection walks the table and
/// returns the first admissible route, which is therefore the admissible
/// route with the longest matching prefix.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Rc<Route>>,
}

impl RouteTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `route`, keeping the descending-prefix-length order.
    pub fn add(&mut self, route: Route) {
        let len = route.prefix.len();
        let position = self
            .routes
            .iter()
            .position(|existing| existing.prefix.len() < len)
            .unwrap_or(self.routes.len());
        self.routes.insert(position, Rc::new(route));
    }

    /// Removes the first route with exactly `prefix`. Returns `true` if a
    /// route was removed.
    pub fn remove(&mut self, prefix: &str) -> bool {
        match self.routes.iter().position(|route| route.prefix == prefix) {
            Some(position) => {
                self.routes.remove(position);
                true
            }
            None => false,
        }
    }

    /// Selects the route for a request, or `None` if no route admits it.
    pub fn select(
        &self,
        path: &str,
        method: Method,
        extension: Option<&str>,
    ) -> Option<Rc<Route>> {
        self.routes
            .iter()
            .find(|route| route.admits(path, method, extension))
            .cloned()
    }

    /// Iterates the installed routes in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Route>> {
        self.routes.iter()
    }

    /// Number of installed routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` when the table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
