// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Handler registration and dispatch.
//!
//! Handlers live in a process-wide ordered list. When a request reaches
//! dispatch, the handlers whose name appears in the route's handler list
//! are offered the request in registration order; the first to claim it
//! produces the response. The authentication gate runs for every route and
//! never claims.

use crate::auth;
use crate::server::ServerCore;
use crate::transaction::{Transaction, TxState};

pub mod action;
pub mod file;
pub mod redirect;
pub mod upload;

/// A pluggable request handler.
pub trait Handler {
    /// The name routes use to select this handler.
    fn name(&self) -> &'static str;

    /// Pre-filter deciding whether the handler is offered the request.
    /// The default admits the handler when the route's handler list names
    /// it.
    fn matches(&self, tx: &Transaction, _core: &ServerCore) -> bool {
        tx.route()
            .map(|route| route.handlers().iter().any(|name| name == self.name()))
            .unwrap_or(false)
    }

    /// Serves the request. Returns `true` when the request was claimed;
    /// an unclaimed request is offered to the next handler.
    fn service(&mut self, tx: &mut Transaction, core: &mut ServerCore) -> bool;

    /// Called once at server shutdown.
    fn close(&mut self) {}
}

/// The authentication gate. Runs for every route, applies the
/// authenticate check and always leaves the request unclaimed; on failure
/// the transaction already carries the 401/400 response, which stops
/// dispatch.
pub struct AuthHandler;

impl Handler for AuthHandler {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn matches(&self, _tx: &Transaction, _core: &ServerCore) -> bool {
        true
    }

    fn service(&mut self, tx: &mut Transaction, core: &mut ServerCore) -> bool {
        auth::authenticate(&mut core.auth, &mut core.sessions, &core.redirects, tx);
        false
    }
}

/// Offers `tx` to the registered handlers in order until one claims it.
/// A request nothing claims is answered with 404.
pub fn dispatch(
    handlers: &mut [Box<dyn Handler>],
    core: &mut ServerCore,
    tx: &mut Transaction,
) {
    let mut claimed = false;
    for handler in handlers.iter_mut() {
        if !handler.matches(tx, core) {
            continue;
        }
        if handler.name() != "auth" && tx.state() == TxState::Ready {
            tx.set_running();
        }
        claimed = handler.service(tx, core);
        if claimed || tx.is_complete() {
            break;
        }
    }
    if !claimed && !tx.is_complete() {
        tx.error(404, "No handler for request");
    } else if claimed && !tx.is_complete() {
        tx.done();
    }
}
