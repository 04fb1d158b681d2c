// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The redirect handler: table-driven 3xx rewrites configured on routes.

use crate::common::Body;
use crate::handlers::Handler;
use crate::response::{Response, StatusCode};
use crate::server::ServerCore;
use crate::transaction::Transaction;

/// Rewrites requests whose route carries a redirect target.
pub struct RedirectHandler;

impl Handler for RedirectHandler {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn service(&mut self, tx: &mut Transaction, _core: &mut ServerCore) -> bool {
        let Some((status, target)) = tx
            .route()
            .and_then(|route| route.redirect())
            .map(|(status, target)| (status, target.to_string()))
        else {
            // A route that names this handler without a target falls
            // through to the next handler.
            return false;
        };
        let mut response = Response::new(
            tx.request.http_version(),
            StatusCode::from_code(status),
        );
        response.set_location(target.clone());
        response.set_content_type("text/html");
        response.set_body(Body::new(format!(
            "<html><head></head><body><a href=\"{0}\">{0}</a></body></html>",
            target
        )));
        tx.set_response(response);
        true
    }
}
