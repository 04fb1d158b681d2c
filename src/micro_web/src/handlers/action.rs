// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The action handler: in-process endpoints under `/action/<name>`.
//!
//! Emulates CGI processing without spawning anything. The callback
//! receives the transaction with query and form variables already
//! decoded, and responds through the transaction helpers.

use crate::handlers::Handler;
use crate::server::ServerCore;
use crate::transaction::Transaction;

/// The URL prefix actions are served under.
pub const ACTION_PREFIX: &str = "/action/";

/// Serves named in-process callbacks.
pub struct ActionHandler;

impl ActionHandler {
    // The action name is the path segment after the prefix.
    fn action_name(tx: &Transaction) -> Option<String> {
        let rest = tx.request.path().strip_prefix(ACTION_PREFIX)?;
        let name = rest.split('/').next().unwrap_or("");
        if name.is_empty() {
            return None;
        }
        Some(name.to_string())
    }
}

impl Handler for ActionHandler {
    fn name(&self) -> &'static str {
        "action"
    }

    fn service(&mut self, tx: &mut Transaction, core: &mut ServerCore) -> bool {
        let Some(name) = Self::action_name(tx) else {
            tx.error(400, "Missing action name");
            return true;
        };
        // Clone the callback handle so the registry borrow ends before
        // the callback runs with the core.
        let Some(callback) = core.actions.get(&name).cloned() else {
            tx.error(404, &format!("Action {} is not defined", name));
            return true;
        };
        tx.decode_form_body();
        (&mut *callback.borrow_mut())(core, tx);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::dispatch;
    use crate::request::{Request, RequestLine};
    use crate::response::StatusCode;
    use crate::router::Route;
    use crate::server::{ServerConfig, ServerCore};
    use crate::transaction::TxOutput;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn core_with_actions() -> ServerCore {
        let mut core = ServerCore::new(ServerConfig::new("."));
        core.router
            .add(Route::new(ACTION_PREFIX).with_handlers(["action"]));
        core
    }

    fn run(core: &mut ServerCore, line: &str, body: Option<&str>) -> Transaction {
        let request_line = RequestLine::try_from(line.as_bytes()).unwrap();
        let mut request = Request::from_request_line(request_line).unwrap();
        if let Some(body) = body {
            request
                .headers
                .parse_header_line(b"Content-Type: application/x-www-form-urlencoded")
                .unwrap();
            request.body = Some(crate::common::Body::new(body));
        }
        let mut tx = Transaction::new(request);
        let route = core
            .router
            .select(tx.request.path(), tx.request.method(), None)
            .unwrap();
        tx.set_route(route);
        let mut handlers: Vec<Box<dyn Handler>> = vec![Box::new(ActionHandler)];
        dispatch(&mut handlers, core, &mut tx);
        tx
    }

    #[test]
    fn test_action_receives_decoded_vars() {
        let mut core = core_with_actions();
        let seen = Rc::new(RefCell::new(String::new()));
        let seen_in_action = seen.clone();
        core.actions.insert(
            "configure".to_string(),
            Rc::new(RefCell::new(
                move |_core: &mut ServerCore, tx: &mut Transaction| {
                    *seen_in_action.borrow_mut() =
                        format!("{}/{}", tx.var("device", ""), tx.var("mode", ""));
                    tx.respond(200, "text/plain", b"configured");
                },
            )),
        );

        let mut tx = run(
            &mut core,
            "POST /action/configure?device=eth0 HTTP/1.1",
            Some("mode=fast+start"),
        );
        assert_eq!(tx.status(), StatusCode::OK);
        assert_eq!(*seen.borrow(), "eth0/fast start");
        match tx.take_output() {
            TxOutput::Response(response) => {
                assert_eq!(response.status(), StatusCode::OK);
            }
            TxOutput::Raw(_) => panic!("expected response"),
        }
    }

    #[test]
    fn test_streaming_action_gets_done_call() {
        let mut core = core_with_actions();
        core.actions.insert(
            "report".to_string(),
            Rc::new(RefCell::new(
                |_core: &mut ServerCore, tx: &mut Transaction| {
                    tx.set_content_type("text/html");
                    tx.write(b"<html>report</html>");
                    // The dispatcher completes the stream for actions that
                    // do not call done themselves.
                },
            )),
        );

        let mut tx = run(&mut core, "GET /action/report HTTP/1.1", None);
        assert!(tx.is_complete());
        let output = match tx.take_output() {
            TxOutput::Raw(bytes) => String::from_utf8(bytes).unwrap(),
            TxOutput::Response(_) => panic!("expected raw output"),
        };
        assert!(output.contains("Transfer-Encoding: chunked\r\n"));
        assert!(output.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn test_unknown_action_is_404() {
        let mut core = core_with_actions();
        let tx = run(&mut core, "GET /action/absent HTTP/1.1", None);
        assert_eq!(tx.status(), StatusCode::NotFound);
    }

    #[test]
    fn test_missing_action_name_is_400() {
        let mut core = core_with_actions();
        let tx = run(&mut core, "GET /action/ HTTP/1.1", None);
        assert_eq!(tx.status(), StatusCode::BadRequest);
    }
}
