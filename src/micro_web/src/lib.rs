// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! An embedded HTTP/1.1 server for resource-constrained hosts.
//!
//! The crate links into a host application that wants to expose an HTTP
//! interface for configuration, telemetry or content delivery without a
//! heavyweight framework. A single-threaded epoll loop drives
//! non-blocking connections through an incremental request parser, an
//! ordered route table with longest-prefix matching, a user/role/ability
//! authorization model with Basic, Digest (RFC 2617) and form login, and
//! a small set of built-in handlers (static files, in-process actions,
//! redirects, uploads). Large file responses stream through a per-request
//! background writer instead of being buffered.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//!
//! use micro_web::WebServer;
//!
//! let mut server = WebServer::open("/var/www", None).unwrap();
//! server.define_action("hello", |_core, tx| {
//!     tx.set_content_type("text/plain");
//!     tx.write(b"hello from the device");
//!     tx.done();
//! });
//! server.listen("0.0.0.0:8080").unwrap();
//!
//! let terminator = AtomicBool::new(false);
//! server.service_events(&terminator).unwrap();
//! ```

pub mod auth;
pub mod buffer;
pub mod common;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod transaction;

pub use auth::{AuthStore, AuthType};
pub use common::{Body, ConnectionError, Method, RequestError, Version};
pub use connection::{HttpConnection, HttpLimits};
pub use request::Request;
pub use response::{Response, StatusCode};
pub use router::{Route, RouteTable};
pub use server::{ServerConfig, ServerCore, ServerError, WebServer};
pub use session::SessionStore;
pub use transaction::Transaction;
