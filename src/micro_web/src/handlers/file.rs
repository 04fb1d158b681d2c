// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The static file handler.
//!
//! Serves documents from the configured root, honoring
//! `If-Modified-Since`, answering HEAD with headers only, redirecting
//! directory requests to the default document, and accepting DELETE and
//! PUT when the server is not running read-only. Large bodies are
//! streamed by the connection's background writer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::{debug, trace};

use crate::common::Method;
use crate::handlers::Handler;
use crate::response::{Response, StatusCode};
use crate::server::ServerCore;
use crate::transaction::Transaction;

/// Maps a path extension to the `Content-Type` announced for it.
fn content_type_for(extension: Option<&str>) -> &'static str {
    match extension {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "text/xml",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Serves static file documents.
pub struct FileHandler;

impl FileHandler {
    // The document path for a request, under the configured root. The
    // request path was normalized during parsing and cannot escape it.
    fn document_path(core: &ServerCore, tx: &Transaction) -> PathBuf {
        let relative = tx.request.path().trim_start_matches('/');
        core.config.docroot.join(relative)
    }

    fn delete(&self, tx: &mut Transaction, filename: &Path) {
        match std::fs::remove_file(filename) {
            Ok(()) => {
                let response =
                    Response::new(tx.request.http_version(), StatusCode::NoContent);
                tx.set_response(response);
            }
            Err(_) => tx.error(404, "Can't delete the URI"),
        }
    }

    fn put(&self, tx: &mut Transaction, filename: &Path) {
        let existed = filename.exists();
        let body = tx
            .request
            .body
            .as_ref()
            .map(|body| body.raw().to_vec())
            .unwrap_or_default();
        let written = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(filename)
            .and_then(|mut file| file.write_all(&body));
        match written {
            Ok(()) => {
                let status = if existed {
                    StatusCode::NoContent
                } else {
                    StatusCode::Created
                };
                tx.set_response(Response::new(tx.request.http_version(), status));
            }
            Err(e) => {
                debug!("put {} failed: {}", filename.display(), e);
                tx.error(500, "Can't write to file");
            }
        }
    }

    fn serve(&self, tx: &mut Transaction, core: &ServerCore, filename: &Path) {
        let metadata = match std::fs::metadata(filename) {
            Ok(metadata) => metadata,
            Err(_) => {
                if let Some(referrer) = tx.request.headers.referer() {
                    trace!("from {}", referrer);
                }
                tx.error(404, &format!("Cannot open document for: {}", tx.request.path()));
                return;
            }
        };

        // A directory request redirects to the nominated default page.
        if metadata.is_dir() {
            let mut path = tx.request.path().to_string();
            while path.len() > 1 && path.ends_with('/') {
                path.pop();
            }
            let target = if path == "/" {
                format!("/{}", core.config.index)
            } else {
                format!("{}/{}", path, core.config.index)
            };
            tx.redirect(&target);
            return;
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0);

        // Not modified since the client's copy: headers only.
        if let Some(since) = tx.request.headers.if_modified_since() {
            if mtime <= since {
                let mut response =
                    Response::new(tx.request.http_version(), StatusCode::NotModified);
                response.set_last_modified(mtime);
                tx.set_response(response);
                return;
            }
        }

        let file = match File::open(filename) {
            Ok(file) => file,
            Err(_) => {
                tx.error(404, &format!("Cannot open document for: {}", tx.request.path()));
                return;
            }
        };

        let mut response = Response::new(tx.request.http_version(), StatusCode::OK);
        response.set_content_type(content_type_for(tx.request.extension().as_deref()));
        response.set_last_modified(mtime);
        if tx.request.method() == Method::Head {
            response.set_content_length_only(metadata.len());
        } else {
            // The body bypasses the write buffer: the background writer
            // streams it chunk by chunk on socket writability.
            response.set_file(file, metadata.len());
        }
        tx.set_response(response);
    }
}

impl Handler for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    fn service(&mut self, tx: &mut Transaction, core: &mut ServerCore) -> bool {
        let filename = Self::document_path(core, tx);
        match tx.request.method() {
            Method::Delete if !core.config.read_only => self.delete(tx, &filename),
            Method::Put if !core.config.read_only => self.put(tx, &filename),
            Method::Delete | Method::Put => {
                tx.error(405, "Read-only document store");
            }
            _ => self.serve(tx, core, &filename),
        }
        true
    }
}
