// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The upload handler: spools PUT and POST bodies into the upload
//! directory.

use std::io::Write;

use log::debug;

use crate::common::Method;
use crate::handlers::Handler;
use crate::server::ServerCore;
use crate::transaction::Transaction;
use utils::tempfile::TempFile;

/// Stores request bodies as files and reports where they landed.
pub struct UploadHandler;

impl Handler for UploadHandler {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn service(&mut self, tx: &mut Transaction, core: &mut ServerCore) -> bool {
        if !matches!(tx.request.method(), Method::Put | Method::Post) {
            return false;
        }
        let body = tx
            .request
            .body
            .as_ref()
            .map(|body| body.raw().to_vec())
            .unwrap_or_default();
        if body.len() as u64 > u64::from(core.config.limits.max_body_len) {
            tx.error(413, "Put file too large");
            return true;
        }

        let spooled = TempFile::new_in(&core.config.upload_dir).and_then(|temp| {
            temp.as_file()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "spool file already detached")
                })?
                .write_all(&body)?;
            Ok(temp.keep())
        });
        match spooled {
            Ok(path) => {
                tx.set_upload_path(path.clone());
                tx.set_status(201);
                tx.set_content_length(0);
                tx.add_header("Location", path.display().to_string());
                tx.write_headers();
                tx.done();
            }
            Err(e) => {
                debug!("upload spool failed: {}", e);
                tx.error(500, "Can't write to file");
            }
        }
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

    fn run(core: &mut ServerCore, line: &str, body: &[u8]) -> Transaction {
        let request_line = RequestLine::try_from(line.as_bytes()).unwrap();
        let mut request = Request::from_request_line(request_line).unwrap();
        request.body = Some(crate::common::Body::new(body.to_vec()));
        let mut tx = Transaction::new(request);
        let route = core
            .router
            .select(tx.request.path(), tx.request.method(), None)
            .unwrap();
        tx.set_route(route);
        let mut handlers: Vec<Box<dyn Handler>> = vec![Box::new(UploadHandler)];
        dispatch(&mut handlers, core, &mut tx);
        tx
    }

    fn upload_core(dir: &std::path::Path) -> ServerCore {
        let config = ServerConfig::new(".").with_upload_dir(dir);
        let mut core = ServerCore::new(config);
        core.router
            .add(Route::new("/tmp/").with_handlers(["upload"]));
        core
    }

    #[test]
    fn test_body_spooled_to_upload_dir() {
        let dir = utils::tempfile::TempDir::new().unwrap();
        let mut core = upload_core(dir.as_path());

        let mut tx = run(&mut core, "PUT /tmp/firmware.bin HTTP/1.1", b"payload");
        assert_eq!(tx.status(), StatusCode::Created);
        let path = tx.upload_path().unwrap().to_path_buf();
        assert!(path.starts_with(dir.as_path()));
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        let output = match tx.take_output() {
            TxOutput::Raw(bytes) => String::from_utf8(bytes).unwrap(),
            TxOutput::Response(_) => panic!("expected raw output"),
        };
        assert!(output.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(output.contains("Location: "));
    }

    #[test]
    fn test_get_not_claimed() {
        let dir = utils::tempfile::TempDir::new().unwrap();
        let mut core = upload_core(dir.as_path());
        core.router.add(Route::new("/tmp/x").with_handlers(["upload"]));
        let tx = run(&mut core, "GET /tmp/x HTTP/1.1", b"");
        assert_eq!(tx.status(), StatusCode::NotFound);
    }

    #[test]
    fn test_oversize_body_rejected() {
        let dir = utils::tempfile::TempDir::new().unwrap();
        let mut core = upload_core(dir.as_path());
        core.config.limits.max_body_len = 4;
        let tx = run(&mut core, "PUT /tmp/big HTTP/1.1", b"too large");
        assert_eq!(tx.status(), StatusCode::PayloadTooLarge);
        assert!(tx.wants_close());
    }
}
