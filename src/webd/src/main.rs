// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stand-alone web server over the embedded HTTP library.
//!
//! Serves a document root, optionally gated by a route/auth file, until
//! SIGINT or SIGTERM arrives.

mod logger;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use micro_web::WebServer;
use utils::arg_parser::{ArgParser, Argument};

static TERMINATOR: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signo: libc::c_int) {
    TERMINATOR.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores into an atomic flag, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn build_arg_parser() -> ArgParser {
    ArgParser::new()
        .arg(
            Argument::new("listen")
                .default_value("0.0.0.0:8080")
                .help("endpoint to bind, [scheme://][host][:port]"),
        )
        .arg(
            Argument::new("docroot")
                .default_value(".")
                .help("directory to serve documents from"),
        )
        .arg(
            Argument::new("route-file")
                .takes_value(true)
                .help("route and authentication configuration file"),
        )
        .arg(Argument::new("verbose").help("enable debug logging"))
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut arg_parser = build_arg_parser();
    arg_parser.parse_from_cmdline()?;
    if arg_parser.help_requested() {
        println!("webd - embedded web server\n\n{}", arg_parser.formatted_help());
        return Ok(());
    }

    let level = if arg_parser.flag_present("verbose") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    logger::init(level);
    install_signal_handlers();

    let docroot = arg_parser
        .value_as_string("docroot")
        .unwrap_or_else(|| ".".to_string());
    let route_file = arg_parser.value_as_string("route-file").map(PathBuf::from);
    let endpoint = arg_parser
        .value_as_string("listen")
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());

    let mut server = WebServer::open(docroot, route_file.as_deref())?;
    let addr = server.listen(&endpoint)?;
    info!("webd serving on {}", addr);

    server.service_events(&TERMINATOR)?;
    server.close();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("webd: {}", e);
        std::process::exit(1);
    }
}
