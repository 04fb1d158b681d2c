// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Support primitives shared by the web server crates: an `epoll` wrapper,
//! cryptographic token generation, wall-clock and HTTP date helpers, scratch
//! files for tests and uploads, and a small command line parser.

pub mod arg_parser;
pub mod epoll;
pub mod rand;
pub mod tempfile;
pub mod time;
