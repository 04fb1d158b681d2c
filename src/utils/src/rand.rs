// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Random material for security sensitive tokens.
//!
//! Session identifiers, server secrets and digest nonces must be
//! unpredictable, so everything here draws from the operating system CSPRNG.
//! A time-seeded xorshift is not acceptable for these uses.

use rand::rngs::OsRng;
use rand::RngCore;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Fills `buf` with bytes from the OS CSPRNG.
pub fn fill_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Returns `n_bytes` of CSPRNG output encoded as lowercase hex.
///
/// The result is URL and cookie safe. Sixteen bytes give the 128 bits of
/// entropy required for session identifiers.
pub fn hex_token(n_bytes: usize) -> String {
    let mut raw = vec![0u8; n_bytes];
    fill_bytes(&mut raw);

    let mut out = String::with_capacity(n_bytes * 2);
    for byte in raw {
        out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        out.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}
