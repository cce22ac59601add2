// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Content hashing for encoded essence (spec §3, §6).
//!
//! The hash is used to detect a stale frame cache and to spot-check that a
//! `Fake`/`Repeat` queue entry really does match the bytes already on disk.
//! `aws-lc-rs` is already in the dependency tree for its `digest` module; no
//! separate hashing crate is pulled in for this.

use aws_lc_rs::digest::{self, SHA256};

/// Length in bytes of a [`content_hash`] result.
pub const HASH_LEN: usize = 16;

/// Computes a 128-bit content hash of `data`: SHA-256, truncated to the
/// first 16 bytes.
#[must_use]
pub fn content_hash(data: &[u8]) -> [u8; HASH_LEN] {
    let digest = digest::digest(&SHA256, data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest.as_ref()[..HASH_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::{HASH_LEN, content_hash};

    #[test]
    fn same_input_hashes_equal() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
    }

    #[test]
    fn different_input_hashes_differ() {
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }

    #[test]
    fn hash_is_expected_length() {
        assert_eq!(content_hash(b"x").len(), HASH_LEN);
    }
}
