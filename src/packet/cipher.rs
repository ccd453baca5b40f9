// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seam for the cryptographic transforms.
//!
//! The fabric never interprets ciphertext: a payload either carries the
//! `ENCRYPTED` flag and was produced by some [`PacketCipher`], or it does
//! not. Concrete ciphers live outside this crate and are injected where a
//! deployment needs them.

use anyhow::Result;

/// An opaque, symmetric payload transform.
///
/// Implementations must be deterministic for a `(key, nonce)` pair and must
/// reject tampered input from `decrypt` rather than returning garbage.
pub trait PacketCipher: Send + Sync {
    fn encrypt(&self, key: &[u8], nonce: &[u8], bytes: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &[u8], nonce: &[u8], bytes: &[u8]) -> Result<Vec<u8>>;
}
