// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size authenticated frame header.
//!
//! Every message on the wire is a 128-byte ASCII header followed by the body
//! the header describes. The header needs a fixed size because messages from
//! many peers interleave on the server and the reassembler must find the
//! next header without any out-of-band framing.
//!
//! # Wire Format
//!
//! ```text
//!  offset  len  field
//!  ------  ---  -----
//!       0    7  literal "header "
//!       7    N  body length, decimal ASCII
//!     7+N  ...  space padding up to offset 64
//!              (byte 63 is reserved as a digest-version tag for a future
//!               HMAC negotiation; today it is always a space)
//!      64   32  lowercase hex MD5 of the body
//!      96   32  lowercase hex MD5 of header[0..96) ++ secret bytes
//! ```
//!
//! The trailing digest authenticates the header against the shared secret;
//! the middle digest lets the receiver verify the body once it has been
//! reassembled.
//!
//! MD5 is kept for compatibility with deployed senders. Note that
//! MD5(data ++ secret) is a plain digest, not an HMAC, and inherits MD5's
//! length-extension weakness; the migration path is HMAC-SHA256 selected
//! through the reserved padding byte. All digest construction is confined
//! to this module so that swap happens in one place.

use std::fmt;

use md5::{Digest, Md5};

use crate::secret::Secret;

/// Total header size on the wire.
pub const HEADER_LEN: usize = 128;

/// Leading magic, including its trailing space.
const MAGIC: &[u8] = b"header ";

/// End of the length field / start of the body digest.
const LEN_FIELD_END: usize = 64;

/// The span covered by the authenticity digest.
const AUTH_SPAN: usize = 96;

/// A hex-encoded MD5 digest as it appears in the header.
pub type DigestHex = [u8; 32];

/// Framing errors, in decode order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Missing magic or unparsable length field.
    InvalidHeader,
    /// The header-plus-secret digest does not match.
    AuthMismatch,
    /// The reassembled body does not match the header's body digest.
    BodyCorrupt,
    /// More body bytes buffered than the header declared - peer framing bug.
    Oversize { declared: usize, buffered: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid frame header"),
            Self::AuthMismatch => write!(f, "header digest does not match shared secret"),
            Self::BodyCorrupt => write!(f, "body digest mismatch"),
            Self::Oversize { declared, buffered } => {
                write!(f, "{} body bytes buffered, {} declared", buffered, declared)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// The two fields a receiver needs from a verified header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: usize,
    pub body_digest: DigestHex,
}

/// Build the header for a serialized body.
#[must_use]
pub fn encode_header(body: &[u8], secret: &Secret) -> [u8; HEADER_LEN] {
    let mut header = [b' '; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(MAGIC);

    // usize prints to at most 20 digits; the length field always fits.
    let len = body.len().to_string();
    header[MAGIC.len()..MAGIC.len() + len.len()].copy_from_slice(len.as_bytes());

    header[LEN_FIELD_END..AUTH_SPAN].copy_from_slice(&body_digest(body));
    let auth = auth_digest(&header[..AUTH_SPAN], secret);
    header[AUTH_SPAN..].copy_from_slice(&auth);
    header
}

/// Verify and parse a received header.
///
/// Authenticity is checked before anything in the header is trusted,
/// including the length field.
pub fn parse_header(raw: &[u8], secret: &Secret) -> Result<FrameHeader, FrameError> {
    if raw.len() < HEADER_LEN {
        return Err(FrameError::InvalidHeader);
    }
    let raw = &raw[..HEADER_LEN];

    if raw[AUTH_SPAN..] != auth_digest(&raw[..AUTH_SPAN], secret) {
        return Err(FrameError::AuthMismatch);
    }
    if &raw[..MAGIC.len()] != MAGIC {
        return Err(FrameError::InvalidHeader);
    }

    let len_field =
        std::str::from_utf8(&raw[MAGIC.len()..LEN_FIELD_END]).map_err(|_| FrameError::InvalidHeader)?;
    let body_len = len_field
        .trim()
        .parse()
        .map_err(|_| FrameError::InvalidHeader)?;

    let mut body_digest = [0u8; 32];
    body_digest.copy_from_slice(&raw[LEN_FIELD_END..AUTH_SPAN]);

    Ok(FrameHeader {
        body_len,
        body_digest,
    })
}

/// Check a fully reassembled body against its header digest.
pub fn verify_body(body: &[u8], expected: &DigestHex) -> Result<(), FrameError> {
    if body_digest(body) != *expected {
        return Err(FrameError::BodyCorrupt);
    }
    Ok(())
}

/// Hex MD5 of the body alone.
#[must_use]
pub fn body_digest(body: &[u8]) -> DigestHex {
    md5_hex(&[body])
}

/// Hex MD5 of the header prefix with the shared secret appended.
#[must_use]
pub fn auth_digest(header_prefix: &[u8], secret: &Secret) -> DigestHex {
    md5_hex(&[header_prefix, secret.as_bytes()])
}

fn md5_hex(parts: &[&[u8]]) -> DigestHex {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();

    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0u8; 32];
    for (i, byte) in digest.iter().enumerate() {
        out[2 * i] = HEX[(byte >> 4) as usize];
        out[2 * i + 1] = HEX[(byte & 0x0f) as usize];
    }
    out
}
