// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer message reassembly.
//!
//! TCP hands the server arbitrary chunks; each peer owns a small state
//! machine that finds the next authenticated header, accumulates the body it
//! declares, and verifies the body digest before decoding. Every failure is
//! local to the peer: a bad header is skipped, a corrupt or oversized body
//! resets the machine to header search, and the connection stays up.

use std::time::Instant;

use mio::net::TcpStream;
use std::net::SocketAddr;

use crate::secret::Secret;
use crate::snapshot::{Payload, PayloadKind};
use crate::wire::frame::{self, DigestHex, FrameError};
use crate::wire::{body, HEADER_LEN};

/// What the reassembler expects next.
#[derive(Debug, Clone, Copy)]
enum Expecting {
    /// Awaiting a 128-byte header.
    Header,
    /// Accumulating a body of the declared length.
    Body { len: usize, digest: DigestHex },
}

/// The socketless reassembly machine; one per connection.
#[derive(Debug)]
pub struct Assembler {
    /// Peer label for logs.
    label: String,
    expecting: Expecting,
    buf: Vec<u8>,
}

impl Assembler {
    #[must_use]
    pub fn new(label: String) -> Self {
        Self {
            label,
            expecting: Expecting::Header,
            buf: Vec::new(),
        }
    }

    /// Feed one received chunk. Returns a payload when the chunk completed a
    /// verified message.
    pub fn feed(&mut self, chunk: &[u8], secret: &Secret) -> Option<Payload> {
        match self.expecting {
            Expecting::Header => {
                // Senders write the header in one piece; a shorter read is
                // mid-stream noise, not the start of a message.
                if chunk.len() < HEADER_LEN {
                    log::warn!(
                        "[server] short header from {}: {} bytes, skipping",
                        self.label,
                        chunk.len()
                    );
                    return None;
                }
                match frame::parse_header(&chunk[..HEADER_LEN], secret) {
                    Ok(header) => {
                        self.buf.clear();
                        self.buf.extend_from_slice(&chunk[HEADER_LEN..]);
                        self.expecting = Expecting::Body {
                            len: header.body_len,
                            digest: header.body_digest,
                        };
                    }
                    Err(err) => {
                        log::warn!("[server] rejected header from {}: {}", self.label, err);
                        return None;
                    }
                }
            }
            Expecting::Body { .. } => self.buf.extend_from_slice(chunk),
        }
        self.try_complete()
    }

    fn try_complete(&mut self) -> Option<Payload> {
        let Expecting::Body { len, digest } = self.expecting else {
            return None;
        };
        if self.buf.len() < len {
            return None;
        }
        if self.buf.len() > len {
            log::warn!(
                "[server] too much data from {}: {}, resetting",
                self.label,
                FrameError::Oversize {
                    declared: len,
                    buffered: self.buf.len()
                }
            );
            self.reset();
            return None;
        }
        if let Err(err) = frame::verify_body(&self.buf, &digest) {
            log::warn!("[server] {} from {}, resetting", err, self.label);
            self.reset();
            return None;
        }
        let decoded = body::decode(&self.buf);
        self.reset();
        match decoded {
            Ok(payload) => Some(payload),
            Err(err) => {
                log::warn!("[server] undecodable snapshot from {}: {}", self.label, err);
                None
            }
        }
    }

    fn reset(&mut self) {
        self.expecting = Expecting::Header;
        self.buf.clear();
    }
}

/// Connection-lifetime state for one peer.
pub struct Peer {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    assembler: Assembler,
    /// Last complete payload, cleared at each flush so a peer that goes
    /// silent cannot republish stale data.
    pub payload: Option<Payload>,
    /// Discriminator of the last message; survives payload clearing.
    pub kind: Option<PayloadKind>,
    /// Arrival time of the last complete message.
    pub received_at: Option<Instant>,
}

impl Peer {
    #[must_use]
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            assembler: Assembler::new(addr.to_string()),
            payload: None,
            kind: None,
            received_at: None,
        }
    }

    /// Feed one chunk; true when a fresh payload superseded the previous one.
    pub fn feed_chunk(&mut self, chunk: &[u8], secret: &Secret) -> bool {
        match self.assembler.feed(chunk, secret) {
            Some(payload) => {
                self.kind = Some(payload.kind());
                self.payload = Some(payload);
                true
            }
            None => false,
        }
    }
}
