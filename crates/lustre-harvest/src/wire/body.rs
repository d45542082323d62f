// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Snapshot body serialization.
//!
//! Length-prefixed, key-sorted, big-endian records. The format is
//! self-describing (the decoder recovers the nested map shape without outside
//! context) and deterministic: maps serialize in key order, so the same
//! payload always produces the same bytes and therefore the same body digest
//! on both ends of the connection.
//!
//! # Wire Format
//!
//! ```text
//! +-----+-------------------------------------------------------+
//! | tag | 0 = direct gather, 1 = relayed fleet table            |
//! +-----+-------------------------------------------------------+
//! direct:  u32 fs count
//!          per fs:     str name, u32 target count
//!          per target: str name, u8 role, u32 client count
//!          per client: str id, u64 read_bytes, u64 write_bytes, u64 ops
//! relay:   u32 fs count
//!          per fs:     str name, then 4 client maps
//!                      (read_bytes, write_bytes, oss_ops, mds_ops)
//!          per map:    u32 count, then (str id, u64 value) pairs
//! ```
//!
//! Integers are big-endian; strings are `u16` length + UTF-8 bytes.

use std::collections::BTreeMap;
use std::fmt;

use crate::snapshot::{
    ClientCounters, CounterMap, FleetTable, FsMap, Payload, TargetRole, TargetStats,
};

const TAG_DIRECT: u8 = 0;
const TAG_RELAY: u8 = 1;

const ROLE_OBJECT: u8 = 0;
const ROLE_METADATA: u8 = 1;

/// Body encode/decode errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// Ran out of bytes mid-record.
    Truncated,
    /// Unknown payload tag.
    BadTag(u8),
    /// Unknown target role byte.
    BadRole(u8),
    /// A string field is not UTF-8.
    BadUtf8,
    /// Bytes left over after the last record.
    TrailingBytes(usize),
    /// A name exceeds the u16 string-length prefix.
    StringTooLong(usize),
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated body"),
            Self::BadTag(tag) => write!(f, "unknown payload tag {}", tag),
            Self::BadRole(role) => write!(f, "unknown target role {}", role),
            Self::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after payload", n),
            Self::StringTooLong(n) => write!(f, "string of {} bytes exceeds length prefix", n),
        }
    }
}

impl std::error::Error for BodyError {}

/// Serialize a payload into its deterministic wire form.
pub fn encode(payload: &Payload) -> Result<Vec<u8>, BodyError> {
    let mut buf = Vec::with_capacity(4096);
    match payload {
        Payload::Direct(fss) => {
            buf.push(TAG_DIRECT);
            put_u32(&mut buf, fss.len() as u32);
            for (fs, targets) in fss {
                put_str(&mut buf, fs)?;
                put_u32(&mut buf, targets.len() as u32);
                for (target, stats) in targets {
                    put_str(&mut buf, target)?;
                    buf.push(match stats.role {
                        TargetRole::Object => ROLE_OBJECT,
                        TargetRole::Metadata => ROLE_METADATA,
                    });
                    put_u32(&mut buf, stats.clients.len() as u32);
                    for (client, counters) in &stats.clients {
                        put_str(&mut buf, client)?;
                        put_u64(&mut buf, counters.read_bytes);
                        put_u64(&mut buf, counters.write_bytes);
                        put_u64(&mut buf, counters.ops);
                    }
                }
            }
        }
        Payload::Relay(fleet) => {
            buf.push(TAG_RELAY);
            put_u32(&mut buf, fleet.filesystems.len() as u32);
            for fs in &fleet.filesystems {
                put_str(&mut buf, fs)?;
                for family in [
                    &fleet.read_bytes,
                    &fleet.write_bytes,
                    &fleet.oss_ops,
                    &fleet.mds_ops,
                ] {
                    put_counter_map(&mut buf, family.get(fs))?;
                }
            }
        }
    }
    Ok(buf)
}

/// Decode a complete body. Rejects trailing garbage.
pub fn decode(bytes: &[u8]) -> Result<Payload, BodyError> {
    let mut cur = Cursor::new(bytes);
    let payload = match cur.take_u8()? {
        TAG_DIRECT => {
            let mut fss = FsMap::new();
            for _ in 0..cur.take_count()? {
                let fs = cur.take_str()?;
                let mut targets = BTreeMap::new();
                for _ in 0..cur.take_count()? {
                    let target = cur.take_str()?;
                    let role = match cur.take_u8()? {
                        ROLE_OBJECT => TargetRole::Object,
                        ROLE_METADATA => TargetRole::Metadata,
                        other => return Err(BodyError::BadRole(other)),
                    };
                    let mut stats = TargetStats::new(role);
                    for _ in 0..cur.take_count()? {
                        let client = cur.take_str()?;
                        let counters = ClientCounters {
                            read_bytes: cur.take_u64()?,
                            write_bytes: cur.take_u64()?,
                            ops: cur.take_u64()?,
                        };
                        stats.clients.insert(client, counters);
                    }
                    targets.insert(target, stats);
                }
                fss.insert(fs, targets);
            }
            Payload::Direct(fss)
        }
        TAG_RELAY => {
            let mut fleet = FleetTable::default();
            for _ in 0..cur.take_count()? {
                let fs = cur.take_str()?;
                fleet.read_bytes.insert(fs.clone(), take_counter_map(&mut cur)?);
                fleet.write_bytes.insert(fs.clone(), take_counter_map(&mut cur)?);
                fleet.oss_ops.insert(fs.clone(), take_counter_map(&mut cur)?);
                fleet.mds_ops.insert(fs.clone(), take_counter_map(&mut cur)?);
                fleet.filesystems.push(fs);
            }
            Payload::Relay(fleet)
        }
        other => return Err(BodyError::BadTag(other)),
    };
    if cur.remaining() > 0 {
        return Err(BodyError::TrailingBytes(cur.remaining()));
    }
    Ok(payload)
}

// ===== Write helpers =====

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), BodyError> {
    let len = u16::try_from(s.len()).map_err(|_| BodyError::StringTooLong(s.len()))?;
    put_u16(buf, len);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_counter_map(buf: &mut Vec<u8>, map: Option<&CounterMap>) -> Result<(), BodyError> {
    match map {
        Some(map) => {
            put_u32(buf, map.len() as u32);
            for (client, value) in map {
                put_str(buf, client)?;
                put_u64(buf, *value);
            }
        }
        None => put_u32(buf, 0),
    }
    Ok(())
}

fn take_counter_map(cur: &mut Cursor<'_>) -> Result<CounterMap, BodyError> {
    let mut map = CounterMap::new();
    for _ in 0..cur.take_count()? {
        let client = cur.take_str()?;
        let value = cur.take_u64()?;
        map.insert(client, value);
    }
    Ok(map)
}

// ===== Read cursor =====

/// Bounds-checked reader over a body slice.
struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BodyError> {
        if self.remaining() < n {
            return Err(BodyError::Truncated);
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, BodyError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, BodyError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, BodyError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, BodyError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// A record count. Every record is at least one byte, so a count larger
    /// than the remaining input is a corrupt length, not a big message.
    fn take_count(&mut self) -> Result<usize, BodyError> {
        let n = self.take_u32()? as usize;
        if n > self.remaining() {
            return Err(BodyError::Truncated);
        }
        Ok(n)
    }

    fn take_str(&mut self) -> Result<String, BodyError> {
        let len = self.take_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| BodyError::BadUtf8)
    }
}
