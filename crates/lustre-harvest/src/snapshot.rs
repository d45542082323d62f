// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data model shared by the reader, the wire codec, and the server.
//!
//! Maps are `BTreeMap` throughout: everything here either crosses the wire
//! (where key-sorted iteration keeps the serialization and its digest
//! deterministic) or gets unioned across peers (where sorted keys come for
//! free).

use std::collections::BTreeMap;
use std::fmt;

/// Lustre filesystem name, e.g. `data`.
pub type FsName = String;
/// Target name, e.g. `data-OST0013`.
pub type TargetName = String;
/// Client identity of the form `ipv4@lnet`, e.g. `10.1.99.4@o2ib`.
pub type ClientId = String;

/// Per-client counters as parsed from a stats file. `None` means the record
/// was absent, which is not the same as a zero counter: a client whose
/// records are all absent is dropped entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCounters {
    pub read_bytes: Option<u64>,
    pub write_bytes: Option<u64>,
    pub ops: Option<u64>,
}

impl RawCounters {
    /// True when no record was found at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_bytes.is_none() && self.write_bytes.is_none() && self.ops.is_none()
    }

    /// Wire form: absent records become zero.
    #[must_use]
    pub fn normalized(&self) -> ClientCounters {
        ClientCounters {
            read_bytes: self.read_bytes.unwrap_or(0),
            write_bytes: self.write_bytes.unwrap_or(0),
            ops: self.ops.unwrap_or(0),
        }
    }
}

/// Cumulative per-client counters since target creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub ops: u64,
}

/// The two roles a storage target can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRole {
    /// OST: bulk data I/O.
    Object,
    /// MDT: namespace operations.
    Metadata,
}

impl TargetRole {
    /// Short label for logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Object => "oss",
            Self::Metadata => "mds",
        }
    }
}

/// One target's counters: its role plus one entry per exporting client.
///
/// A target with no surviving clients still carries its role - the server
/// counts targets per filesystem to decide metadata-only suppression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStats {
    pub role: TargetRole,
    pub clients: BTreeMap<ClientId, ClientCounters>,
}

impl TargetStats {
    #[must_use]
    pub fn new(role: TargetRole) -> Self {
        Self {
            role,
            clients: BTreeMap::new(),
        }
    }
}

/// One node's gather: filesystem -> target -> per-client counters.
pub type FsMap = BTreeMap<FsName, BTreeMap<TargetName, TargetStats>>;

/// Per-client counter map of one metric family within a filesystem.
pub type CounterMap = BTreeMap<ClientId, u64>;
/// Per-client per-second rates of one metric family within a filesystem.
pub type RateMap = BTreeMap<ClientId, f64>;

/// A complete message body: either a node's direct gather or another
/// server's already-summed fleet table.
///
/// The discriminant doubles as the wire `dataType`; on decode it is lifted
/// into the peer state so the payload itself stays pure filesystem data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Direct(FsMap),
    Relay(FleetTable),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Direct(_) => PayloadKind::Direct,
            Self::Relay(_) => PayloadKind::Relay,
        }
    }
}

/// Peer-level discriminator of the last message a peer delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Direct,
    Relay,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Fleet-wide post-sum counters for one flush cycle.
///
/// Four parallel maps rather than a per-client struct: metadata-only
/// suppression drops whole metric families, rates are differenced per
/// family, and the relay payload carries the families verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetTable {
    /// Sorted, de-duplicated union of filesystems seen this cycle.
    pub filesystems: Vec<FsName>,
    pub read_bytes: BTreeMap<FsName, CounterMap>,
    pub write_bytes: BTreeMap<FsName, CounterMap>,
    pub oss_ops: BTreeMap<FsName, CounterMap>,
    pub mds_ops: BTreeMap<FsName, CounterMap>,
}

/// Per-second rates derived from two consecutive fleet tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateTable {
    pub filesystems: Vec<FsName>,
    pub read_bytes: BTreeMap<FsName, RateMap>,
    pub write_bytes: BTreeMap<FsName, RateMap>,
    pub oss_ops: BTreeMap<FsName, RateMap>,
    pub mds_ops: BTreeMap<FsName, RateMap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_counters_empty() {
        assert!(RawCounters::default().is_empty());
        let some = RawCounters {
            ops: Some(0),
            ..Default::default()
        };
        assert!(!some.is_empty());
    }

    #[test]
    fn test_raw_counters_normalized() {
        let raw = RawCounters {
            read_bytes: Some(42),
            write_bytes: None,
            ops: Some(7),
        };
        assert_eq!(
            raw.normalized(),
            ClientCounters {
                read_bytes: 42,
                write_bytes: 0,
                ops: 7
            }
        );
    }

    #[test]
    fn test_payload_kind() {
        let direct = Payload::Direct(FsMap::new());
        let relay = Payload::Relay(FleetTable::default());
        assert_eq!(direct.kind(), PayloadKind::Direct);
        assert_eq!(relay.kind(), PayloadKind::Relay);
        assert_eq!(direct.kind().to_string(), "direct");
        assert_eq!(relay.kind().to_string(), "relay");
    }
}
