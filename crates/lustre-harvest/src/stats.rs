// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Counter source reader.
//!
//! Walks the Lustre per-export stats tree on an OSS/MDS host:
//!
//! ```text
//! /proc/fs/lustre/obdfilter/data-OST0013/exports/10.1.99.4@o2ib/stats
//! /proc/fs/lustre/{mds,mdt}/data-MDT0000/exports/10.1.14.1@o2ib/stats
//! ```
//!
//! A stats file is a whitespace-delimited record per line:
//!
//! ```text
//! snapshot_time             1340428613.428605 secs.usecs
//! read_bytes                47738 samples [bytes] 0 1048576 13585464050
//! write_bytes               7681 samples [bytes] 5 1048576 5813192368
//! ```
//!
//! `read_bytes`/`write_bytes` carry the cumulative byte count at value
//! index 5; every other `[reqs]` record contributes its sample count to an
//! operations sum. The reader never propagates I/O errors: anything it
//! cannot read it skips, and it returns whatever it could collect.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config;
use crate::snapshot::{RawCounters, TargetName, TargetRole, TargetStats};

/// Records that never count toward the operations sum.
const NON_OP_RECORDS: &[&str] = &["read_bytes", "write_bytes", "snapshot_time", "ping"];

/// Value-token index of the cumulative byte count in a
/// `read_bytes`/`write_bytes` record.
const CUMULATIVE_INDEX: usize = 5;

/// The stats directory roots this host is read from.
///
/// Production paths come from [`config`]; tests point an instance at a
/// scratch tree instead.
#[derive(Debug, Clone)]
pub struct StatsTree {
    object_dirs: Vec<PathBuf>,
    metadata_dirs: Vec<PathBuf>,
}

impl StatsTree {
    #[must_use]
    pub fn new(object_dirs: Vec<PathBuf>, metadata_dirs: Vec<PathBuf>) -> Self {
        Self {
            object_dirs,
            metadata_dirs,
        }
    }

    /// The live `/proc/fs/lustre` layout.
    #[must_use]
    pub fn production() -> Self {
        Self::new(
            config::OBJECT_STATS_DIRS.iter().map(PathBuf::from).collect(),
            config::METADATA_STATS_DIRS.iter().map(PathBuf::from).collect(),
        )
    }

    /// Gather one filesystem's targets and their per-client counters.
    ///
    /// A target qualifies when its directory name is `<fs>-<rest>`. Targets
    /// that exist but export nothing still appear in the result with their
    /// role; the server counts targets per filesystem.
    #[must_use]
    pub fn gather(&self, fs: &str) -> BTreeMap<TargetName, TargetStats> {
        let mut targets = BTreeMap::new();
        for (role, dirs) in [
            (TargetRole::Object, &self.object_dirs),
            (TargetRole::Metadata, &self.metadata_dirs),
        ] {
            for dir in dirs {
                let entries = match fs::read_dir(dir) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if !target_matches(fs, name) {
                        continue;
                    }
                    let stats = read_target(role, &entry.path().join("exports"));
                    targets.insert(name.to_string(), stats);
                }
            }
        }
        targets
    }
}

/// `data` matches `data-OST0013` but not `data2-OST0000` or bare `data`.
fn target_matches(fs: &str, name: &str) -> bool {
    match name.strip_prefix(fs) {
        Some(rest) => rest.starts_with('-'),
        None => false,
    }
}

/// Read every client export of one target.
fn read_target(role: TargetRole, exports: &Path) -> TargetStats {
    let mut stats = TargetStats::new(role);
    let entries = match fs::read_dir(exports) {
        Ok(entries) => entries,
        Err(_) => return stats,
    };
    for entry in entries.flatten() {
        let client = entry.file_name();
        let Some(client) = client.to_str() else { continue };
        let raw = match read_stats_file(&entry.path().join("stats")) {
            Ok(raw) => raw,
            Err(_) => continue,
        };

        // A client with no records at all is mds->oss ping traffic.
        if raw.is_empty() {
            continue;
        }
        // oss->{oss,mds} exports carry iops but never byte counters; that
        // intra-storage chatter is not client I/O.
        if role == TargetRole::Object && raw.read_bytes.is_none() && raw.write_bytes.is_none() {
            continue;
        }

        stats.clients.insert(client.to_string(), raw.normalized());
    }
    stats
}

/// Parse one stats file into raw counters.
///
/// Malformed numeric fields surface as errors so the caller drops the whole
/// client rather than reporting a partial triple.
fn read_stats_file(path: &Path) -> io::Result<RawCounters> {
    let text = fs::read_to_string(path)?;
    let mut raw = RawCounters::default();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else { continue };
        let values: Vec<&str> = tokens.collect();
        match name {
            "read_bytes" => raw.read_bytes = Some(parse_value(&values, CUMULATIVE_INDEX)?),
            "write_bytes" => raw.write_bytes = Some(parse_value(&values, CUMULATIVE_INDEX)?),
            _ => {
                if values.len() >= 3
                    && values[2] == "[reqs]"
                    && !NON_OP_RECORDS.contains(&name)
                {
                    let samples = parse_value(&values, 0)?;
                    raw.ops = Some(raw.ops.unwrap_or(0) + samples);
                }
            }
        }
    }
    Ok(raw)
}

fn parse_value(values: &[&str], index: usize) -> io::Result<u64> {
    values
        .get(index)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stats record"))
}
