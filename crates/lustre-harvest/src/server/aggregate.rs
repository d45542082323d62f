// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fleet aggregation: summing peer snapshots, merging relayed tables, and
//! turning consecutive fleet tables into per-second rates.
//!
//! All functions here are pure over their inputs (plus logging); the event
//! loop owns the state and the clock.

use std::collections::BTreeSet;

use crate::snapshot::{CounterMap, FleetTable, FsMap, RateMap, RateTable, TargetRole};

/// One direct peer's contribution to a flush.
pub struct DirectReport<'a> {
    /// Peer label for logs.
    pub source: String,
    pub data: &'a FsMap,
    /// Seconds since this snapshot arrived.
    pub age_secs: f64,
}

/// Sum all direct snapshots into one fleet table.
///
/// Builds the sorted unions of filesystems and clients, zero-fills every
/// (filesystem, client) slot, then accumulates counters with `ops` routed to
/// the object or metadata family by target role. Filesystems observed only
/// through a single metadata target keep their `mds_ops` and lose the other
/// three families: those deployments monitor the MDT alone, and partial
/// object counters would look like real I/O.
pub fn sum_fleet(reports: &[DirectReport<'_>], period_secs: f64) -> FleetTable {
    let mut stalest = 0.0f64;
    for report in reports {
        if report.age_secs > period_secs {
            log::warn!(
                "[server] old data from {}: {:.1}s past the sweep",
                report.source,
                report.age_secs
            );
        }
        stalest = stalest.max(report.age_secs);
        if report.data.is_empty() {
            log::warn!("[server] no filesystems found on {}", report.source);
        }
    }
    log::debug!("[server] stalest data {:.1}s", stalest);

    // Universes and per-filesystem target counts.
    let mut fss = BTreeSet::new();
    let mut clients = BTreeSet::new();
    let mut ost_cnt = std::collections::BTreeMap::new();
    let mut mdt_cnt = std::collections::BTreeMap::new();
    let mut targets_total = 0usize;
    for report in reports {
        for (fs, targets) in report.data {
            fss.insert(fs.clone());
            for stats in targets.values() {
                targets_total += 1;
                let slot = match stats.role {
                    TargetRole::Object => ost_cnt.entry(fs.clone()).or_insert(0u32),
                    TargetRole::Metadata => mdt_cnt.entry(fs.clone()).or_insert(0u32),
                };
                *slot += 1;
                for client in stats.clients.keys() {
                    clients.insert(client.clone());
                }
            }
        }
    }
    log::debug!(
        "[server] {} oss/mds, {} ost/mdt, {} clients, filesystems {:?}",
        reports.len(),
        targets_total,
        clients.len(),
        fss
    );

    let mut fleet = FleetTable {
        filesystems: fss.iter().cloned().collect(),
        ..Default::default()
    };
    for fs in &fleet.filesystems {
        let zeroed: CounterMap = clients.iter().map(|c| (c.clone(), 0u64)).collect();
        fleet.read_bytes.insert(fs.clone(), zeroed.clone());
        fleet.write_bytes.insert(fs.clone(), zeroed.clone());
        fleet.oss_ops.insert(fs.clone(), zeroed.clone());
        fleet.mds_ops.insert(fs.clone(), zeroed);
    }

    for report in reports {
        for (fs, targets) in report.data {
            for stats in targets.values() {
                let ops_family = match stats.role {
                    TargetRole::Object => &mut fleet.oss_ops,
                    TargetRole::Metadata => &mut fleet.mds_ops,
                };
                for (client, counters) in &stats.clients {
                    *ops_family
                        .entry(fs.clone())
                        .or_default()
                        .entry(client.clone())
                        .or_insert(0) += counters.ops;
                    *fleet
                        .read_bytes
                        .entry(fs.clone())
                        .or_default()
                        .entry(client.clone())
                        .or_insert(0) += counters.read_bytes;
                    *fleet
                        .write_bytes
                        .entry(fs.clone())
                        .or_default()
                        .entry(client.clone())
                        .or_insert(0) += counters.write_bytes;
                }
            }
        }
    }

    if log::log_enabled!(log::Level::Debug) {
        for fs in &fleet.filesystems {
            const GIB: u64 = 1024 * 1024 * 1024;
            const MEG: u64 = 1024 * 1024;
            let sum = |family: &std::collections::BTreeMap<String, CounterMap>| {
                family.get(fs).map_or(0u64, |m| m.values().sum())
            };
            log::debug!(
                "[server] {} tot GB r,w, M ops mds,oss: {} {} {} {}",
                fs,
                sum(&fleet.read_bytes) / GIB,
                sum(&fleet.write_bytes) / GIB,
                sum(&fleet.mds_ops) / MEG,
                sum(&fleet.oss_ops) / MEG
            );
        }
    }

    // Metadata-only observation: a lone MDT and no OSTs.
    for fs in &fleet.filesystems {
        let osts = ost_cnt.get(fs).copied().unwrap_or(0);
        let mdts = mdt_cnt.get(fs).copied().unwrap_or(0);
        if osts == 0 && mdts == 1 {
            log::debug!("[server] {} is mdt only", fs);
            fleet.read_bytes.insert(fs.clone(), CounterMap::new());
            fleet.write_bytes.insert(fs.clone(), CounterMap::new());
            fleet.oss_ops.insert(fs.clone(), CounterMap::new());
        }
    }

    fleet
}

/// Splice a relayed fleet table into the local one.
///
/// Relayed filesystems are disjoint from local ones by design; a collision
/// means misconfigured relay topology and the relayed filesystem is dropped,
/// never overwritten.
pub fn merge_remote(local: &mut FleetTable, remote: &FleetTable, source: &str) {
    for fs in &remote.filesystems {
        if local.filesystems.contains(fs) {
            log::error!(
                "[server] remote summed data from {} is for a local fs {}, ignoring",
                source,
                fs
            );
            continue;
        }
        local.filesystems.push(fs.clone());
        local
            .read_bytes
            .insert(fs.clone(), remote.read_bytes.get(fs).cloned().unwrap_or_default());
        local
            .write_bytes
            .insert(fs.clone(), remote.write_bytes.get(fs).cloned().unwrap_or_default());
        local
            .oss_ops
            .insert(fs.clone(), remote.oss_ops.get(fs).cloned().unwrap_or_default());
        local
            .mds_ops
            .insert(fs.clone(), remote.mds_ops.get(fs).cloned().unwrap_or_default());
        log::debug!("[server] merged relayed fs {} from {}", fs, source);
    }
}

/// Difference one metric family into per-second rates.
///
/// The common case is an unchanged client set, which reduces to one aligned
/// walk. When clients changed, clients new this cycle rate at zero and
/// departed clients vanish. A shrinking counter (target failover or server
/// reboot) rates at zero and raises the error flag.
pub fn compute_rates(prev: &CounterMap, cur: &CounterMap, delta_secs: f64) -> (RateMap, bool) {
    let mut err = false;
    let mut rates = RateMap::new();
    if cur.is_empty() {
        return (rates, err);
    }

    if prev.len() == cur.len() && prev.keys().eq(cur.keys()) {
        for (client, &now) in cur {
            let before = prev.get(client).copied().unwrap_or(0);
            rates.insert(client.clone(), checked_rate(client, before, now, delta_secs, &mut err));
        }
        return (rates, err);
    }

    for (client, &now) in cur {
        match prev.get(client) {
            Some(&before) => {
                rates.insert(client.clone(), checked_rate(client, before, now, delta_secs, &mut err));
            }
            None => {
                rates.insert(client.clone(), 0.0);
            }
        }
    }
    (rates, err)
}

fn checked_rate(client: &str, before: u64, now: u64, delta_secs: f64, err: &mut bool) -> f64 {
    if now < before {
        log::warn!(
            "[server] negative rate for {}: {} -> {}",
            client,
            before,
            now
        );
        *err = true;
        return 0.0;
    }
    (now - before) as f64 / delta_secs
}

/// Difference two fleet tables across every filesystem and family.
pub fn rate_table(prev: &FleetTable, cur: &FleetTable, delta_secs: f64) -> (RateTable, bool) {
    let empty = CounterMap::new();
    let mut rates = RateTable {
        filesystems: cur.filesystems.clone(),
        ..Default::default()
    };
    let mut err = false;
    for fs in &cur.filesystems {
        let families = [
            (&prev.read_bytes, &cur.read_bytes, &mut rates.read_bytes),
            (&prev.write_bytes, &cur.write_bytes, &mut rates.write_bytes),
            (&prev.oss_ops, &cur.oss_ops, &mut rates.oss_ops),
            (&prev.mds_ops, &cur.mds_ops, &mut rates.mds_ops),
        ];
        for (prev_family, cur_family, out) in families {
            let (family_rates, family_err) = compute_rates(
                prev_family.get(fs).unwrap_or(&empty),
                cur_family.get(fs).unwrap_or(&empty),
                delta_secs,
            );
            err |= family_err;
            out.insert(fs.clone(), family_rates);
        }
    }
    (rates, err)
}

/// Decide what one flush cycle publishes.
///
/// Returns the rate table to publish, if any, and whether the next cycle
/// must re-baseline. The first cycle after startup, after fleet membership
/// changed, or after a filesystem-set change only records counters; a
/// negative delta anywhere suppresses the whole cycle and re-baselines.
pub fn evaluate_cycle(
    prev: &FleetTable,
    cur: &FleetTable,
    delta_secs: f64,
    rebaseline: bool,
) -> (Option<RateTable>, bool) {
    if rebaseline {
        log::debug!("[server] baseline cycle, nothing published");
        return (None, false);
    }
    if prev.filesystems != cur.filesystems {
        log::info!(
            "[server] filesystem set changed {:?} -> {:?}, re-baselining",
            prev.filesystems,
            cur.filesystems
        );
        return (None, false);
    }
    if delta_secs <= 0.0 {
        log::warn!("[server] non-positive rate interval {:.3}s, skipping", delta_secs);
        return (None, false);
    }

    let (rates, err) = rate_table(prev, cur, delta_secs);
    if err {
        log::error!("[server] negative rate found, resetting all rates");
        return (None, true);
    }

    if log::log_enabled!(log::Level::Debug) {
        for fs in &rates.filesystems {
            let sum = |family: &std::collections::BTreeMap<String, RateMap>| {
                family.get(fs).map_or(0.0, |m| m.values().sum())
            };
            log::debug!(
                "[server] {} rates r,w,ossOps,mdsOps: {:.0} {:.0} {:.0} {:.0}",
                fs,
                sum(&rates.read_bytes),
                sum(&rates.write_bytes),
                sum(&rates.oss_ops),
                sum(&rates.mds_ops)
            );
        }
    }
    (Some(rates), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ClientCounters, TargetStats};
    use std::collections::BTreeMap;

    fn target(role: TargetRole, clients: &[(&str, u64, u64, u64)]) -> TargetStats {
        let mut stats = TargetStats::new(role);
        for (id, r, w, ops) in clients {
            stats.clients.insert(
                (*id).to_string(),
                ClientCounters {
                    read_bytes: *r,
                    write_bytes: *w,
                    ops: *ops,
                },
            );
        }
        stats
    }

    fn fs_map(entries: Vec<(&str, Vec<(&str, TargetStats)>)>) -> FsMap {
        entries
            .into_iter()
            .map(|(fs, targets)| {
                (
                    fs.to_string(),
                    targets
                        .into_iter()
                        .map(|(t, s)| (t.to_string(), s))
                        .collect::<BTreeMap<_, _>>(),
                )
            })
            .collect()
    }

    fn report<'a>(source: &str, data: &'a FsMap) -> DirectReport<'a> {
        DirectReport {
            source: source.to_string(),
            data,
            age_secs: 0.0,
        }
    }

    #[test]
    fn test_sum_across_peers_and_targets() {
        let oss1 = fs_map(vec![(
            "data",
            vec![(
                "data-OST0000",
                target(TargetRole::Object, &[("10.0.0.1@o2ib", 100, 10, 5)]),
            )],
        )]);
        let oss2 = fs_map(vec![(
            "data",
            vec![(
                "data-OST0001",
                target(TargetRole::Object, &[("10.0.0.1@o2ib", 50, 5, 2)]),
            )],
        )]);

        let reports = vec![report("oss1", &oss1), report("oss2", &oss2)];
        let fleet = sum_fleet(&reports, 20.0);

        assert_eq!(fleet.filesystems, vec!["data"]);
        assert_eq!(fleet.read_bytes["data"]["10.0.0.1@o2ib"], 150);
        assert_eq!(fleet.write_bytes["data"]["10.0.0.1@o2ib"], 15);
        assert_eq!(fleet.oss_ops["data"]["10.0.0.1@o2ib"], 7);
        assert_eq!(fleet.mds_ops["data"]["10.0.0.1@o2ib"], 0);
    }

    #[test]
    fn test_ops_routed_by_role() {
        let node = fs_map(vec![(
            "data",
            vec![
                (
                    "data-OST0000",
                    target(TargetRole::Object, &[("10.0.0.1@o2ib", 100, 0, 5)]),
                ),
                (
                    "data-MDT0000",
                    target(TargetRole::Metadata, &[("10.0.0.1@o2ib", 0, 0, 900)]),
                ),
            ],
        )]);

        let reports = vec![report("oss1", &node)];
        let fleet = sum_fleet(&reports, 20.0);

        assert_eq!(fleet.oss_ops["data"]["10.0.0.1@o2ib"], 5);
        assert_eq!(fleet.mds_ops["data"]["10.0.0.1@o2ib"], 900);
    }

    #[test]
    fn test_client_universe_zero_fills_all_filesystems() {
        let node = fs_map(vec![
            (
                "data",
                vec![(
                    "data-OST0000",
                    target(TargetRole::Object, &[("10.0.0.1@o2ib", 100, 0, 0)]),
                )],
            ),
            (
                "apps",
                vec![(
                    "apps-OST0000",
                    target(TargetRole::Object, &[("10.0.0.2@o2ib", 7, 0, 0)]),
                )],
            ),
        ]);

        let reports = vec![report("oss1", &node)];
        let fleet = sum_fleet(&reports, 20.0);

        // Both clients exist in both filesystems, zeroed where unseen.
        assert_eq!(fleet.read_bytes["data"]["10.0.0.2@o2ib"], 0);
        assert_eq!(fleet.read_bytes["apps"]["10.0.0.1@o2ib"], 0);
    }

    #[test]
    fn test_single_mdt_filesystem_suppressed_to_mds_ops() {
        let node = fs_map(vec![(
            "apps",
            vec![(
                "apps-MDT0000",
                target(TargetRole::Metadata, &[("10.0.0.1@o2ib", 3, 4, 900)]),
            )],
        )]);

        let reports = vec![report("mds1", &node)];
        let fleet = sum_fleet(&reports, 20.0);

        assert!(fleet.read_bytes["apps"].is_empty());
        assert!(fleet.write_bytes["apps"].is_empty());
        assert!(fleet.oss_ops["apps"].is_empty());
        assert_eq!(fleet.mds_ops["apps"]["10.0.0.1@o2ib"], 900);
    }

    #[test]
    fn test_two_mdts_not_suppressed() {
        let node = fs_map(vec![(
            "apps",
            vec![
                (
                    "apps-MDT0000",
                    target(TargetRole::Metadata, &[("10.0.0.1@o2ib", 3, 0, 1)]),
                ),
                (
                    "apps-MDT0001",
                    target(TargetRole::Metadata, &[("10.0.0.1@o2ib", 0, 0, 2)]),
                ),
            ],
        )]);

        let reports = vec![report("mds1", &node)];
        let fleet = sum_fleet(&reports, 20.0);

        assert_eq!(fleet.read_bytes["apps"]["10.0.0.1@o2ib"], 3);
        assert_eq!(fleet.mds_ops["apps"]["10.0.0.1@o2ib"], 3);
    }

    #[test]
    fn test_merge_remote_disjoint() {
        let mut local = FleetTable {
            filesystems: vec!["data".to_string()],
            ..Default::default()
        };
        local
            .read_bytes
            .insert("data".to_string(), CounterMap::new());

        let mut remote = FleetTable {
            filesystems: vec!["gdata".to_string()],
            ..Default::default()
        };
        let mut clients = CounterMap::new();
        clients.insert("10.2.0.1@o2ib2".to_string(), 500);
        remote.read_bytes.insert("gdata".to_string(), clients);

        merge_remote(&mut local, &remote, "relay-peer");
        assert_eq!(local.filesystems, vec!["data", "gdata"]);
        assert_eq!(local.read_bytes["gdata"]["10.2.0.1@o2ib2"], 500);
    }

    #[test]
    fn test_merge_remote_collision_dropped() {
        let mut local = FleetTable {
            filesystems: vec!["data".to_string()],
            ..Default::default()
        };
        let mut locals = CounterMap::new();
        locals.insert("10.0.0.1@o2ib".to_string(), 1);
        local.read_bytes.insert("data".to_string(), locals);

        let mut remote = FleetTable {
            filesystems: vec!["data".to_string()],
            ..Default::default()
        };
        let mut clients = CounterMap::new();
        clients.insert("10.2.0.1@o2ib2".to_string(), 500);
        remote.read_bytes.insert("data".to_string(), clients);

        merge_remote(&mut local, &remote, "relay-peer");
        assert_eq!(local.filesystems, vec!["data"]);
        assert_eq!(local.read_bytes["data"]["10.0.0.1@o2ib"], 1);
        assert!(!local.read_bytes["data"].contains_key("10.2.0.1@o2ib2"));
    }

    fn counters(entries: &[(&str, u64)]) -> CounterMap {
        entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn test_rates_common_case() {
        let prev = counters(&[("a", 100), ("b", 200)]);
        let cur = counters(&[("a", 300), ("b", 200)]);
        let (rates, err) = compute_rates(&prev, &cur, 20.0);
        assert!(!err);
        assert_eq!(rates["a"], 10.0);
        assert_eq!(rates["b"], 0.0);
    }

    #[test]
    fn test_rates_new_client_is_zero() {
        let prev = counters(&[("a", 100)]);
        let cur = counters(&[("a", 300), ("b", 999)]);
        let (rates, err) = compute_rates(&prev, &cur, 20.0);
        assert!(!err);
        assert_eq!(rates["a"], 10.0);
        assert_eq!(rates["b"], 0.0);
    }

    #[test]
    fn test_rates_departed_client_dropped() {
        let prev = counters(&[("a", 100), ("b", 50)]);
        let cur = counters(&[("a", 300)]);
        let (rates, _) = compute_rates(&prev, &cur, 20.0);
        assert!(!rates.contains_key("b"));
    }

    #[test]
    fn test_rates_counter_reset_flags_error() {
        let prev = counters(&[("a", 500)]);
        let cur = counters(&[("a", 100)]);
        let (rates, err) = compute_rates(&prev, &cur, 20.0);
        assert!(err);
        assert_eq!(rates["a"], 0.0);
    }

    #[test]
    fn test_rates_empty_current() {
        let prev = counters(&[("a", 500)]);
        let (rates, err) = compute_rates(&prev, &CounterMap::new(), 20.0);
        assert!(!err);
        assert!(rates.is_empty());
    }

    fn fleet_with(fs: &str, family_values: &[(&str, u64)]) -> FleetTable {
        let mut fleet = FleetTable {
            filesystems: vec![fs.to_string()],
            ..Default::default()
        };
        fleet.read_bytes.insert(fs.to_string(), counters(family_values));
        fleet.write_bytes.insert(fs.to_string(), counters(&[]));
        fleet.oss_ops.insert(fs.to_string(), counters(&[]));
        fleet.mds_ops.insert(fs.to_string(), counters(&[]));
        fleet
    }

    #[test]
    fn test_cycle_publishes_expected_rates() {
        // 100 MB -> 200 MB over 20s: 5 MB/s.
        let prev = fleet_with("data", &[("10.1.0.5@o2ib", 100_000_000)]);
        let cur = fleet_with("data", &[("10.1.0.5@o2ib", 200_000_000)]);

        let (rates, rebaseline) = evaluate_cycle(&prev, &cur, 20.0, false);
        assert!(!rebaseline);
        let rates = rates.expect("cycle publishes");
        assert_eq!(rates.read_bytes["data"]["10.1.0.5@o2ib"], 5_000_000.0);
    }

    #[test]
    fn test_baseline_cycle_publishes_nothing() {
        let cur = fleet_with("data", &[("10.1.0.5@o2ib", 100)]);
        let (rates, rebaseline) = evaluate_cycle(&FleetTable::default(), &cur, 20.0, true);
        assert!(rates.is_none());
        assert!(!rebaseline);
    }

    #[test]
    fn test_filesystem_set_change_skips_cycle() {
        let prev = fleet_with("data", &[("10.1.0.5@o2ib", 100)]);
        let cur = fleet_with("gdata", &[("10.1.0.5@o2ib", 200)]);
        let (rates, rebaseline) = evaluate_cycle(&prev, &cur, 20.0, false);
        assert!(rates.is_none());
        assert!(!rebaseline);
    }

    #[test]
    fn test_counter_reset_suppresses_whole_cycle() {
        let prev = fleet_with("data", &[("10.1.0.5@o2ib", 200_000_000)]);
        let cur = fleet_with("data", &[("10.1.0.5@o2ib", 50_000_000)]);

        let (rates, rebaseline) = evaluate_cycle(&prev, &cur, 20.0, false);
        assert!(rates.is_none());
        assert!(rebaseline);

        // Next cycle re-baselines from the post-reset counter and publishes.
        let next = fleet_with("data", &[("10.1.0.5@o2ib", 90_000_000)]);
        let (rates, _) = evaluate_cycle(&cur, &next, 20.0, true);
        assert!(rates.is_none());
        let after = fleet_with("data", &[("10.1.0.5@o2ib", 130_000_000)]);
        let (rates, rebaseline) = evaluate_cycle(&next, &after, 20.0, false);
        assert!(!rebaseline);
        assert_eq!(
            rates.expect("publishes").read_bytes["data"]["10.1.0.5@o2ib"],
            2_000_000.0
        );
    }

    #[test]
    fn test_relay_merge_flows_into_rates() {
        // Local filesystem plus a relayed one, two consecutive cycles.
        let build = |local_read: u64, remote_read: u64| {
            let mut fleet = fleet_with("data", &[("10.1.0.5@o2ib", local_read)]);
            let mut remote = FleetTable {
                filesystems: vec!["gdata".to_string()],
                ..Default::default()
            };
            remote
                .read_bytes
                .insert("gdata".to_string(), counters(&[("10.2.0.8@o2ib2", remote_read)]));
            merge_remote(&mut fleet, &remote, "relay-peer");
            fleet
        };

        let prev = build(100, 1_000);
        let cur = build(300, 5_000);
        let (rates, _) = evaluate_cycle(&prev, &cur, 20.0, false);
        let rates = rates.expect("publishes");
        assert_eq!(rates.read_bytes["data"]["10.1.0.5@o2ib"], 10.0);
        assert_eq!(rates.read_bytes["gdata"]["10.2.0.8@o2ib2"], 200.0);
    }
}
