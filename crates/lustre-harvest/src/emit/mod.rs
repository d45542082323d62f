// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Emission stage: rate tables out, spoofed gmetric packets in flight.
//!
//! Each filesystem publishes four metric families under its ganglia alias.
//! Client identities are `ip@lnet`; the ip resolves to a hostname through a
//! process-lifetime cache and becomes the `"ip:host"` spoof string. A client
//! whose ip does not resolve belongs to some other cluster whose hosts are
//! unknown here, and its datum is silently dropped.

pub mod gmetric;

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;

use crate::config;
use crate::snapshot::{RateMap, RateTable};

pub use gmetric::{Gmetric, MetricSink, Slope};

/// Rate publisher with spoofed identities.
///
/// Without a sink (dry-run mode) it resolves and logs but sends nothing.
pub struct Emitter {
    sink: Option<Box<dyn MetricSink>>,
    host_cache: HashMap<String, Option<String>>,
}

impl Emitter {
    /// Publisher against the configured gmond endpoint, or a dry-run no-op.
    pub fn to_gmond(dryrun: bool) -> io::Result<Self> {
        let sink: Option<Box<dyn MetricSink>> = if dryrun {
            log::info!("[emit] dryrun: not sending results to ganglia");
            None
        } else {
            Some(Box::new(Gmetric::new(
                config::GMOND_HOST,
                config::GMOND_PORT,
                config::GMOND_PROTO,
            )?))
        };
        Ok(Self::with_sink(sink))
    }

    #[must_use]
    pub fn with_sink(sink: Option<Box<dyn MetricSink>>) -> Self {
        Self {
            sink,
            host_cache: HashMap::new(),
        }
    }

    /// Publish one cycle's rate table.
    pub fn publish(&mut self, rates: &RateTable) {
        for fs in &rates.filesystems {
            let Some(alias) = config::publish_alias(fs) else {
                log::warn!("[emit] no publish alias for filesystem {}, skipping", fs);
                continue;
            };
            self.publish_family(rates.read_bytes.get(fs), alias, "read_bytes", "bytes/sec");
            self.publish_family(rates.write_bytes.get(fs), alias, "write_bytes", "bytes/sec");
            self.publish_family(rates.oss_ops.get(fs), alias, "oss_ops", "ops/sec");
            self.publish_family(rates.mds_ops.get(fs), alias, "mds_ops", "ops/sec");
        }
    }

    fn publish_family(&mut self, family: Option<&RateMap>, alias: &str, suffix: &str, units: &str) {
        let Some(family) = family else { return };
        if family.is_empty() {
            return;
        }
        let name = format!("{}_{}", alias, suffix);
        for (client, rate) in family {
            let ip = match client.split_once('@') {
                Some((ip, _)) => ip,
                None => client.as_str(),
            };
            let Some(host) = self.resolve(ip) else {
                // Data for a different cluster; its hosts are unknown here.
                continue;
            };
            let spoof = format!("{}:{}", ip, host);
            let value = format!("{:.2}", rate);
            match &mut self.sink {
                Some(sink) => {
                    if let Err(err) =
                        sink.send(&name, &value, "float", units, Slope::Both, 60, 0, "", &spoof)
                    {
                        log::warn!("[emit] send of {} for {} failed: {}", name, spoof, err);
                    }
                }
                None => log::debug!("[emit] dryrun {} = {} as {}", name, value, spoof),
            }
        }
    }

    /// Reverse-resolve an ip, remembering failures as well as successes.
    fn resolve(&mut self, ip: &str) -> Option<String> {
        if let Some(cached) = self.host_cache.get(ip) {
            return cached.clone();
        }
        let resolved = ip
            .parse::<IpAddr>()
            .ok()
            .and_then(|addr| dns_lookup::lookup_addr(&addr).ok());
        if resolved.is_none() {
            log::debug!("[emit] unknown host for {}", ip);
        }
        self.host_cache.insert(ip.to_string(), resolved.clone());
        resolved
    }

    /// Pre-seed the resolver cache; tests pin resolution without DNS.
    #[cfg(test)]
    pub(crate) fn seed_host(&mut self, ip: &str, host: Option<&str>) {
        self.host_cache
            .insert(ip.to_string(), host.map(str::to_string));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RateMap;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records every datum instead of sending it.
    #[derive(Default)]
    struct Recorder {
        sent: Rc<RefCell<Vec<(String, String, String)>>>,
    }

    impl MetricSink for Recorder {
        fn send(
            &mut self,
            name: &str,
            value: &str,
            _type_name: &str,
            _units: &str,
            _slope: Slope,
            _tmax: u32,
            _dmax: u32,
            _group: &str,
            spoof: &str,
        ) -> io::Result<()> {
            self.sent
                .borrow_mut()
                .push((name.to_string(), value.to_string(), spoof.to_string()));
            Ok(())
        }
    }

    fn recording_emitter() -> (Emitter, Rc<RefCell<Vec<(String, String, String)>>>) {
        let recorder = Recorder::default();
        let sent = Rc::clone(&recorder.sent);
        (Emitter::with_sink(Some(Box::new(recorder))), sent)
    }

    fn rate_map(entries: &[(&str, f64)]) -> RateMap {
        entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn table(fs: &str, read: RateMap, mds: RateMap) -> RateTable {
        let mut rates = RateTable {
            filesystems: vec![fs.to_string()],
            ..Default::default()
        };
        rates.read_bytes.insert(fs.to_string(), read);
        rates.write_bytes.insert(fs.to_string(), RateMap::new());
        rates.oss_ops.insert(fs.to_string(), RateMap::new());
        rates.mds_ops.insert(fs.to_string(), mds);
        rates
    }

    #[test]
    fn test_publish_aliases_and_formats() {
        let (mut emitter, sent) = recording_emitter();
        emitter.seed_host("10.1.0.5", Some("cn42"));

        let rates = table(
            "data",
            rate_map(&[("10.1.0.5@o2ib", 5_000_000.0)]),
            RateMap::new(),
        );
        emitter.publish(&rates);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            (
                "vu_short_read_bytes".to_string(),
                "5000000.00".to_string(),
                "10.1.0.5:cn42".to_string()
            )
        );
    }

    #[test]
    fn test_metadata_only_filesystem_emits_only_mds_ops() {
        let (mut emitter, sent) = recording_emitter();
        emitter.seed_host("10.1.0.5", Some("cn42"));

        let rates = table(
            "apps",
            RateMap::new(),
            rate_map(&[("10.1.0.5@o2ib", 47.5)]),
        );
        emitter.publish(&rates);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "vu_apps_mds_ops");
        assert_eq!(sent[0].1, "47.50");
    }

    #[test]
    fn test_unknown_host_dropped_others_published() {
        let (mut emitter, sent) = recording_emitter();
        emitter.seed_host("10.1.0.5", Some("cn42"));
        emitter.seed_host("10.99.0.5", None);

        let rates = table(
            "data",
            rate_map(&[("10.1.0.5@o2ib", 1.0), ("10.99.0.5@o2ib", 2.0)]),
            RateMap::new(),
        );
        emitter.publish(&rates);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, "10.1.0.5:cn42");
    }

    #[test]
    fn test_unmapped_filesystem_skipped() {
        let (mut emitter, sent) = recording_emitter();
        emitter.seed_host("10.1.0.5", Some("cn42"));

        let rates = table(
            "scratch",
            rate_map(&[("10.1.0.5@o2ib", 1.0)]),
            RateMap::new(),
        );
        emitter.publish(&rates);
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_dryrun_sends_nothing() {
        let mut emitter = Emitter::with_sink(None);
        emitter.seed_host("10.1.0.5", Some("cn42"));

        let rates = table(
            "data",
            rate_map(&[("10.1.0.5@o2ib", 1.0)]),
            RateMap::new(),
        );
        // Nothing to assert beyond "does not panic / does not send".
        emitter.publish(&rates);
    }

    #[test]
    fn test_negative_cache_prevents_repeat_lookups() {
        let (mut emitter, _) = recording_emitter();
        emitter.seed_host("203.0.113.7", None);
        // The seeded failure short-circuits; no real DNS is attempted.
        assert_eq!(emitter.resolve("203.0.113.7"), None);
    }
}
