// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client engine: runs on every OSS/MDS host.
//!
//! One persistent TCP connection, one blocking send per phase. Each phase:
//! gather counters for every configured filesystem, frame the snapshot, and
//! write it. Any send failure drops the connection; the engine reconnects
//! with a fixed backoff and keeps going. Nothing is buffered across a
//! server outage - the next phase simply sends fresh counters.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Instant;

use crate::config;
use crate::secret::Secret;
use crate::sched;
use crate::snapshot::{FsMap, Payload};
use crate::stats::StatsTree;
use crate::wire::{body, frame};

/// Everything a client instance needs to run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    pub filesystems: Vec<String>,
    pub gathers_per_minute: u32,
}

/// The harvesting client. Single-threaded; [`run`](HarvestClient::run)
/// never returns.
pub struct HarvestClient {
    config: ClientConfig,
    tree: StatsTree,
    secret: Secret,
}

impl HarvestClient {
    #[must_use]
    pub fn new(config: ClientConfig, tree: StatsTree, secret: Secret) -> Self {
        Self {
            config,
            tree,
            secret,
        }
    }

    /// Gather-and-send loop. Reconnects forever.
    pub fn run(&self) -> ! {
        let period = sched::period_secs(self.config.gathers_per_minute);
        loop {
            let (mut interval, _) =
                sched::sync_to_next_interval(self.config.gathers_per_minute, 0.0);

            let mut stream = match self.connect() {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!(
                        "[client] could not connect to {}:{}: {}",
                        self.config.server,
                        self.config.port,
                        err
                    );
                    thread::sleep(config::RECONNECT_DELAY);
                    continue;
                }
            };
            log::info!(
                "[client] connected to {}:{}",
                self.config.server,
                self.config.port
            );

            loop {
                let started = Instant::now();
                let snapshot = self.gather();

                if let Err(err) = self.send(&mut stream, snapshot) {
                    log::error!("[client] send failed: {}", err);
                    break;
                }

                let (next, _) =
                    sched::sync_to_next_interval(self.config.gathers_per_minute, 0.0);
                let elapsed = started.elapsed().as_secs_f64();
                if next != (interval + 1) % self.config.gathers_per_minute || elapsed > period {
                    log::warn!(
                        "[client] collect took too long: {:.1}s, interval {} -> {}",
                        elapsed,
                        interval,
                        next
                    );
                }
                interval = next;
            }
        }
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect((self.config.server.as_str(), self.config.port))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// One phase's snapshot across all configured filesystems.
    fn gather(&self) -> FsMap {
        let mut fss = BTreeMap::new();
        for fs in &self.config.filesystems {
            let targets = self.tree.gather(fs);
            log::debug!(
                "[client] {}: {} targets, {} clients",
                fs,
                targets.len(),
                targets.values().map(|t| t.clients.len()).sum::<usize>()
            );
            fss.insert(fs.clone(), targets);
        }
        fss
    }

    fn send(&self, stream: &mut TcpStream, snapshot: FsMap) -> std::io::Result<()> {
        let payload = Payload::Direct(snapshot);
        let body = body::encode(&payload)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let header = frame::encode_header(&body, &self.secret);

        stream.write_all(&header)?;
        stream.write_all(&body)?;
        log::debug!("[client] sent {} byte snapshot", body.len());
        Ok(())
    }
}
