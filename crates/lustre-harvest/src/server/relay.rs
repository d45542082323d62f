// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inter-site relay.
//!
//! A server that harvests a central filesystem mostly holds data about
//! clients on other clusters. After each flush it re-frames the summed
//! fleet table as a `relay` message and pushes it to the server instances on
//! those clusters, which merge it as a disjoint set of filesystems.
//!
//! Connections are lazy and best-effort: a failed connect or send is logged,
//! the connection is dropped, and the next flush tries again. Rates on the
//! receiving side tolerate the resulting gap like any other missed sweep.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};

use crate::config;
use crate::secret::Secret;
use crate::snapshot::{FleetTable, Payload};
use crate::wire::{body, frame};

struct RelayPeer {
    cluster: &'static str,
    head: &'static str,
    conn: Option<TcpStream>,
}

/// Outbound fan-out to peer server instances.
pub struct Relay {
    port: u16,
    peers: Vec<RelayPeer>,
}

impl Relay {
    /// A relay for this host, if the routing table lists it as a source.
    #[must_use]
    pub fn for_host(host: &str, port: u16) -> Option<Self> {
        let clusters = config::relay_destinations(host)?;
        let peers = clusters
            .iter()
            .filter_map(|cluster| match config::head_node(cluster) {
                Some(head) => Some(RelayPeer {
                    cluster,
                    head,
                    conn: None,
                }),
                None => {
                    log::error!("[relay] no head node known for cluster {}", cluster);
                    None
                }
            })
            .collect::<Vec<_>>();
        log::info!(
            "[relay] forwarding summed data to {:?}",
            peers.iter().map(|p| p.cluster).collect::<Vec<_>>()
        );
        Some(Self { port, peers })
    }

    /// Number of configured destinations.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Frame the fleet table once and push it to every destination.
    pub fn forward(&mut self, fleet: &FleetTable, secret: &Secret) {
        if self.peers.is_empty() {
            return;
        }
        let payload = Payload::Relay(fleet.clone());
        let body = match body::encode(&payload) {
            Ok(body) => body,
            Err(err) => {
                log::error!("[relay] could not encode fleet table: {}", err);
                return;
            }
        };
        let header = frame::encode_header(&body, secret);

        for peer in &mut self.peers {
            if peer.conn.is_none() {
                let addr = match (peer.head, self.port)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                {
                    Some(addr) => addr,
                    None => {
                        log::warn!("[relay] cannot resolve {}", peer.head);
                        continue;
                    }
                };
                match TcpStream::connect_timeout(&addr, config::RELAY_CONNECT_TIMEOUT) {
                    Ok(stream) => {
                        stream.set_nodelay(true).ok();
                        log::info!(
                            "[relay] setting up new relay connection to {}:{}",
                            peer.head,
                            self.port
                        );
                        peer.conn = Some(stream);
                    }
                    Err(err) => {
                        log::warn!("[relay] could not connect to {}: {}", peer.head, err);
                        continue;
                    }
                }
            }
            if let Some(conn) = &mut peer.conn {
                if let Err(err) = conn.write_all(&header).and_then(|()| conn.write_all(&body)) {
                    log::warn!(
                        "[relay] send of {} bytes to {} failed: {}",
                        header.len() + body.len(),
                        peer.head,
                        err
                    );
                    peer.conn = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_only_for_configured_hosts() {
        assert!(Relay::for_host("vu-man4", 8022).is_none());
        let relay = Relay::for_host("alkindi", 8022).expect("alkindi relays");
        assert_eq!(relay.peer_count(), 3);
    }
}
