// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server aggregation engine.
//!
//! One single-threaded poll loop serves everything: the listening socket,
//! every peer connection, and the flush work that sums, differences, and
//! publishes. There is deliberately no concurrency - the fleet tables and
//! the peer map have exactly one owner and every flush runs to completion
//! between polls.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        poll (1s timeout)                      |
//! |   readable listener -> accept peers                           |
//! |   readable peer     -> reassemble frames  -> stamp t_last     |
//! |   timeout tick      -> quiesced?          -> flush:           |
//! |                         sum -> relay -> merge -> rates -> emit|
//! +--------------------------------------------------------------+
//! ```
//!
//! A flush fires once the fleet has been quiet for `min(5s, period/2)`
//! after the last arrival: a heuristic that the sweep is over, not a
//! barrier. Fleet membership changes (a peer joining or leaving, a
//! filesystem appearing) make the next cycle a baseline cycle, because
//! differencing counters across different fleets fabricates rates.

pub mod aggregate;
pub mod peer;
pub mod relay;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config;
use crate::emit::Emitter;
use crate::secret::Secret;
use crate::sched;
use crate::snapshot::{FleetTable, Payload};
use aggregate::DirectReport;
use peer::Peer;
use relay::Relay;

/// Token for the listening socket.
const LISTENER: Token = Token(0);

/// First token handed to an accepted connection.
const PEER_TOKEN_START: usize = 1;

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 128;

/// Server runtime parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostname or interface name the listener binds to; also the key into
    /// the relay routing table.
    pub bind_host: String,
    pub port: u16,
    pub gathers_per_minute: u32,
    pub dryrun: bool,
}

/// Startup errors. Once [`run`](HarvestServer::run) is entered, the engine
/// logs and carries on instead of failing.
#[derive(Debug)]
pub enum ServerError {
    /// The bind host did not resolve to an address.
    Resolve(String),
    /// Could not bind or register the listener.
    Bind { addr: SocketAddr, source: io::Error },
    /// Poll or publisher setup failed.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve(host) => write!(f, "cannot resolve {}", host),
            Self::Bind { addr, source } => write!(f, "cannot listen on {}: {}", addr, source),
            Self::Io(err) => write!(f, "server setup failed: {}", err),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } | Self::Io(source) => Some(source),
            Self::Resolve(_) => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// The aggregation engine and all state it owns.
pub struct HarvestServer {
    config: ServerConfig,
    secret: Secret,
    poll: Poll,
    listener: TcpListener,
    peers: HashMap<Token, Peer>,
    next_token: usize,
    emitter: Emitter,
    relay: Option<Relay>,

    /// Post-sum counters of the most recent flush.
    fleet: FleetTable,
    /// Arrival time of the newest complete message.
    t_last: Option<Instant>,
    /// `t_last` of the previous flush; rate denominators come from here.
    t_prev: Option<Instant>,
    /// A message arrived since the last flush.
    pending: bool,
    /// Fleet membership changed; the next cycle only records a baseline.
    fleet_changed: bool,
}

impl HarvestServer {
    /// Bind the listener and set up the publisher.
    pub fn bind(config: ServerConfig, secret: Secret) -> Result<Self, ServerError> {
        let addr = (config.bind_host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|_| ServerError::Resolve(config.bind_host.clone()))?
            .next()
            .ok_or_else(|| ServerError::Resolve(config.bind_host.clone()))?;

        let poll = Poll::new()?;
        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        log::info!("[server] starting up on {}", addr);

        let emitter = Emitter::to_gmond(config.dryrun)?;
        let relay = Relay::for_host(&config.bind_host, config.port);

        Ok(Self {
            config,
            secret,
            poll,
            listener,
            peers: HashMap::new(),
            next_token: PEER_TOKEN_START,
            emitter,
            relay,
            fleet: FleetTable::default(),
            t_last: None,
            t_prev: None,
            pending: false,
            fleet_changed: true,
        })
    }

    /// The event loop. Self-healing: nothing short of a kill ends it.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(config::POLL_TIMEOUT)) {
                if err.kind() != io::ErrorKind::Interrupted {
                    log::error!("[server] poll error: {}", err);
                }
                continue;
            }

            if events.is_empty() {
                self.tick(Instant::now());
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.handle_accept(),
                    token => self.handle_readable(token),
                }
            }
        }
    }

    /// Drain pending connections off the listener.
    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::error!("[server] cannot register {}: {}", addr, err);
                        continue;
                    }
                    log::info!("[server] new connection from {}", addr);
                    self.peers.insert(token, Peer::new(stream, addr));
                    // A new peer skews the next differencing pass.
                    self.fleet_changed = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("[server] accept error: {}", err);
                    break;
                }
            }
        }
    }

    /// Drain one peer's socket, feeding the reassembler chunk by chunk.
    fn handle_readable(&mut self, token: Token) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        let mut chunk = vec![0u8; config::RECV_CHUNK];
        let mut closed = false;
        loop {
            match peer.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    if peer.feed_chunk(&chunk[..n], &self.secret) {
                        let now = Instant::now();
                        peer.received_at = Some(now);
                        self.t_last = Some(now);
                        self.pending = true;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("[server] read error from {}: {}", peer.addr, err);
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            self.close_peer(token);
        }
    }

    fn close_peer(&mut self, token: Token) {
        if let Some(mut peer) = self.peers.remove(&token) {
            log::info!("[server] closing {} after reading no data", peer.addr);
            if let Err(err) = self.poll.registry().deregister(&mut peer.stream) {
                log::debug!("[server] deregister of {} failed: {}", peer.addr, err);
            }
            // A departed peer skews the next differencing pass too.
            self.fleet_changed = true;
        }
    }

    /// Timeout tick: flush once the fleet has quiesced after the sweep.
    fn tick(&mut self, now: Instant) {
        if !self.pending {
            return;
        }
        let Some(t_last) = self.t_last else { return };
        let period = sched::period_secs(self.config.gathers_per_minute);
        let quiesce = (period / 2.0).min(config::FLUSH_QUIESCENCE_CAP);
        if now.duration_since(t_last).as_secs_f64() < quiesce {
            return;
        }
        self.flush(now, t_last);
    }

    /// One aggregation cycle: sum, relay, merge, difference, publish.
    fn flush(&mut self, now: Instant, t_last: Instant) {
        let period = sched::period_secs(self.config.gathers_per_minute);
        let prev = std::mem::take(&mut self.fleet);

        let mut fleet = {
            let reports: Vec<DirectReport<'_>> = self
                .peers
                .values()
                .filter_map(|peer| match (&peer.payload, peer.received_at) {
                    (Some(Payload::Direct(data)), Some(at)) => Some(DirectReport {
                        source: peer.addr.to_string(),
                        data,
                        age_secs: now.duration_since(at).as_secs_f64(),
                    }),
                    _ => None,
                })
                .collect();
            aggregate::sum_fleet(&reports, period)
        };

        // Relay carries the locally-summed table, before any remote merge:
        // relayed data must never bounce between sites.
        if let Some(relay) = &mut self.relay {
            relay.forward(&fleet, &self.secret);
        }

        for peer in self.peers.values() {
            if let Some(Payload::Relay(remote)) = &peer.payload {
                aggregate::merge_remote(&mut fleet, remote, &peer.addr.to_string());
            }
        }

        // Processed: a peer that now goes silent must not republish this.
        for peer in self.peers.values_mut() {
            peer.payload = None;
        }

        let delta_secs = self
            .t_prev
            .map_or(0.0, |t_prev| t_last.duration_since(t_prev).as_secs_f64());
        let rebaseline = self.fleet_changed || self.t_prev.is_none();
        let (rates, rebaseline_next) =
            aggregate::evaluate_cycle(&prev, &fleet, delta_secs, rebaseline);
        if let Some(rates) = rates {
            self.emitter.publish(&rates);
        }

        self.fleet = fleet;
        self.t_prev = Some(t_last);
        self.fleet_changed = rebaseline_next;
        self.pending = false;
    }
}
