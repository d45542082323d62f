// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Phase-locked Lustre per-client I/O telemetry.
//!
//! Clients on OSS/MDS hosts read per-export Lustre counters at synchronized
//! wall-clock phases and stream them to a server over a framed,
//! digest-checked TCP protocol. The server sums each sweep across the fleet,
//! differences consecutive sweeps into per-second per-client rates, and
//! spoofs the results into ganglia so every rate shows up on the client host
//! that caused the I/O. Server instances serving other network segments
//! receive the already-summed table through the relay.
//!
//! ```text
//!   oss/mds hosts            head node                     gmond
//!  +-----------+   tcp   +-----------------+   udp    +-----------+
//!  | client    | ------> | server          | -------> | spoofed   |
//!  | gather @  |  frames | sum sweep       |  gmetric | per-host  |
//!  | phases    |         | diff -> rates   |  packets | metrics   |
//!  +-----------+         |   |  relay      |          +-----------+
//!                        +---|-------------+
//!                            v tcp (summed)
//!                        peer server instances
//! ```

pub mod client;
pub mod config;
pub mod emit;
pub mod sched;
pub mod secret;
pub mod server;
pub mod snapshot;
pub mod stats;
pub mod wire;

pub use client::{ClientConfig, HarvestClient};
pub use secret::{Secret, SecretError};
pub use server::{HarvestServer, ServerConfig, ServerError};
