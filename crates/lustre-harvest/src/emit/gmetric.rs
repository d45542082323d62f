// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ganglia gmetric wire protocol.
//!
//! gmond's 3.1 protocol takes two XDR-encoded UDP packets per datum: a
//! metadata packet describing the metric and a value packet carrying the
//! formatted value. Both carry the reporting hostname, which a sender may
//! spoof as `"ip:host"` so gmond attributes the metric to `host` instead of
//! to the machine that sent the packet - the whole point of this pipeline.
//!
//! # Wire Format
//!
//! ```text
//! metadata (id 128):  host, name, spoofed, type, name, units,
//!                     slope, tmax, dmax, extra-element list
//! value    (id 133):  host, name, spoofed, "%s", value
//! ```
//!
//! XDR here means: `u32` big-endian integers; strings as `u32` length +
//! bytes, zero-padded to a 4-byte boundary.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::PublishProto;

/// Metadata packet id.
const PACKET_METADATA: u32 = 128;
/// String-value packet id (metadata id + 5).
const PACKET_VALUE: u32 = 128 + 5;

/// Multicast hop limit when publishing to a multicast group.
const MULTICAST_TTL: u32 = 20;

/// How a metric trends; gmond uses this for RRD slope hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slope {
    Zero = 0,
    Positive = 1,
    Negative = 2,
    Both = 3,
    Unspecified = 4,
}

/// One datum as handed to the publisher.
///
/// This is the seam the server tests mock: the real implementation speaks
/// UDP to gmond, the test double records what would have been sent.
pub trait MetricSink {
    #[allow(clippy::too_many_arguments)]
    fn send(
        &mut self,
        name: &str,
        value: &str,
        type_name: &str,
        units: &str,
        slope: Slope,
        tmax: u32,
        dmax: u32,
        group: &str,
        spoof: &str,
    ) -> io::Result<()>;
}

/// UDP/multicast gmetric publisher. One socket shared by all metrics.
pub struct Gmetric {
    socket: UdpSocket,
    dest: SocketAddr,
    local_host: String,
}

impl Gmetric {
    /// Open the publishing socket against a gmond endpoint.
    pub fn new(host: &str, port: u16, proto: PublishProto) -> io::Result<Self> {
        let dest = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "gmond host"))?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if proto == PublishProto::Multicast {
            socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        }
        let socket: UdpSocket = socket.into();

        let local_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        log::debug!("[emit] gmetric publisher -> {} ({:?})", dest, proto);
        Ok(Self {
            socket,
            dest,
            local_host,
        })
    }
}

impl MetricSink for Gmetric {
    fn send(
        &mut self,
        name: &str,
        value: &str,
        type_name: &str,
        units: &str,
        slope: Slope,
        tmax: u32,
        dmax: u32,
        group: &str,
        spoof: &str,
    ) -> io::Result<()> {
        let host = if spoof.is_empty() {
            self.local_host.as_str()
        } else {
            spoof
        };
        let meta = build_metadata(host, name, !spoof.is_empty(), type_name, units, slope, tmax, dmax, group);
        let data = build_value(host, name, !spoof.is_empty(), value);
        self.socket.send_to(&meta, self.dest)?;
        self.socket.send_to(&data, self.dest)?;
        Ok(())
    }
}

/// Build the metric metadata packet.
#[allow(clippy::too_many_arguments)]
fn build_metadata(
    host: &str,
    name: &str,
    spoofed: bool,
    type_name: &str,
    units: &str,
    slope: Slope,
    tmax: u32,
    dmax: u32,
    group: &str,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    xdr_u32(&mut buf, PACKET_METADATA);
    xdr_string(&mut buf, host);
    xdr_string(&mut buf, name);
    xdr_u32(&mut buf, u32::from(spoofed));
    xdr_string(&mut buf, type_name);
    xdr_string(&mut buf, name);
    xdr_string(&mut buf, units);
    xdr_u32(&mut buf, slope as u32);
    xdr_u32(&mut buf, tmax);
    xdr_u32(&mut buf, dmax);
    if group.is_empty() {
        xdr_u32(&mut buf, 0);
    } else {
        xdr_u32(&mut buf, 1);
        xdr_string(&mut buf, "GROUP");
        xdr_string(&mut buf, group);
    }
    buf
}

/// Build the string-value packet.
fn build_value(host: &str, name: &str, spoofed: bool, value: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    xdr_u32(&mut buf, PACKET_VALUE);
    xdr_string(&mut buf, host);
    xdr_string(&mut buf, name);
    xdr_u32(&mut buf, u32::from(spoofed));
    xdr_string(&mut buf, "%s");
    xdr_string(&mut buf, value);
    buf
}

fn xdr_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn xdr_string(buf: &mut Vec<u8>, s: &str) {
    xdr_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
    let pad = (4 - s.len() % 4) % 4;
    buf.extend(std::iter::repeat_n(0u8, pad));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xdr_string_padding() {
        for (s, expected_len) in [("", 4), ("a", 8), ("ab", 8), ("abc", 8), ("abcd", 8), ("abcde", 12)] {
            let mut buf = Vec::new();
            xdr_string(&mut buf, s);
            assert_eq!(buf.len(), expected_len, "string {:?}", s);
            assert_eq!(&buf[..4], &(s.len() as u32).to_be_bytes());
            assert_eq!(&buf[4..4 + s.len()], s.as_bytes());
            assert!(buf[4 + s.len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_metadata_packet_layout() {
        let buf = build_metadata(
            "10.1.0.5:cn42",
            "vu_short_read_bytes",
            true,
            "float",
            "bytes/sec",
            Slope::Both,
            60,
            0,
            "",
        );

        assert_eq!(&buf[..4], &128u32.to_be_bytes());
        // Spoofed hostname immediately follows the packet id.
        assert_eq!(&buf[4..8], &13u32.to_be_bytes());
        assert_eq!(&buf[8..21], b"10.1.0.5:cn42");
        // Empty group: the extra-element list is a bare zero at the end.
        assert_eq!(&buf[buf.len() - 4..], &0u32.to_be_bytes());
    }

    #[test]
    fn test_metadata_packet_with_group() {
        let buf = build_metadata(
            "10.1.0.5:cn42",
            "m",
            true,
            "float",
            "ops/sec",
            Slope::Both,
            60,
            0,
            "lustre",
        );
        // count (4) + "GROUP" (12) + "lustre" (12)
        let tail = &buf[buf.len() - 28..];
        assert_eq!(&tail[..4], &1u32.to_be_bytes());
        assert_eq!(&tail[4..8], &5u32.to_be_bytes());
        assert_eq!(&tail[8..13], b"GROUP");
    }

    #[test]
    fn test_value_packet_layout() {
        let buf = build_value("10.1.0.5:cn42", "vu_short_read_bytes", true, "5000000.00");

        assert_eq!(&buf[..4], &133u32.to_be_bytes());
        // Format string "%s" precedes the value.
        let fmt_pos = buf
            .windows(2)
            .position(|w| w == b"%s")
            .expect("format string present");
        let value_field = &buf[fmt_pos + 2 + 2..];
        assert_eq!(&value_field[..4], &10u32.to_be_bytes());
        assert_eq!(&value_field[4..14], b"5000000.00");
    }

    #[test]
    fn test_spoof_flag() {
        let spoofed = build_value("10.1.0.5:cn42", "m", true, "1");
        let plain = build_value("oss07", "m", false, "1");

        // The flag sits after the id and hostname fields.
        let flag_at = |buf: &[u8], host: &str| {
            let host_field = 4 + 4 + host.len() + (4 - host.len() % 4) % 4;
            let name_field = host_field + 4 + 1 + 3;
            u32::from_be_bytes([
                buf[name_field],
                buf[name_field + 1],
                buf[name_field + 2],
                buf[name_field + 3],
            ])
        };
        assert_eq!(flag_at(&spoofed, "10.1.0.5:cn42"), 1);
        assert_eq!(flag_at(&plain, "oss07"), 0);
    }

    #[test]
    fn test_slope_values_match_protocol() {
        assert_eq!(Slope::Zero as u32, 0);
        assert_eq!(Slope::Positive as u32, 1);
        assert_eq!(Slope::Negative as u32, 2);
        assert_eq!(Slope::Both as u32, 3);
        assert_eq!(Slope::Unspecified as u32, 4);
    }
}
