// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Phase scheduler.
//!
//! Client sends are synchronized to wall-clock phases so the server can tell
//! when a fleet-wide sweep is complete. With `K` gathers per minute the
//! minute divides into `K` intervals of `60/K` seconds; a caller sleeps to
//! the next interval boundary and learns which interval it was in before the
//! sleep. Consecutive calls should yield indices that increase by 1 modulo
//! `K` - a gap means the caller's work overran its phase, which callers log
//! but never compensate for.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Interval length in seconds for a given gather rate.
#[must_use]
pub fn period_secs(gathers_per_minute: u32) -> f64 {
    60.0 / f64::from(gathers_per_minute)
}

/// Sleep until the next interval boundary.
///
/// `offset_secs` skews the phase grid; relaying servers run a few seconds
/// ahead of the clusters they feed so summed data arrives in the same sweep.
/// Returns the interval index occupied before the sleep and the position in
/// the minute at call time.
pub fn sync_to_next_interval(gathers_per_minute: u32, offset_secs: f64) -> (u32, f64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let position = (now % 60.0 + 60.0 + offset_secs) % 60.0;

    let (interval, sleep) = next_boundary(position, period_secs(gathers_per_minute));
    thread::sleep(Duration::from_secs_f64(sleep));
    (interval, position)
}

/// Boundary arithmetic: which interval `position` falls in, and how long
/// until the next boundary.
fn next_boundary(position: f64, period: f64) -> (u32, f64) {
    let interval = (position / period) as u32;
    let sleep = f64::from(interval + 1) * period - position;
    (interval, sleep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period() {
        assert_eq!(period_secs(3), 20.0);
        assert_eq!(period_secs(1), 60.0);
        assert_eq!(period_secs(6), 10.0);
    }

    #[test]
    fn test_boundary_at_interval_start() {
        let (interval, sleep) = next_boundary(0.0, 20.0);
        assert_eq!(interval, 0);
        assert_eq!(sleep, 20.0);
    }

    #[test]
    fn test_boundary_mid_interval() {
        let (interval, sleep) = next_boundary(25.0, 20.0);
        assert_eq!(interval, 1);
        assert_eq!(sleep, 15.0);
    }

    #[test]
    fn test_boundary_just_before_minute_wrap() {
        let (interval, sleep) = next_boundary(59.9, 20.0);
        assert_eq!(interval, 2);
        assert!((sleep - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_indices_cover_the_minute() {
        for tenth in 0..600 {
            let position = f64::from(tenth) / 10.0;
            let (interval, sleep) = next_boundary(position, 20.0);
            assert!(interval < 3);
            assert!(sleep > 0.0 && sleep <= 20.0);
            // Sleeping lands exactly on the next boundary.
            let landed = position + sleep;
            assert!((landed / 20.0 - (landed / 20.0).round()).abs() < 1e-9);
        }
    }
}
