//! Concentrator timestamps.
//!
//! `tmst` is a free-running 32-bit microsecond counter on the gateway. It has
//! no epoch and wraps roughly every 71.6 minutes, so every comparison is done
//! on the wrapped difference.

use std::time::Duration;

use tokio::time::Instant;

/// Forward distance from `from` to `to`, assuming `to` is not earlier than `from`
pub fn forward_delta(from: u32, to: u32) -> Duration {
    Duration::from_micros(u64::from(to.wrapping_sub(from)))
}

/// Signed distance from `from` to `to` in microseconds.
///
/// Positive when `to` lies ahead of `from` by less than half the counter range.
pub fn signed_delta(from: u32, to: u32) -> i64 {
    i64::from(to.wrapping_sub(from) as i32)
}

/// Maps server time onto a gateway's concentrator counter.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    anchor: Option<(u32, Instant)>,
}

impl ClockSync {
    /// Anchor on a concentrator timestamp observed at `at`
    pub fn sync(&mut self, tmst: u32, at: Instant) {
        self.anchor = Some((tmst, at));
    }

    /// Concentrator timestamp of the latest anchor
    pub fn anchor_tmst(&self) -> Option<u32> {
        self.anchor.map(|(tmst, _)| tmst)
    }

    /// Estimated concentrator counter at `now`
    pub fn concentrator_time(&self, now: Instant) -> Option<u32> {
        let (tmst, at) = self.anchor?;
        let elapsed = now.saturating_duration_since(at).as_micros();
        // Truncation is the wrap
        Some(tmst.wrapping_add(elapsed as u32))
    }

    /// Microseconds from `now` until the counter reaches `target`; negative if already past
    pub fn until(&self, target: u32, now: Instant) -> Option<i64> {
        self.concentrator_time(now)
            .map(|current| signed_delta(current, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_delta_across_wrap() {
        assert_eq!(
            forward_delta(0xFFFF_FFF0, 0x0000_0010),
            Duration::from_micros(32)
        );
        assert_eq!(forward_delta(100, 250), Duration::from_micros(150));
        assert_eq!(forward_delta(7, 7), Duration::ZERO);
    }

    #[test]
    fn test_signed_delta() {
        assert_eq!(signed_delta(0xFFFF_FFF0, 0x0000_0010), 32);
        assert_eq!(signed_delta(0x0000_0010, 0xFFFF_FFF0), -32);
        assert_eq!(signed_delta(1_000, 500), -500);
    }

    #[test]
    fn test_clock_sync_estimate() {
        let mut clock = ClockSync::default();
        let t0 = Instant::now();
        assert_eq!(clock.anchor_tmst(), None);
        assert_eq!(clock.concentrator_time(t0), None);

        clock.sync(0xFFFF_FF00, t0);
        assert_eq!(clock.anchor_tmst(), Some(0xFFFF_FF00));
        let later = t0 + Duration::from_micros(0x200);
        assert_eq!(clock.concentrator_time(later), Some(0x100));

        // A downlink 1s after the wrap is still ahead
        assert_eq!(clock.until(0x100 + 1_000_000, later), Some(1_000_000));
        // and one scheduled before the anchor is behind
        assert_eq!(clock.until(0xFFFF_FE00, later), Some(-0x300));
    }
}
