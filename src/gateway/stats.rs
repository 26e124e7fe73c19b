//! Round-trip statistics over a bounded window of recent samples.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Summary of the current sample window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTripSummary {
    pub min: Duration,
    pub max: Duration,
    pub median: Duration,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct RoundTripStats {
    samples: VecDeque<Duration>,
    window: usize,
    max_sample: Duration,
}

impl RoundTripStats {
    /// Keep the latest `window` samples; drop samples above `max_sample`
    pub fn new(window: usize, max_sample: Duration) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            max_sample,
        }
    }

    /// Record a sample. Returns false if it was discarded as implausible.
    pub fn record(&mut self, rtt: Duration) -> bool {
        if rtt > self.max_sample {
            return false;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        true
    }

    /// Record the time between sending a request and receiving its ack.
    /// A receive instant before the send instant (clock jump) is discarded.
    pub fn record_between(&mut self, sent: Instant, received: Instant) -> bool {
        match received.checked_duration_since(sent) {
            Some(rtt) => self.record(rtt),
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    /// Exact median; the mean of the two middle samples for an even count
    pub fn median(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2)
        } else {
            Some(sorted[mid])
        }
    }

    pub fn summary(&self) -> Option<RoundTripSummary> {
        Some(RoundTripSummary {
            min: self.min()?,
            max: self.max()?,
            median: self.median()?,
            count: self.count(),
        })
    }
}
