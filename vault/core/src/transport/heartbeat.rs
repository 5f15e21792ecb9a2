//! Heartbeat Liveness Tracking
//!
//! While the socket is connected the client sends a `ping` frame every
//! `heartbeat_interval` and expects `pong` frames back. The tracker records
//! when the last pong arrived and derives round-trip statistics from the
//! oldest outstanding ping.
//!
//! A connection that stays silent for more than twice the interval is
//! declared dead; the socket client then force-closes it with
//! [`HEARTBEAT_CLOSE_CODE`] and runs the reconnection path.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Close code used when the client tears down a silent connection
pub const HEARTBEAT_CLOSE_CODE: u16 = 4000;

/// Outstanding pings remembered for RTT measurement
const MAX_PENDING_PINGS: usize = 8;

/// Round-trip statistics for the current connection
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HeartbeatStats {
    /// Last recorded round-trip time
    pub last_rtt: Option<Duration>,
    /// Average round-trip time (exponential moving average)
    pub avg_rtt: Option<Duration>,
    /// Minimum observed RTT
    pub min_rtt: Option<Duration>,
    /// Maximum observed RTT
    pub max_rtt: Option<Duration>,
    /// Total pings sent
    pub pings_sent: u64,
    /// Total pongs received
    pub pongs_received: u64,
}

impl HeartbeatStats {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn update_rtt(&mut self, rtt: Duration) {
        // Exponential moving average (alpha = 0.2)
        const ALPHA: f64 = 0.2;

        self.last_rtt = Some(rtt);
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |min| min.min(rtt)));
        self.max_rtt = Some(self.max_rtt.map_or(rtt, |max| max.max(rtt)));

        let new_avg = match self.avg_rtt {
            Some(avg) => {
                let rtt_nanos = rtt.as_nanos() as f64;
                let avg_nanos = avg.as_nanos() as f64;
                Duration::from_nanos((ALPHA * rtt_nanos + (1.0 - ALPHA) * avg_nanos) as u64)
            }
            None => rtt,
        };
        self.avg_rtt = Some(new_avg);
    }
}

/// Per-connection heartbeat state
#[derive(Debug)]
pub(crate) struct HeartbeatTracker {
    timeout: Duration,
    last_pong: Instant,
    pending: VecDeque<Instant>,
    stats: HeartbeatStats,
}

impl HeartbeatTracker {
    /// Start tracking a freshly opened connection
    ///
    /// The open instant counts as the first sign of life.
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            timeout: interval.saturating_mul(2),
            last_pong: Instant::now(),
            pending: VecDeque::new(),
            stats: HeartbeatStats::default(),
        }
    }

    /// Record that a ping frame went out
    pub(crate) fn record_ping(&mut self) {
        if self.pending.len() == MAX_PENDING_PINGS {
            self.pending.pop_front();
        }
        self.pending.push_back(Instant::now());
        self.stats.pings_sent += 1;
    }

    /// Record a pong frame; returns the measured RTT when a ping was pending
    pub(crate) fn record_pong(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.last_pong = now;
        self.stats.pongs_received += 1;

        let sent = self.pending.pop_front()?;
        let rtt = now.saturating_duration_since(sent);
        self.stats.update_rtt(rtt);
        Some(rtt)
    }

    /// Time since the last pong (or since the connection opened)
    pub(crate) fn silence(&self) -> Duration {
        self.last_pong.elapsed()
    }

    /// Whether the connection has been silent for longer than 2× interval
    pub(crate) fn is_expired(&self) -> bool {
        self.silence() > self.timeout
    }

    pub(crate) fn stats(&self) -> HeartbeatStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_stats() {
        let mut stats = HeartbeatStats::default();

        stats.update_rtt(Duration::from_millis(100));
        assert_eq!(stats.last_rtt, Some(Duration::from_millis(100)));
        assert_eq!(stats.min_rtt, Some(Duration::from_millis(100)));
        assert_eq!(stats.max_rtt, Some(Duration::from_millis(100)));
        assert_eq!(stats.avg_rtt, Some(Duration::from_millis(100)));

        stats.update_rtt(Duration::from_millis(50));
        assert_eq!(stats.min_rtt, Some(Duration::from_millis(50)));
        assert_eq!(stats.max_rtt, Some(Duration::from_millis(100)));
        // 0.8 * 100 + 0.2 * 50
        let avg = stats.avg_rtt.unwrap();
        assert!(avg > Duration::from_millis(89) && avg < Duration::from_millis(91));

        stats.update_rtt(Duration::from_millis(200));
        assert_eq!(stats.last_rtt, Some(Duration::from_millis(200)));
        assert_eq!(stats.max_rtt, Some(Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_after_twice_interval() {
        let tracker = HeartbeatTracker::new(Duration::from_secs(1));
        assert!(!tracker.is_expired());

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert!(!tracker.is_expired());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tracker.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_resets_silence_and_measures_rtt() {
        let mut tracker = HeartbeatTracker::new(Duration::from_secs(1));

        tracker.record_ping();
        tokio::time::advance(Duration::from_millis(40)).await;
        let rtt = tracker.record_pong();

        assert_eq!(rtt, Some(Duration::from_millis(40)));
        assert_eq!(tracker.silence(), Duration::ZERO);

        let stats = tracker.stats();
        assert_eq!(stats.pings_sent, 1);
        assert_eq!(stats.pongs_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_pong_counts_as_life() {
        let mut tracker = HeartbeatTracker::new(Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert_eq!(tracker.record_pong(), None);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!tracker.is_expired());
    }
}
