//! # Round-Trip Estimation
//!
//! Smoothed RTT with deviation tracking (RFC 6298 gains). Samples come from
//! acknowledgements of messages that were sent exactly once.

use std::time::Duration;

/// RTT statistics of one connection.
#[derive(Debug, Clone)]
pub struct RttTracker {
    /// Smoothed RTT (SRTT) in µs.
    srtt_us: f64,
    /// RTT variation (RTTVAR) in µs.
    rttvar_us: f64,
    /// Lowest sample seen.
    min_rtt_us: f64,
    /// Highest RTTVAR seen.
    max_rttvar_us: f64,
    sample_count: u64,
}

impl RttTracker {
    /// Tracker seeded with `initial` so resend timing is sane before the
    /// first sample lands.
    pub fn new(initial: Duration) -> Self {
        let initial_us = initial.as_micros() as f64;
        RttTracker {
            srtt_us: initial_us,
            rttvar_us: initial_us / 2.0,
            min_rtt_us: f64::MAX,
            max_rttvar_us: 0.0,
            sample_count: 0,
        }
    }

    /// Feed one round-trip sample.
    pub fn update(&mut self, sample: Duration) {
        let rtt_us = sample.as_micros() as f64;
        self.sample_count += 1;

        if rtt_us < self.min_rtt_us {
            self.min_rtt_us = rtt_us;
        }

        if self.sample_count == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_us = 0.75 * self.rttvar_us + 0.25 * (self.srtt_us - rtt_us).abs();
            self.srtt_us += (rtt_us - self.srtt_us) * 0.125;
        }

        if self.rttvar_us > self.max_rttvar_us {
            self.max_rttvar_us = self.rttvar_us;
        }
    }

    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt_us as u64)
    }

    pub fn rttvar(&self) -> Duration {
        Duration::from_micros(self.rttvar_us as u64)
    }

    /// Lowest sample seen, `None` before the first one.
    pub fn min_rtt(&self) -> Option<Duration> {
        (self.sample_count > 0).then(|| Duration::from_micros(self.min_rtt_us as u64))
    }

    pub fn max_rttvar(&self) -> Duration {
        Duration::from_micros(self.max_rttvar_us as u64)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Time an unacknowledged message waits before it is sent again:
    /// `max(srtt * multiplier, min_delay)`.
    pub fn resend_delay(&self, multiplier: f64, min_delay: Duration) -> Duration {
        let scaled = Duration::from_micros((self.srtt_us * multiplier.max(0.0)) as u64);
        scaled.max(min_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_replaces_seed() {
        let mut rtt = RttTracker::new(Duration::from_millis(100));
        assert_eq!(rtt.srtt(), Duration::from_millis(100));
        assert!(rtt.min_rtt().is_none());

        rtt.update(Duration::from_millis(20));
        assert_eq!(rtt.srtt(), Duration::from_millis(20));
        assert_eq!(rtt.rttvar(), Duration::from_millis(10));
        assert_eq!(rtt.min_rtt(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn smoothing_moves_an_eighth() {
        let mut rtt = RttTracker::new(Duration::ZERO);
        rtt.update(Duration::from_millis(80));
        rtt.update(Duration::from_millis(160));
        assert_eq!(rtt.srtt(), Duration::from_millis(90));
        // 0.75 * 40 + 0.25 * 80
        assert_eq!(rtt.rttvar(), Duration::from_millis(50));
        assert_eq!(rtt.max_rttvar(), Duration::from_millis(50));
        assert_eq!(rtt.min_rtt(), Some(Duration::from_millis(80)));
    }

    #[test]
    fn resend_delay_has_floor() {
        let mut rtt = RttTracker::new(Duration::ZERO);
        rtt.update(Duration::from_millis(10));
        assert_eq!(
            rtt.resend_delay(1.5, Duration::from_millis(50)),
            Duration::from_millis(50)
        );
        assert_eq!(
            rtt.resend_delay(10.0, Duration::from_millis(50)),
            Duration::from_millis(100)
        );
    }
}
