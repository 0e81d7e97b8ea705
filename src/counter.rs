//! Exponentially smoothed throughput counters, used by the choke scheduler
//! to rank peers by download/upload rate, smoothed over `Conf`'s
//! `rate_computation_iterations` tunable.

use std::time::Instant;

/// A moving-average byte counter, sampled once per choke-scheduler tick.
///
/// Each call to [`Counter::tick`] folds the bytes transferred since the last
/// tick into a smoothed rate using a simple exponential moving average with
/// smoothing factor `2 / (iterations + 1)`, the same scheme used by the
/// choke scheduler's rate-sorted tit-for-tat ranking.
#[derive(Clone, Debug)]
pub(crate) struct ThroughputCounter {
    /// Total bytes transferred since this counter was created.
    total: u64,
    /// Bytes transferred since the last `tick`.
    round: u64,
    /// Smoothed bytes/sec.
    rate: f64,
    /// Smoothing factor derived from the configured window.
    alpha: f64,
    last_tick: Instant,
}

impl ThroughputCounter {
    pub(crate) fn new(smoothing_iterations: usize) -> Self {
        let n = smoothing_iterations.max(1) as f64;
        Self {
            total: 0,
            round: 0,
            rate: 0.0,
            alpha: 2.0 / (n + 1.0),
            last_tick: Instant::now(),
        }
    }

    /// Records `len` bytes transferred in the current round.
    pub(crate) fn update(&mut self, len: u32) {
        self.total += u64::from(len);
        self.round += u64::from(len);
    }

    /// Folds the current round into the smoothed rate and returns it,
    /// resetting the round counter. Should be called once per choke tick.
    pub(crate) fn tick(&mut self) -> f64 {
        let elapsed = self.last_tick.elapsed().as_secs_f64().max(1e-3);
        let instant_rate = self.round as f64 / elapsed;
        self.rate = self.alpha * instant_rate + (1.0 - self.alpha) * self.rate;
        self.round = 0;
        self.last_tick = Instant::now();
        self.rate
    }

    /// The last computed smoothed rate, in bytes/sec, without advancing the
    /// round.
    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread::sleep, time::Duration};

    #[test]
    fn rate_increases_with_throughput() {
        let mut counter = ThroughputCounter::new(2);
        counter.update(16 * 1024);
        sleep(Duration::from_millis(5));
        let rate = counter.tick();
        assert!(rate > 0.0);
    }

    #[test]
    fn idle_round_decays_rate() {
        let mut counter = ThroughputCounter::new(2);
        counter.update(16 * 1024);
        sleep(Duration::from_millis(5));
        let first = counter.tick();
        sleep(Duration::from_millis(5));
        let second = counter.tick();
        assert!(second < first);
    }
}
