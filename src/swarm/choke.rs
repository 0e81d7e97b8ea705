//! The choke scheduler: fixed-interval tit-for-tat ranking plus periodic
//! optimistic unchoke.

use rand::seq::SliceRandom;

use crate::peer::PeerKey;

/// A snapshot of one unchoke candidate, computed by the caller (the swarm
/// coordinator) from its per-peer locked state before calling `tick`, so
/// the scheduler itself never needs to touch peer locks directly.
pub(crate) struct Candidate {
    pub key: PeerKey,
    /// Download rate while still downloading, upload rate once fully
    /// seeded.
    pub rate: f64,
}

pub(crate) struct ChokeDecision {
    pub unchoke: Vec<PeerKey>,
    pub choke: Vec<PeerKey>,
}

pub(crate) struct ChokeScheduler {
    optimistic_countdown: usize,
    optimistic_iterations: usize,
    max_downloaders_unchoke: usize,
}

impl ChokeScheduler {
    pub(crate) fn new(
        optimistic_iterations: usize,
        max_downloaders_unchoke: usize,
    ) -> Self {
        Self {
            optimistic_countdown: optimistic_iterations,
            optimistic_iterations,
            max_downloaders_unchoke,
        }
    }

    /// Runs one choke-scheduler tick.
    ///
    /// `candidates` is the full set of connected, `peer_interested` peers,
    /// regardless of their *current* `am_choking` state: this tick
    /// recomputes the whole unchoke slate from scratch rather than only
    /// promoting out of the previously-choked pool, which is the only way
    /// to keep the "≤ max_downloaders_unchoke interested peers unchoked,
    /// plus at most one optimistic holdover" invariant true of the *global*
    /// state after every tick rather than just of this tick's deltas. The
    /// caller applies `unchoke`/`choke` by diffing against each peer's
    /// current `am_choking` flag and only sending a message where it
    /// actually flips.
    pub(crate) fn tick(&mut self, mut candidates: Vec<Candidate>) -> ChokeDecision {
        // Step 1: advance the optimistic countdown.
        let is_optimistic_tick = self.optimistic_countdown == 0;
        self.optimistic_countdown = if is_optimistic_tick {
            self.optimistic_iterations
        } else {
            self.optimistic_countdown - 1
        };

        // Step 3: sort descending by rate.
        candidates.sort_by(|a, b| {
            b.rate
                .partial_cmp(&a.rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Step 4: unchoke the top N.
        let split = candidates.len().min(self.max_downloaders_unchoke);
        let (downloaders, rest) = candidates.split_at(split);
        let mut unchoke: Vec<PeerKey> =
            downloaders.iter().map(|c| c.key).collect();
        let mut choke: Vec<PeerKey> = rest.iter().map(|c| c.key).collect();

        // Step 6: optimistic holdover.
        if is_optimistic_tick && !choke.is_empty() {
            let idx = (0..choke.len())
                .collect::<Vec<_>>()
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(0);
            let held_over = choke.remove(idx);
            unchoke.push(held_over);
        }

        ChokeDecision { unchoke, choke }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(rates: &[(u64, f64)]) -> Vec<Candidate> {
        rates
            .iter()
            .map(|&(id, rate)| Candidate {
                key: PeerKey(id),
                rate,
            })
            .collect()
    }

    #[test]
    fn non_optimistic_tick_chokes_below_the_cutoff() {
        let mut scheduler = ChokeScheduler::new(3, 4);
        // force a non-optimistic tick
        scheduler.optimistic_countdown = 1;
        let decision = scheduler.tick(candidates(&[
            (0, 100.0),
            (1, 80.0),
            (2, 60.0),
            (3, 40.0),
            (4, 20.0),
        ]));
        assert_eq!(decision.unchoke.len(), 4);
        assert_eq!(decision.choke, vec![PeerKey(4)]);
    }

    #[test]
    fn optimistic_tick_preserves_exactly_one_holdover() {
        let mut scheduler = ChokeScheduler::new(3, 4);
        scheduler.optimistic_countdown = 0;
        let decision = scheduler.tick(candidates(&[
            (0, 100.0),
            (1, 80.0),
            (2, 60.0),
            (3, 40.0),
            (4, 20.0),
        ]));
        assert_eq!(decision.unchoke.len(), 5);
        assert!(decision.choke.is_empty());
        assert!(decision.unchoke.contains(&PeerKey(4)));
    }

    #[test]
    fn countdown_cycles_every_n_ticks() {
        let mut scheduler = ChokeScheduler::new(3, 4);
        assert_eq!(scheduler.optimistic_countdown, 3);
        scheduler.tick(Vec::new());
        assert_eq!(scheduler.optimistic_countdown, 2);
        scheduler.tick(Vec::new());
        assert_eq!(scheduler.optimistic_countdown, 1);
        scheduler.tick(Vec::new());
        assert_eq!(scheduler.optimistic_countdown, 0);
        scheduler.tick(Vec::new());
        assert_eq!(scheduler.optimistic_countdown, 3);
    }

    #[test]
    fn fewer_candidates_than_slots_unchokes_all() {
        let mut scheduler = ChokeScheduler::new(3, 4);
        scheduler.optimistic_countdown = 1;
        let decision = scheduler.tick(candidates(&[(0, 10.0), (1, 5.0)]));
        assert_eq!(decision.unchoke.len(), 2);
        assert!(decision.choke.is_empty());
    }
}
