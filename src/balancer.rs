//! Worker selection strategies for the reverse proxy

use crate::config::Strategy;
use crate::worker::WorkerHandle;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Picks a worker from a roster snapshot according to the configured strategy
#[derive(Debug)]
pub struct WorkerSelector {
    strategy: Strategy,
    /// Current index for round-robin
    cursor: AtomicUsize,
}

impl WorkerSelector {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select a worker, or None when the roster is empty
    pub fn select(&self, workers: &[Arc<WorkerHandle>]) -> Option<Arc<WorkerHandle>> {
        if workers.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
                &workers[idx]
            }
            Strategy::LeastConnections => {
                // min_by_key keeps the first of equal minima, which is the
                // tie-break the roster order promises
                workers
                    .iter()
                    .min_by_key(|w| w.active_connections())
                    .expect("roster checked non-empty")
            }
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..workers.len());
                &workers[idx]
            }
        };

        debug!(
            id = selected.id(),
            port = selected.port(),
            strategy = ?self.strategy,
            "Selected worker"
        );
        Some(Arc::clone(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ConnectionGuard;

    fn roster(n: usize) -> Vec<Arc<WorkerHandle>> {
        (0..n)
            .map(|id| Arc::new(WorkerHandle::new(id, 8080 + id as u16)))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let workers = roster(3);
        let selector = WorkerSelector::new(Strategy::RoundRobin);

        let ports: Vec<u16> = (0..6)
            .map(|_| selector.select(&workers).unwrap().port())
            .collect();
        assert_eq!(ports, vec![8080, 8081, 8082, 8080, 8081, 8082]);
    }

    #[test]
    fn test_round_robin_picks_each_worker_equally() {
        let workers = roster(4);
        let selector = WorkerSelector::new(Strategy::RoundRobin);

        let mut counts = [0usize; 4];
        for _ in 0..20 {
            let w = selector.select(&workers).unwrap();
            counts[w.id()] += 1;
        }
        assert_eq!(counts, [5, 5, 5, 5]);
    }

    #[test]
    fn test_least_connections_picks_minimum() {
        let workers = roster(3);
        let selector = WorkerSelector::new(Strategy::LeastConnections);

        let _g0 = ConnectionGuard::new(Arc::clone(&workers[0]));
        let _g1 = ConnectionGuard::new(Arc::clone(&workers[1]));

        assert_eq!(selector.select(&workers).unwrap().id(), 2);
    }

    #[test]
    fn test_least_connections_ties_break_on_first() {
        let workers = roster(3);
        let selector = WorkerSelector::new(Strategy::LeastConnections);

        // All counters equal: the first worker in roster order wins
        assert_eq!(selector.select(&workers).unwrap().id(), 0);

        let _g0 = ConnectionGuard::new(Arc::clone(&workers[0]));
        // Workers 1 and 2 now tie at zero
        assert_eq!(selector.select(&workers).unwrap().id(), 1);
    }

    #[test]
    fn test_least_connections_sees_released_guards() {
        let workers = roster(2);
        let selector = WorkerSelector::new(Strategy::LeastConnections);

        let g0 = ConnectionGuard::new(Arc::clone(&workers[0]));
        assert_eq!(selector.select(&workers).unwrap().id(), 1);

        drop(g0);
        // Counters back to a tie, first occurrence wins again
        assert_eq!(selector.select(&workers).unwrap().id(), 0);
    }

    #[test]
    fn test_random_stays_within_roster() {
        let workers = roster(3);
        let selector = WorkerSelector::new(Strategy::Random);

        for _ in 0..50 {
            let w = selector.select(&workers).unwrap();
            assert!(w.id() < 3);
        }
    }

    #[test]
    fn test_single_worker_all_strategies_agree() {
        let workers = roster(1);
        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastConnections,
            Strategy::Random,
        ] {
            let selector = WorkerSelector::new(strategy);
            for _ in 0..5 {
                assert_eq!(selector.select(&workers).unwrap().id(), 0);
            }
        }
    }

    #[test]
    fn test_empty_roster_selects_nothing() {
        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastConnections,
            Strategy::Random,
        ] {
            let selector = WorkerSelector::new(strategy);
            assert!(selector.select(&[]).is_none());
        }
    }
}
