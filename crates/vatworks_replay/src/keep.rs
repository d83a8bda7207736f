//! Replica retirement.
//!
//! Every snapshot load adds a replica, so the set would grow without bound.
//! Before a load, replicas that no rule protects are closed.

use crate::config::ReplayConfig;
use vatworks_core::DeliveryNum;

/// What the keep policy needs to know about a live replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepCandidate {
    /// Explicitly protected (explicit load or divergent hash)
    pub keep: bool,
    /// First delivery the replica handled, `None` if it has not run yet
    pub first_delivery: Option<DeliveryNum>,
}

/// Decides which replicas to retire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepPolicy {
    initial: usize,
    recent: usize,
    interval: u64,
    snapshot_interval: u64,
    transaction_nums: Vec<DeliveryNum>,
}

impl KeepPolicy {
    /// Build from replay options
    #[must_use]
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            initial: config.keep_worker_initial,
            recent: config.keep_worker_recent,
            interval: config.keep_worker_interval,
            snapshot_interval: config.forced_snapshot_interval,
            transaction_nums: config.keep_worker_transaction_nums.clone(),
        }
    }

    /// Indices of `replicas` to retire, oldest first
    ///
    /// `start` is the first delivery replayed in this run.
    #[must_use]
    pub fn retire(&self, replicas: &[KeepCandidate], start: DeliveryNum) -> Vec<usize> {
        let len = replicas.len();
        replicas
            .iter()
            .enumerate()
            .filter(|(idx, candidate)| {
                let Some(first) = candidate.first_delivery else {
                    return false;
                };
                !(candidate.keep
                    || self.on_interval(first, start)
                    || *idx < self.initial
                    || *idx + self.recent >= len
                    || self.transaction_nums.contains(&first))
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    fn on_interval(&self, first: DeliveryNum, start: DeliveryNum) -> bool {
        if self.interval == 0 || self.snapshot_interval == 0 {
            return false;
        }
        let intervals = first.saturating_sub(start) / self.snapshot_interval;
        intervals % self.interval == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: usize, recent: usize, interval: u64) -> KeepPolicy {
        KeepPolicy {
            initial,
            recent,
            interval,
            snapshot_interval: 10,
            transaction_nums: Vec::new(),
        }
    }

    fn ran(first: DeliveryNum) -> KeepCandidate {
        KeepCandidate {
            keep: false,
            first_delivery: Some(first),
        }
    }

    #[test]
    fn test_keeps_recent_window() {
        let replicas: Vec<_> = (0..5).map(|i| ran(3 + i * 10)).collect();
        assert_eq!(policy(0, 2, 0).retire(&replicas, 0), vec![0, 1, 2]);
    }

    #[test]
    fn test_keeps_initial() {
        let replicas: Vec<_> = (0..5).map(|i| ran(3 + i * 10)).collect();
        assert_eq!(policy(2, 1, 0).retire(&replicas, 0), vec![2, 3]);
    }

    #[test]
    fn test_keeps_interval_multiples() {
        // (first - start) / 10 gives 0, 1, 2, 3, 4; every second is kept
        let replicas: Vec<_> = (0..5).map(|i| ran(3 + i * 10)).collect();
        assert_eq!(policy(0, 0, 2).retire(&replicas, 3), vec![1, 3]);
    }

    #[test]
    fn test_flags_and_unstarted_are_kept() {
        let replicas = vec![
            KeepCandidate {
                keep: true,
                first_delivery: Some(1),
            },
            KeepCandidate {
                keep: false,
                first_delivery: None,
            },
            ran(15),
            ran(25),
        ];
        let mut p = policy(0, 0, 0);
        p.transaction_nums = vec![25];
        assert_eq!(p.retire(&replicas, 0), vec![2]);
    }

    proptest::proptest! {
        #[test]
        fn prop_recent_never_retired(len in 0usize..20, recent in 0usize..8) {
            let replicas: Vec<_> = (0..len as u64).map(|i| ran(i * 7)).collect();
            let retired = policy(0, recent, 0).retire(&replicas, 0);
            proptest::prop_assert_eq!(retired.len(), len.saturating_sub(recent));
            for idx in retired {
                proptest::prop_assert!(idx + recent < len);
            }
        }
    }
}
