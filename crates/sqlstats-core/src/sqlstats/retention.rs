//! Row-count retention policy.

use crate::settings::StatsSettings;

/// Count-based retention for the persisted statistics tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Rows each table may hold after compaction.
    pub ceiling: u64,
    /// Rows removed per DELETE statement.
    pub batch_size: u64,
}

impl RetentionPolicy {
    #[must_use]
    pub const fn new(ceiling: u64, batch_size: u64) -> Self {
        Self {
            ceiling,
            batch_size: if batch_size == 0 { 1 } else { batch_size },
        }
    }

    #[must_use]
    pub const fn from_settings(settings: &StatsSettings) -> Self {
        Self::new(settings.persisted_rows_max, settings.rows_to_delete_per_txn)
    }

    /// Rows to delete from a table currently holding `current` rows.
    #[must_use]
    pub const fn deletion_target(&self, current: u64) -> u64 {
        current.saturating_sub(self.ceiling)
    }

    /// Size of each DELETE needed to remove `target` rows.
    pub fn batches(&self, target: u64) -> impl Iterator<Item = u64> {
        let batch = self.batch_size;
        let full = target / batch;
        let rest = target % batch;
        std::iter::repeat_n(batch, usize::try_from(full).unwrap_or(usize::MAX))
            .chain((rest > 0).then_some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn target_is_excess_over_ceiling() {
        let policy = RetentionPolicy::new(10, 3);
        assert_eq!(policy.deletion_target(25), 15);
        assert_eq!(policy.deletion_target(10), 0);
        assert_eq!(policy.deletion_target(4), 0);
        assert_eq!(RetentionPolicy::new(0, 3).deletion_target(7), 7);
    }

    #[test]
    fn batches_split_target() {
        let policy = RetentionPolicy::new(0, 4);
        assert_eq!(policy.batches(10).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(policy.batches(8).collect::<Vec<_>>(), vec![4, 4]);
        assert_eq!(policy.batches(0).count(), 0);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let policy = RetentionPolicy::new(0, 0);
        assert_eq!(policy.batch_size, 1);
        assert_eq!(policy.batches(3).collect::<Vec<_>>(), vec![1, 1, 1]);
    }

    proptest! {
        #[test]
        fn batches_sum_to_target(target in 0u64..5_000, batch in 1u64..700) {
            let policy = RetentionPolicy::new(0, batch);
            let sizes: Vec<u64> = policy.batches(target).collect();
            prop_assert_eq!(sizes.iter().sum::<u64>(), target);
            prop_assert!(sizes.iter().all(|s| *s > 0 && *s <= batch));
        }

        #[test]
        fn remaining_never_exceeds_ceiling(current in 0u64..1_000_000, ceiling in 0u64..1_000_000) {
            let policy = RetentionPolicy::new(ceiling, 100);
            let remaining = current - policy.deletion_target(current);
            prop_assert!(remaining <= ceiling);
            prop_assert_eq!(remaining, current.min(ceiling));
        }
    }
}
