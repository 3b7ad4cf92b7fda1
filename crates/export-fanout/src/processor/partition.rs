//! Static apportionment of size tiers to worker instances
//!
//! Instances are bucketed by index into contiguous groups. Each group gets
//! an ordered allow-list of tiers; dequeue tries them in order. Middle tiers
//! overlap so a starved queue is still drained by neighbouring capacity.

use export_common::SizeTier;
use std::ops::Range;

use crate::config::FileProcessorConfig;

const ALL_SMALLEST_FIRST: &[SizeTier] = &[
    SizeTier::Empty,
    SizeTier::Small,
    SizeTier::Medium,
    SizeTier::Large,
    SizeTier::Oversize,
];
const EMPTY_ONLY: &[SizeTier] = &[SizeTier::Empty];
const OVERSIZE_FIRST: &[SizeTier] = &[
    SizeTier::Oversize,
    SizeTier::Large,
    SizeTier::Medium,
    SizeTier::Small,
];
const MEDIUM_SMALL_LARGE: &[SizeTier] = &[SizeTier::Medium, SizeTier::Small, SizeTier::Large];
const MEDIUM_SMALL: &[SizeTier] = &[SizeTier::Medium, SizeTier::Small];
const SMALL_ONLY: &[SizeTier] = &[SizeTier::Small];

/// Immutable instance-range to tier-list table, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    groups: Vec<(Range<usize>, &'static [SizeTier])>,
    instance_count: usize,
}

impl PartitionAssignment {
    pub fn new(
        instance_count: usize,
        empty_instances: usize,
        oversized_instances: usize,
        large_instances: usize,
        medium_instances: usize,
    ) -> Self {
        let groups = match instance_count {
            0 => Vec::new(),
            1 => vec![(0..1, ALL_SMALLEST_FIRST)],
            n => {
                let mut groups = Vec::with_capacity(5);
                let mut start: usize = 0;
                for (count, tiers) in [
                    (empty_instances, EMPTY_ONLY),
                    (oversized_instances, OVERSIZE_FIRST),
                    (large_instances, MEDIUM_SMALL_LARGE),
                    (medium_instances, MEDIUM_SMALL),
                    (usize::MAX, SMALL_ONLY),
                ] {
                    let end = start.saturating_add(count).min(n);
                    if end > start {
                        groups.push((start..end, tiers));
                    }
                    start = end;
                }
                groups
            },
        };

        Self {
            groups,
            instance_count,
        }
    }

    pub fn from_config(config: &FileProcessorConfig) -> Self {
        Self::new(
            config.instance_count,
            config.empty_file_instances,
            config.oversized_file_instances,
            config.large_file_instances,
            config.medium_file_instances,
        )
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Allowed tiers for `instance`, in dequeue order. Empty for an index
    /// outside the pool.
    pub fn tiers_for(&self, instance: usize) -> &'static [SizeTier] {
        self.groups
            .iter()
            .find(|(range, _)| range.contains(&instance))
            .map(|(_, tiers)| *tiers)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_instances_is_inert() {
        let assignment = PartitionAssignment::new(0, 1, 1, 1, 1);
        assert!(assignment.tiers_for(0).is_empty());
    }

    #[test]
    fn test_single_instance_serves_everything_smallest_first() {
        let assignment = PartitionAssignment::new(1, 0, 1, 1, 1);
        assert_eq!(assignment.tiers_for(0), ALL_SMALLEST_FIRST);
    }

    #[test]
    fn test_contiguous_groups() {
        let assignment = PartitionAssignment::new(7, 1, 1, 2, 1);
        assert_eq!(assignment.tiers_for(0), EMPTY_ONLY);
        assert_eq!(assignment.tiers_for(1), OVERSIZE_FIRST);
        assert_eq!(assignment.tiers_for(2), MEDIUM_SMALL_LARGE);
        assert_eq!(assignment.tiers_for(3), MEDIUM_SMALL_LARGE);
        assert_eq!(assignment.tiers_for(4), MEDIUM_SMALL);
        assert_eq!(assignment.tiers_for(5), SMALL_ONLY);
        assert_eq!(assignment.tiers_for(6), SMALL_ONLY);
        assert!(assignment.tiers_for(7).is_empty());
    }

    #[test]
    fn test_reservations_larger_than_pool_are_clamped() {
        let assignment = PartitionAssignment::new(3, 0, 1, 1, 1);
        assert_eq!(assignment.tiers_for(0), OVERSIZE_FIRST);
        assert_eq!(assignment.tiers_for(1), MEDIUM_SMALL_LARGE);
        assert_eq!(assignment.tiers_for(2), MEDIUM_SMALL);

        let assignment = PartitionAssignment::new(2, 5, 0, 0, 0);
        assert_eq!(assignment.tiers_for(0), EMPTY_ONLY);
        assert_eq!(assignment.tiers_for(1), EMPTY_ONLY);
    }
}
