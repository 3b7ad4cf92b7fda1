//! Per-instance progress counters and their periodic aggregation
//!
//! Each worker instance owns one slot in a fixed array and is the only
//! writer of that slot. The aggregation task reads all slots with relaxed
//! loads; a slot read mid-update is tolerated since the result only feeds
//! gauges.

use export_common::SizeTier;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

const IDLE: u8 = u8::MAX;

/// Progress of the file one instance is working on.
#[derive(Debug)]
pub struct CounterSlot {
    tier: AtomicU8,
    elapsed_ms: AtomicU64,
    bytes: AtomicU64,
    rows: AtomicU64,
    dead_letter: AtomicU32,
    abandoned: AtomicU32,
    real: AtomicU32,
}

impl Default for CounterSlot {
    fn default() -> Self {
        Self {
            tier: AtomicU8::new(IDLE),
            elapsed_ms: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            dead_letter: AtomicU32::new(0),
            abandoned: AtomicU32::new(0),
            real: AtomicU32::new(0),
        }
    }
}

/// Writer counts by category at one point in a file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterCounts {
    pub real: u32,
    pub dead_letter: u32,
    pub abandoned: u32,
}

impl WriterCounts {
    pub fn total(&self) -> u32 {
        self.real + self.dead_letter + self.abandoned
    }
}

impl CounterSlot {
    pub fn set_in_progress(&self, tier: SizeTier) {
        self.clear_progress();
        let encoded = tier.index().map(|i| i as u8).unwrap_or(IDLE);
        self.tier.store(encoded, Ordering::Relaxed);
    }

    pub fn update(&self, elapsed: Duration, bytes: u64, rows: u64, writers: WriterCounts) {
        self.elapsed_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        self.real.store(writers.real, Ordering::Relaxed);
        self.dead_letter.store(writers.dead_letter, Ordering::Relaxed);
        self.abandoned.store(writers.abandoned, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.tier.store(IDLE, Ordering::Relaxed);
        self.clear_progress();
    }

    pub fn tier(&self) -> SizeTier {
        match self.tier.load(Ordering::Relaxed) {
            IDLE => SizeTier::Invalid,
            i => SizeTier::from_index(i as usize),
        }
    }

    fn clear_progress(&self) {
        self.update(Duration::ZERO, 0, 0, WriterCounts::default());
    }
}

/// Throughput of the files currently in progress for one tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct TierGauge {
    pub in_progress: u32,
    /// `None` for the Empty tier
    pub bytes_per_sec: Option<u64>,
    pub rows_per_sec: Option<u64>,
    pub completed: u64,
}

/// Aggregated view over all instance slots.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct GaugeSnapshot {
    pub in_progress: u32,
    pub bytes_per_sec: u64,
    pub rows_per_sec: u64,
    pub writers: WriterCounts,
    pub tiers: BTreeMap<SizeTier, TierGauge>,
}

#[derive(Default)]
struct TierTotals {
    count: u32,
    elapsed_ms: u64,
    bytes: u64,
    rows: u64,
}

fn per_sec(amount: u64, elapsed_ms: u64) -> u64 {
    let secs = elapsed_ms / 1000;
    if secs > 0 {
        amount / secs
    } else {
        0
    }
}

/// Fixed arena of counter slots, one per worker instance, plus completion
/// counters per tier.
#[derive(Debug)]
pub struct InstanceCounters {
    slots: Box<[CounterSlot]>,
    completed: [AtomicU64; 5],
}

impl InstanceCounters {
    pub fn new(instances: usize) -> Self {
        Self {
            slots: (0..instances).map(|_| CounterSlot::default()).collect(),
            completed: Default::default(),
        }
    }

    /// Slot of `instance`. Indices past the pool share no state with real
    /// instances and are never aggregated.
    pub fn slot(&self, instance: usize) -> Option<&CounterSlot> {
        self.slots.get(instance)
    }

    pub fn record_completed(&self, tier: SizeTier) {
        if let Some(counter) = tier.index().and_then(|i| self.completed.get(i)) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sum all slots into per-tier and overall gauges.
    pub fn snapshot(&self) -> GaugeSnapshot {
        let mut totals: BTreeMap<SizeTier, TierTotals> = SizeTier::QUEUED
            .iter()
            .map(|t| (*t, TierTotals::default()))
            .collect();
        let mut writers = WriterCounts::default();

        for slot in self.slots.iter() {
            writers.real += slot.real.load(Ordering::Relaxed);
            writers.dead_letter += slot.dead_letter.load(Ordering::Relaxed);
            writers.abandoned += slot.abandoned.load(Ordering::Relaxed);

            if let Some(t) = totals.get_mut(&slot.tier()) {
                t.count += 1;
                t.elapsed_ms += slot.elapsed_ms.load(Ordering::Relaxed);
                t.bytes += slot.bytes.load(Ordering::Relaxed);
                t.rows += slot.rows.load(Ordering::Relaxed);
            }
        }

        let elapsed_ms: u64 = totals.values().map(|t| t.elapsed_ms).sum();
        let bytes: u64 = totals.values().map(|t| t.bytes).sum();
        let rows: u64 = totals.values().map(|t| t.rows).sum();

        let tiers = totals
            .into_iter()
            .map(|(tier, t)| {
                let rates = tier != SizeTier::Empty;
                let completed = tier
                    .index()
                    .and_then(|i| self.completed.get(i))
                    .map(|c| c.load(Ordering::Relaxed))
                    .unwrap_or(0);
                let gauge = TierGauge {
                    in_progress: t.count,
                    bytes_per_sec: rates.then(|| per_sec(t.bytes, t.elapsed_ms)),
                    rows_per_sec: rates.then(|| per_sec(t.rows, t.elapsed_ms)),
                    completed,
                };
                (tier, gauge)
            })
            .collect::<BTreeMap<_, _>>();

        GaugeSnapshot {
            in_progress: tiers.values().map(|g| g.in_progress).sum(),
            bytes_per_sec: per_sec(bytes, elapsed_ms),
            rows_per_sec: per_sec(rows, elapsed_ms),
            writers,
            tiers,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_slots_count_nothing() {
        let counters = InstanceCounters::new(3);
        let snap = counters.snapshot();
        assert_eq!(snap.in_progress, 0);
        assert_eq!(snap.writers.total(), 0);
        assert_eq!(counters.slot(0).unwrap().tier(), SizeTier::Invalid);
    }

    #[test]
    fn test_snapshot_aggregates_by_tier() {
        let counters = InstanceCounters::new(3);

        let a = counters.slot(0).unwrap();
        a.set_in_progress(SizeTier::Large);
        a.update(
            Duration::from_secs(10),
            1000,
            50,
            WriterCounts {
                real: 2,
                dead_letter: 1,
                abandoned: 0,
            },
        );

        let b = counters.slot(1).unwrap();
        b.set_in_progress(SizeTier::Empty);
        b.update(Duration::from_secs(2), 0, 0, WriterCounts::default());

        let snap = counters.snapshot();
        assert_eq!(snap.in_progress, 2);
        assert_eq!(snap.writers.real, 2);
        assert_eq!(snap.writers.dead_letter, 1);
        assert_eq!(snap.bytes_per_sec, 1000 / 12);

        let large = snap.tiers[&SizeTier::Large];
        assert_eq!(large.in_progress, 1);
        assert_eq!(large.bytes_per_sec, Some(100));
        assert_eq!(large.rows_per_sec, Some(5));

        let empty = snap.tiers[&SizeTier::Empty];
        assert_eq!(empty.in_progress, 1);
        assert_eq!(empty.bytes_per_sec, None);
    }

    #[test]
    fn test_reset_returns_slot_to_idle() {
        let counters = InstanceCounters::new(1);
        let slot = counters.slot(0).unwrap();
        slot.set_in_progress(SizeTier::Small);
        slot.update(Duration::from_secs(1), 10, 1, WriterCounts::default());
        slot.reset();

        assert_eq!(slot.tier(), SizeTier::Invalid);
        assert_eq!(counters.snapshot().in_progress, 0);
    }

    #[test]
    fn test_completed_counts() {
        let counters = InstanceCounters::new(1);
        counters.record_completed(SizeTier::Small);
        counters.record_completed(SizeTier::Small);
        counters.record_completed(SizeTier::Invalid);

        assert_eq!(counters.snapshot().tiers[&SizeTier::Small].completed, 2);
    }
}
