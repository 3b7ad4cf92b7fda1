//! In-memory partitioned queue
//!
//! One FIFO per size tier. Dequeuing hides an item for the lease duration
//! and bumps its dequeue count; an item that is neither completed nor
//! renewed becomes visible again when its lease runs out.

use anyhow::Result;
use async_trait::async_trait;
use export_common::types::PendingDataFile;
use export_common::SizeTier;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::collaborators::{PartitionedItem, PartitionedQueue, WorkItem};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    data: PendingDataFile,
    dequeue_count: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<Uuid, Entry>,
    order: BTreeMap<SizeTier, VecDeque<Uuid>>,
}

impl QueueState {
    fn take_visible(&mut self, tier: SizeTier, lease: Duration) -> Option<(Uuid, PendingDataFile, u32)> {
        let now = Instant::now();
        let ids = self.order.get(&tier)?;
        let id = ids
            .iter()
            .copied()
            .find(|id| self.entries.get(id).is_some_and(|e| e.visible_at <= now))?;

        let entry = self.entries.get_mut(&id)?;
        entry.dequeue_count += 1;
        entry.visible_at = now + lease;
        Some((id, entry.data.clone(), entry.dequeue_count))
    }

    fn remove(&mut self, id: Uuid) -> bool {
        if self.entries.remove(&id).is_none() {
            return false;
        }
        for ids in self.order.values_mut() {
            ids.retain(|i| *i != id);
        }
        true
    }
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items in `tier`, visible or not, in queue order.
    pub async fn items(&self, tier: SizeTier) -> Vec<PendingDataFile> {
        let state = self.state.lock().await;
        state
            .order
            .get(&tier)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.entries.get(id))
                    .map(|e| e.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PartitionedQueue for MemoryQueue {
    async fn dequeue(
        &self,
        tiers: &[SizeTier],
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<PartitionedItem>> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut state = self.state.lock().await;
                for tier in tiers {
                    if let Some((id, data, dequeue_count)) = state.take_visible(*tier, lease) {
                        debug!(tier = %tier, file = %data.data_file_tag, dequeue_count, "Dequeued");
                        let item = MemoryWorkItem {
                            state: self.state.clone(),
                            id,
                            data,
                            dequeue_count,
                        };
                        return Ok(Some(PartitionedItem {
                            tier: *tier,
                            item: Arc::new(item),
                        }));
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn enqueue(&self, tier: SizeTier, file: PendingDataFile) -> Result<()> {
        if tier.index().is_none() {
            anyhow::bail!("Cannot enqueue {} to the {} tier", file.data_file_tag, tier);
        }

        let id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state.entries.insert(
            id,
            Entry {
                data: file,
                dequeue_count: 0,
                visible_at: Instant::now(),
            },
        );
        state.order.entry(tier).or_default().push_back(id);
        Ok(())
    }
}

pub struct MemoryWorkItem {
    state: Arc<Mutex<QueueState>>,
    id: Uuid,
    data: PendingDataFile,
    dequeue_count: u32,
}

#[async_trait]
impl WorkItem for MemoryWorkItem {
    fn data(&self) -> &PendingDataFile {
        &self.data
    }

    fn dequeue_count(&self) -> u32 {
        self.dequeue_count
    }

    async fn renew_lease(&self, duration: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.entries.get_mut(&self.id) {
            Some(entry) => {
                entry.visible_at = Instant::now() + duration;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn complete(&self) -> Result<()> {
        self.state.lock().await.remove(self.id);
        Ok(())
    }
}
