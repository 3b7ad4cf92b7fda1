//! Lease renewal for an in-flight file
//!
//! A file is owned through two independent leases: the queue item's
//! visibility lease and the advisory file lock. [`LeaseRenewer`] keeps both
//! alive while the file is processed. Every suspension point of the row loop
//! goes through [`LeaseRenewer::guard`], which races the I/O against a
//! renewal timer. The close/commit phase goes through
//! [`LeaseRenewer::wait_and_renew`], which also reports waits that overrun
//! the lease.

use anyhow::Result;
use async_trait::async_trait;
use export_common::types::PendingDataFile;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::collaborators::{FileLease, WorkItem};

/// Something that can extend its own lease.
#[async_trait]
pub trait Renewable: Send + Sync {
    fn describe(&self) -> &'static str;
    async fn renew(&self, duration: Duration) -> Result<bool>;
}

/// Queue item visibility lease.
pub struct QueueItemLease(pub Arc<dyn WorkItem>);

#[async_trait]
impl Renewable for QueueItemLease {
    fn describe(&self) -> &'static str {
        "queue item"
    }

    async fn renew(&self, duration: Duration) -> Result<bool> {
        self.0.renew_lease(duration).await
    }
}

/// Advisory file lock lease.
pub struct FileLockLease(pub Arc<dyn FileLease>);

#[async_trait]
impl Renewable for FileLockLease {
    fn describe(&self) -> &'static str {
        "file lock"
    }

    async fn renew(&self, duration: Duration) -> Result<bool> {
        self.0.renew(duration).await
    }
}

pub struct LeaseRenewer {
    leases: Vec<Box<dyn Renewable>>,
    lease_duration: Duration,
    renew_frequency: Duration,
    last_renewal: Mutex<Instant>,
    label: String,
}

impl LeaseRenewer {
    /// The leases are assumed freshly acquired, so the first renewal is due
    /// one `renew_frequency` from now.
    pub fn new(
        leases: Vec<Box<dyn Renewable>>,
        lease_duration: Duration,
        renew_frequency: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            leases,
            lease_duration,
            renew_frequency,
            last_renewal: Mutex::new(Instant::now()),
            label: label.into(),
        }
    }

    /// Renew every lease if the cadence has elapsed. Returns false when any
    /// lease refused or failed to renew; failures are logged, not raised.
    pub async fn renew(&self) -> bool {
        let mut last = self.last_renewal.lock().await;
        let now = Instant::now();
        if now.duration_since(*last) < self.renew_frequency {
            return true;
        }

        let results = join_all(self.leases.iter().map(|l| l.renew(self.lease_duration))).await;
        *last = now;

        let mut all_renewed = true;
        for (lease, result) in self.leases.iter().zip(results) {
            match result {
                Ok(true) => {},
                Ok(false) => {
                    all_renewed = false;
                    warn!(item = %self.label, lease = lease.describe(), "Lease renewal was refused");
                },
                Err(e) => {
                    all_renewed = false;
                    error!(item = %self.label, lease = lease.describe(), error = %e, "Lease renewal failed");
                },
            }
        }

        debug!(item = %self.label, all_renewed, "Renewed leases");
        all_renewed
    }

    async fn next_due(&self) -> Instant {
        *self.last_renewal.lock().await + self.renew_frequency
    }

    /// Drive `work` to completion, renewing whenever the cadence elapses
    /// before it finishes.
    pub async fn guard<F: Future>(&self, work: F) -> F::Output {
        tokio::pin!(work);
        loop {
            let due = self.next_due().await;
            tokio::select! {
                biased;
                out = &mut work => return out,
                _ = sleep_until(due) => {
                    self.renew().await;
                },
            }
        }
    }

    /// Wait for a batch of close/commit work while keeping the leases alive.
    ///
    /// Ignores cancellation: once the commit phase has started it runs to
    /// the end so the file is not reprocessed after nearly finishing. A wait
    /// cycle longer than half the lease is reported as a warning, one longer
    /// than the lease as an error.
    pub async fn wait_and_renew<F: Future>(&self, file: &PendingDataFile, work: F) -> F::Output {
        let warning_threshold = self.lease_duration / 2;
        tokio::pin!(work);

        loop {
            self.renew().await;

            let started = Instant::now();
            tokio::select! {
                biased;
                out = &mut work => return out,
                _ = sleep(self.renew_frequency) => {},
            }

            let waited = started.elapsed();
            if waited > self.lease_duration {
                error!(
                    event = "FileWriterLeaseRenewWaitedTooLong",
                    agent_id = %file.agent_id,
                    manifest = %file.manifest_tag,
                    file = %file.data_file_path,
                    minutes_actual = waited.as_secs_f64() / 60.0,
                    minutes_expected = self.renew_frequency.as_secs_f64() / 60.0,
                    minutes_lease = self.lease_duration.as_secs_f64() / 60.0,
                    "Writer close wait exceeded the lease"
                );
            } else if waited > warning_threshold {
                warn!(
                    event = "FileWriterLeaseRenewWaitedTooLong",
                    agent_id = %file.agent_id,
                    manifest = %file.manifest_tag,
                    file = %file.data_file_path,
                    minutes_actual = waited.as_secs_f64() / 60.0,
                    minutes_expected = self.renew_frequency.as_secs_f64() / 60.0,
                    minutes_lease = self.lease_duration.as_secs_f64() / 60.0,
                    "Writer close wait exceeded half the lease"
                );
            }
        }
    }
}
