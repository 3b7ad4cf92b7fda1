//! File processor configuration
//!
//! Every setting is read from an `EXPORT_FANOUT_*` environment variable and
//! falls back to the matching `DEFAULT_*` constant.

use export_common::types::FileSizeThresholds;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Worker Pool Constants
// ============================================================================

/// Default number of worker instances.
pub const DEFAULT_INSTANCE_COUNT: usize = 4;

/// Default number of instances reserved for the Empty tier.
pub const DEFAULT_EMPTY_FILE_INSTANCES: usize = 0;

/// Default number of instances that prefer Oversize files.
pub const DEFAULT_OVERSIZED_FILE_INSTANCES: usize = 1;

/// Default number of instances that prefer Large files.
pub const DEFAULT_LARGE_FILE_INSTANCES: usize = 1;

/// Default number of instances that prefer Medium files.
pub const DEFAULT_MEDIUM_FILE_INSTANCES: usize = 1;

// ============================================================================
// Lease Constants
// ============================================================================

/// Default queue item and file lock lease in minutes.
pub const DEFAULT_LEASE_MINUTES: u64 = 30;

/// Default multiplier applied to the lease.
pub const DEFAULT_LEASE_TIME_MULTIPLE: u64 = 1;

/// Default minimum interval between lease renewals in minutes.
pub const DEFAULT_MINIMUM_RENEW_MINUTES: u64 = 5;

/// Default delay before an incomplete item becomes visible again.
pub const DEFAULT_DELAY_IF_INCOMPLETE_MINUTES: u64 = 10;

/// Default pause after a cycle fails with an error.
pub const DEFAULT_DELAY_ON_EXCEPTION_MINUTES: u64 = 1;

/// Default redelivery count above which an item is evicted.
pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 5;

/// Default time to wait inside a single dequeue call.
pub const DEFAULT_DEQUEUE_WAIT_SECS: u64 = 0;

// ============================================================================
// Fan-out Constants
// ============================================================================

/// Default pending bytes a single command writer buffers before flushing.
pub const DEFAULT_COMMAND_PENDING_BYTE_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Default pending bytes across all writers of one file before forced flushes.
pub const DEFAULT_OVERALL_PENDING_BYTE_THRESHOLD: u64 = 256 * 1024 * 1024;

/// Default minimum seconds between heartbeat traces.
pub const DEFAULT_PROGRESS_UPDATE_SECS: u64 = 60;

/// Default file age (hours) after which writer faults are assumed non-transient.
pub const DEFAULT_ASSUME_TRANSIENT_HOURS: u64 = 72;

// ============================================================================
// Retirement / Stats Constants
// ============================================================================

/// Default holding path, relative to the data file system root.
pub const DEFAULT_HOLDING_PATH: &str = "holding/";

/// Default retention of processed files in the holding path.
pub const DEFAULT_HOLDING_EXPIRY_DAYS: u64 = 7;

/// Default directory for the periodic stats files.
pub const DEFAULT_STATS_DIR: &str = "./stats";

/// Pause returned when no work is available.
pub const EMPTY_QUEUE_PAUSE: Duration = Duration::from_secs(15);

/// Interval of the counter aggregation task.
pub const COUNTER_UPDATE_FREQUENCY: Duration = Duration::from_secs(30);

/// Interval of the stats flush task.
pub const STATS_FLUSH_FREQUENCY: Duration = Duration::from_secs(60);

/// Rotation period of stats files.
pub const STATS_FILE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// File processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProcessorConfig {
    pub instance_count: usize,
    pub empty_file_instances: usize,
    pub oversized_file_instances: usize,
    pub large_file_instances: usize,
    pub medium_file_instances: usize,

    pub lease_minutes: u64,
    pub lease_time_multiple: u64,
    pub minimum_renew_minutes: u64,
    pub delay_if_incomplete_minutes: u64,
    pub delay_on_exception_minutes: u64,
    pub max_dequeue_count: u32,
    pub dequeue_wait_secs: u64,

    pub command_pending_byte_threshold: u64,
    pub overall_pending_byte_threshold: u64,
    pub progress_update_secs: u64,
    pub assume_transient_hours: u64,

    pub holding_path: String,
    pub holding_expiry_days: u64,
    pub stats_dir: PathBuf,

    pub size_thresholds: FileSizeThresholds,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(format!("EXPORT_FANOUT_{}", name))
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl FileProcessorConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = FileSizeThresholds::default();

        let config = Self {
            instance_count: env_or("INSTANCE_COUNT", DEFAULT_INSTANCE_COUNT),
            empty_file_instances: env_or("EMPTY_FILE_INSTANCES", DEFAULT_EMPTY_FILE_INSTANCES),
            oversized_file_instances: env_or(
                "OVERSIZED_FILE_INSTANCES",
                DEFAULT_OVERSIZED_FILE_INSTANCES,
            ),
            large_file_instances: env_or("LARGE_FILE_INSTANCES", DEFAULT_LARGE_FILE_INSTANCES),
            medium_file_instances: env_or("MEDIUM_FILE_INSTANCES", DEFAULT_MEDIUM_FILE_INSTANCES),

            lease_minutes: env_or("LEASE_MINUTES", DEFAULT_LEASE_MINUTES),
            lease_time_multiple: env_or("LEASE_TIME_MULTIPLE", DEFAULT_LEASE_TIME_MULTIPLE),
            minimum_renew_minutes: env_or("MINIMUM_RENEW_MINUTES", DEFAULT_MINIMUM_RENEW_MINUTES),
            delay_if_incomplete_minutes: env_or(
                "DELAY_IF_INCOMPLETE_MINUTES",
                DEFAULT_DELAY_IF_INCOMPLETE_MINUTES,
            ),
            delay_on_exception_minutes: env_or(
                "DELAY_ON_EXCEPTION_MINUTES",
                DEFAULT_DELAY_ON_EXCEPTION_MINUTES,
            ),
            max_dequeue_count: env_or("MAX_DEQUEUE_COUNT", DEFAULT_MAX_DEQUEUE_COUNT),
            dequeue_wait_secs: env_or("DEQUEUE_WAIT_SECONDS", DEFAULT_DEQUEUE_WAIT_SECS),

            command_pending_byte_threshold: env_or(
                "COMMAND_PENDING_BYTE_THRESHOLD",
                DEFAULT_COMMAND_PENDING_BYTE_THRESHOLD,
            ),
            overall_pending_byte_threshold: env_or(
                "OVERALL_PENDING_BYTE_THRESHOLD",
                DEFAULT_OVERALL_PENDING_BYTE_THRESHOLD,
            ),
            progress_update_secs: env_or("PROGRESS_UPDATE_SECONDS", DEFAULT_PROGRESS_UPDATE_SECS),
            assume_transient_hours: env_or(
                "ASSUME_TRANSIENT_HOURS",
                DEFAULT_ASSUME_TRANSIENT_HOURS,
            ),

            holding_path: env_or("HOLDING_PATH", DEFAULT_HOLDING_PATH.to_string()),
            holding_expiry_days: env_or("HOLDING_EXPIRY_DAYS", DEFAULT_HOLDING_EXPIRY_DAYS),
            stats_dir: PathBuf::from(env_or("STATS_DIR", DEFAULT_STATS_DIR.to_string())),

            size_thresholds: FileSizeThresholds {
                medium: env_or("MEDIUM_FILE_SIZE_THRESHOLD", defaults.medium),
                large: env_or("LARGE_FILE_SIZE_THRESHOLD", defaults.large),
                oversized: env_or("OVERSIZED_FILE_SIZE_THRESHOLD", defaults.oversized),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_minutes == 0 {
            anyhow::bail!("lease_minutes must be greater than 0");
        }

        if self.minimum_renew_minutes == 0 {
            anyhow::bail!("minimum_renew_minutes must be greater than 0");
        }

        let lease_minutes = self
            .lease_minutes_total()
            .ok_or_else(|| anyhow::anyhow!("lease_minutes times lease_time_multiple is out of range"))?;
        ensure_fits("lease_minutes", lease_minutes, MINUTE)?;
        ensure_fits("minimum_renew_minutes", self.minimum_renew_minutes, MINUTE)?;
        ensure_fits("delay_if_incomplete_minutes", self.delay_if_incomplete_minutes, MINUTE)?;
        ensure_fits("delay_on_exception_minutes", self.delay_on_exception_minutes, MINUTE)?;
        ensure_fits("holding_expiry_days", self.holding_expiry_days, DAY)?;
        // chrono durations hold at most i64::MAX milliseconds
        if self.progress_update_secs > i64::MAX as u64 / 1000
            || self.assume_transient_hours > i64::MAX as u64 / (HOUR * 1000)
        {
            anyhow::bail!("progress_update_secs and assume_transient_hours must fit a signed duration");
        }

        if self.minimum_renew_minutes.saturating_mul(2) > lease_minutes {
            anyhow::bail!(
                "minimum_renew_minutes ({}) must be at most half the lease ({} minutes)",
                self.minimum_renew_minutes,
                lease_minutes
            );
        }

        if self.command_pending_byte_threshold == 0 || self.overall_pending_byte_threshold == 0 {
            anyhow::bail!("pending byte thresholds must be greater than 0");
        }

        let t = &self.size_thresholds;
        if !(t.medium < t.large && t.large < t.oversized) {
            anyhow::bail!(
                "file size thresholds must increase: medium {} < large {} < oversized {}",
                t.medium,
                t.large,
                t.oversized
            );
        }

        let reserved = self.empty_file_instances
            + self.oversized_file_instances
            + self.large_file_instances
            + self.medium_file_instances;
        if self.instance_count > 1 && reserved >= self.instance_count {
            tracing::warn!(
                instance_count = self.instance_count,
                reserved,
                "No instance is left for small-only processing"
            );
        }

        Ok(())
    }

    fn lease_minutes_total(&self) -> Option<u64> {
        self.lease_time_multiple.max(1).checked_mul(self.lease_minutes)
    }

    /// Lease applied to both the queue item and the file lock.
    pub fn lease_duration(&self) -> Duration {
        saturating_secs(self.lease_minutes_total().unwrap_or(u64::MAX), MINUTE)
    }

    pub fn renew_frequency(&self) -> Duration {
        saturating_secs(self.minimum_renew_minutes, MINUTE)
    }

    pub fn delay_if_incomplete(&self) -> Duration {
        saturating_secs(self.delay_if_incomplete_minutes, MINUTE)
    }

    pub fn delay_on_exception(&self) -> Duration {
        saturating_secs(self.delay_on_exception_minutes, MINUTE)
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_secs(self.dequeue_wait_secs)
    }

    /// Minimum gap between two heartbeats of one file.
    pub fn progress_update(&self) -> chrono::Duration {
        i64::try_from(self.progress_update_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn assume_transient_window(&self) -> chrono::Duration {
        i64::try_from(self.assume_transient_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn holding_expiry(&self) -> Duration {
        saturating_secs(self.holding_expiry_days, DAY)
    }
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

fn saturating_secs(value: u64, unit: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(unit))
}

/// Reject a `value` in `unit` seconds that does not fit a duration.
fn ensure_fits(name: &str, value: u64, unit: u64) -> anyhow::Result<()> {
    if value.checked_mul(unit).is_none() {
        anyhow::bail!("{} ({}) is out of range", name, value);
    }
    Ok(())
}

impl Default for FileProcessorConfig {
    fn default() -> Self {
        Self {
            instance_count: DEFAULT_INSTANCE_COUNT,
            empty_file_instances: DEFAULT_EMPTY_FILE_INSTANCES,
            oversized_file_instances: DEFAULT_OVERSIZED_FILE_INSTANCES,
            large_file_instances: DEFAULT_LARGE_FILE_INSTANCES,
            medium_file_instances: DEFAULT_MEDIUM_FILE_INSTANCES,
            lease_minutes: DEFAULT_LEASE_MINUTES,
            lease_time_multiple: DEFAULT_LEASE_TIME_MULTIPLE,
            minimum_renew_minutes: DEFAULT_MINIMUM_RENEW_MINUTES,
            delay_if_incomplete_minutes: DEFAULT_DELAY_IF_INCOMPLETE_MINUTES,
            delay_on_exception_minutes: DEFAULT_DELAY_ON_EXCEPTION_MINUTES,
            max_dequeue_count: DEFAULT_MAX_DEQUEUE_COUNT,
            dequeue_wait_secs: DEFAULT_DEQUEUE_WAIT_SECS,
            command_pending_byte_threshold: DEFAULT_COMMAND_PENDING_BYTE_THRESHOLD,
            overall_pending_byte_threshold: DEFAULT_OVERALL_PENDING_BYTE_THRESHOLD,
            progress_update_secs: DEFAULT_PROGRESS_UPDATE_SECS,
            assume_transient_hours: DEFAULT_ASSUME_TRANSIENT_HOURS,
            holding_path: DEFAULT_HOLDING_PATH.to_string(),
            holding_expiry_days: DEFAULT_HOLDING_EXPIRY_DAYS,
            stats_dir: PathBuf::from(DEFAULT_STATS_DIR),
            size_thresholds: FileSizeThresholds::default(),
        }
    }
}

/// Settings for the local collaborator backends used by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root holding `inbox/<agent>/<file>` and the holding area
    pub data_root: PathBuf,
    /// Where command writers put their output
    pub output_dir: PathBuf,
    /// Commands with a known destination; everything else is dead-lettered.
    /// Empty means every command is known.
    pub known_commands: Vec<String>,
}

impl LocalConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            data_root: PathBuf::from(env_or("DATA_ROOT", "./data".to_string())),
            output_dir: PathBuf::from(env_or("OUTPUT_DIR", "./output".to_string())),
            known_commands: std::env::var("EXPORT_FANOUT_KNOWN_COMMANDS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(export_common::types::canonicalize_command_id)
                .collect(),
        };

        if config.data_root.as_os_str().is_empty() {
            anyhow::bail!("EXPORT_FANOUT_DATA_ROOT cannot be empty");
        }

        Ok(config)
    }
}
