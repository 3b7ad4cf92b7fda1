//! Domain types shared across the export pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Product id used when a row leaves its product column empty.
pub const DEFAULT_PRODUCT_ID: &str = "0";

// ============================================================================
// Size Tiers
// ============================================================================

/// File-size bucket used for queue partitioning and worker apportionment.
///
/// `Invalid` never appears on a queue; it marks an idle counter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeTier {
    Empty,
    Small,
    Medium,
    Large,
    Oversize,
    Invalid,
}

impl SizeTier {
    /// Every tier a queue can hold, smallest first.
    pub const QUEUED: [SizeTier; 5] = [
        SizeTier::Empty,
        SizeTier::Small,
        SizeTier::Medium,
        SizeTier::Large,
        SizeTier::Oversize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeTier::Empty => "empty",
            SizeTier::Small => "small",
            SizeTier::Medium => "medium",
            SizeTier::Large => "large",
            SizeTier::Oversize => "oversize",
            SizeTier::Invalid => "invalid",
        }
    }

    /// Dense index for per-tier arrays. `Invalid` has none.
    pub fn index(&self) -> Option<usize> {
        match self {
            SizeTier::Empty => Some(0),
            SizeTier::Small => Some(1),
            SizeTier::Medium => Some(2),
            SizeTier::Large => Some(3),
            SizeTier::Oversize => Some(4),
            SizeTier::Invalid => None,
        }
    }

    pub fn from_index(index: usize) -> SizeTier {
        SizeTier::QUEUED
            .get(index)
            .copied()
            .unwrap_or(SizeTier::Invalid)
    }
}

impl std::fmt::Display for SizeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte boundaries between tiers. A size equal to a boundary stays in the
/// lower tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSizeThresholds {
    pub medium: u64,
    pub large: u64,
    pub oversized: u64,
}

impl Default for FileSizeThresholds {
    fn default() -> Self {
        Self {
            medium: 10 * 1024 * 1024,
            large: 100 * 1024 * 1024,
            oversized: 1024 * 1024 * 1024,
        }
    }
}

impl FileSizeThresholds {
    pub fn tier_for(&self, size: u64) -> SizeTier {
        if size == 0 {
            SizeTier::Empty
        } else if size > self.oversized {
            SizeTier::Oversize
        } else if size > self.large {
            SizeTier::Large
        } else if size > self.medium {
            SizeTier::Medium
        } else {
            SizeTier::Small
        }
    }
}

/// Normalizes a command id so `AB-CD` and `abcd` route to the same writer.
pub fn canonicalize_command_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

// ============================================================================
// File Records
// ============================================================================

/// Dotted tag `<store>.<agent>.<name>` naming a manifest or data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTag<'a> {
    pub store: &'a str,
    pub agent: &'a str,
    pub name: &'a str,
}

impl<'a> FileTag<'a> {
    pub fn parse(tag: &'a str) -> Option<Self> {
        let mut parts = tag.splitn(3, '.');
        let store = parts.next()?;
        let agent = parts.next()?;
        let name = parts.next()?;
        if store.is_empty() || agent.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self { store, agent, name })
    }
}

/// One export file waiting to be split by command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDataFile {
    pub agent_id: String,
    /// Path of the data file relative to its file system root
    pub data_file_path: String,
    /// Tag of the data file, reported on completion
    pub data_file_tag: String,
    /// Tag of the manifest that listed this file
    pub manifest_tag: String,
    /// Name the export product is written under
    pub export_file_name: String,
}

impl PendingDataFile {
    /// Manifest name for stats lines; the raw tag when it is not dotted.
    pub fn manifest_name(&self) -> &str {
        FileTag::parse(&self.manifest_tag)
            .map(|t| t.name)
            .unwrap_or(&self.manifest_tag)
    }

    /// Last path segment of the data file.
    pub fn data_file_name(&self) -> &str {
        self.data_file_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.data_file_path)
    }
}

/// Signal sent downstream once per processed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteDataFile {
    pub agent_id: String,
    pub file_tag: String,
    pub manifest_tag: String,
}

impl From<&PendingDataFile> for CompleteDataFile {
    fn from(file: &PendingDataFile) -> Self {
        Self {
            agent_id: file.agent_id.clone(),
            file_tag: file.data_file_tag.clone(),
            manifest_tag: file.manifest_tag.clone(),
        }
    }
}

/// Durable per-(file, command) outcome consumed by the command feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFileState {
    /// `<command id>&<data file path>`
    pub key: String,
    pub command_id: String,
    pub agent_id: String,
    pub file_path: String,
    pub non_transient_error_info: Option<String>,
    pub byte_count: u64,
    pub row_count: u64,
    pub recorded_at: DateTime<Utc>,
}

impl CommandFileState {
    pub fn key_for(command_id: &str, file_path: &str) -> String {
        format!("{}&{}", command_id, file_path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        let t = FileSizeThresholds {
            medium: 1000,
            large: 2000,
            oversized: 5000,
        };
        assert_eq!(t.tier_for(0), SizeTier::Empty);
        assert_eq!(t.tier_for(1), SizeTier::Small);
        assert_eq!(t.tier_for(1000), SizeTier::Small);
        assert_eq!(t.tier_for(1001), SizeTier::Medium);
        assert_eq!(t.tier_for(2001), SizeTier::Large);
        assert_eq!(t.tier_for(5000), SizeTier::Large);
        assert_eq!(t.tier_for(5001), SizeTier::Oversize);
    }

    #[test]
    fn test_canonicalize_command_id() {
        assert_eq!(
            canonicalize_command_id("A1B2-C3D4-E5"),
            "a1b2c3d4e5".to_string()
        );
        assert_eq!(canonicalize_command_id("---"), "");
    }

    #[test]
    fn test_file_tag_parse() {
        let tag = FileTag::parse("store1.agent7.manifest.tsv").unwrap();
        assert_eq!(tag.agent, "agent7");
        assert_eq!(tag.name, "manifest.tsv");
        assert!(FileTag::parse("justaname").is_none());
    }

    #[test]
    fn test_manifest_name_falls_back_to_tag() {
        let mut file = PendingDataFile {
            agent_id: "agent".into(),
            data_file_path: "agent/export/data_01.tsv".into(),
            data_file_tag: "s.agent.data_01.tsv".into(),
            manifest_tag: "s.agent.manifest_01".into(),
            export_file_name: "export".into(),
        };
        assert_eq!(file.manifest_name(), "manifest_01");
        assert_eq!(file.data_file_name(), "data_01.tsv");

        file.manifest_tag = "loose".into();
        assert_eq!(file.manifest_name(), "loose");
    }

    #[test]
    fn test_tier_index_round_trip() {
        for tier in SizeTier::QUEUED {
            let idx = tier.index().unwrap();
            assert_eq!(SizeTier::from_index(idx), tier);
        }
        assert_eq!(SizeTier::Invalid.index(), None);
        assert_eq!(SizeTier::from_index(9), SizeTier::Invalid);
    }
}
