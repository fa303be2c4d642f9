//! Reconstruction configuration, loadable from TOML or JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use archivum_transport::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::category::CollectionConfig;
use crate::error::{ReconError, Result};
use crate::TenantId;

/// What to do when a logged object cannot be found after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingEntryPolicy {
    /// The item fails and its offset stays put.
    #[default]
    Fail,
    /// The entry is logged and skipped; the offset moves past it.
    Skip,
}

/// Retry settings for remote calls, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub first_delay_ms: u64,
    /// Increment per further retry.
    pub step_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_delay_ms: 100,
            step_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// The policy these settings describe.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.first_delay_ms),
            Duration::from_millis(self.step_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
        .with_jitter(self.jitter)
    }
}

/// Configuration of the reconstruction engine and the `arc-repl` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Retry policy for backup-log, store and index calls.
    pub retry: RetrySettings,
    /// Page size when listing the backup log.
    pub restore_bulk_size: usize,
    /// Tenant under which graph snapshots are logged and tracked.
    pub admin_tenant: TenantId,
    /// Handling of entries whose object is missing.
    pub missing_entries: MissingEntryPolicy,
    /// Request items processed concurrently.
    pub max_parallel_items: usize,
    /// Graph snapshot windows end this long before "now".
    pub graph_overlap_delay_secs: u64,
    /// Documents per graph snapshot batch.
    pub graph_batch_size: usize,
    /// Graph-only documents older than this are purged.
    pub graph_only_purge_delay_secs: u64,
    /// Registered categories.
    pub collections: Vec<CollectionConfig>,
    /// Root of the directory-backed backup log used by the CLI.
    pub backup_root: PathBuf,
    /// Offset file used by the CLI.
    pub offset_file: PathBuf,
}

const UNIT_GRAPH_FIELDS: &[&str] = &["_up", "_us", "_uds", "_us_sp", "_graph", "_sps", "_max", "_min", "_glpd"];
const OBJECTGROUP_GRAPH_FIELDS: &[&str] = &["_up", "_us", "_uds", "_sps", "_glpd"];

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            restore_bulk_size: 1000,
            admin_tenant: 1,
            missing_entries: MissingEntryPolicy::Fail,
            max_parallel_items: 4,
            graph_overlap_delay_secs: 300,
            graph_batch_size: 1000,
            graph_only_purge_delay_secs: 86_400,
            collections: vec![
                CollectionConfig::flat("UNIT", "Unit", UNIT_GRAPH_FIELDS),
                CollectionConfig::flat("OBJECTGROUP", "ObjectGroup", OBJECTGROUP_GRAPH_FIELDS),
                CollectionConfig::graph("UNIT_GRAPH", "UNIT"),
                CollectionConfig::graph("OBJECTGROUP_GRAPH", "OBJECTGROUP"),
            ],
            backup_root: PathBuf::from("/var/lib/archivum/backup"),
            offset_file: PathBuf::from("/var/lib/archivum/offsets.json"),
        }
    }
}

impl ReconConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReconConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("restore_bulk_size", self.restore_bulk_size),
            ("max_parallel_items", self.max_parallel_items),
            ("graph_batch_size", self.graph_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ReconError::Config {
                    msg: format!("{} must be positive", name),
                });
            }
        }
        Ok(())
    }

    /// Graph snapshot window overlap.
    pub fn graph_overlap_delay(&self) -> Duration {
        Duration::from_secs(self.graph_overlap_delay_secs)
    }

    /// Minimum age before a graph-only document is purged.
    pub fn graph_only_purge_delay(&self) -> Duration {
        Duration::from_secs(self.graph_only_purge_delay_secs)
    }
}
