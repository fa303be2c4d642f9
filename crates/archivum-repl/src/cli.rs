//! `arc-repl` operator commands.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::backup_log::{BackupLog, FsBackupLog, Order};
use crate::category::CategoryKind;
use crate::config::ReconConfig;
use crate::offset::{FileOffsetStore, OffsetCursor, OffsetStore};
use crate::TenantId;

/// Command line of the `arc-repl` tool.
#[derive(Parser, Debug)]
#[command(name = "arc-repl")]
#[command(about = "Archivum reconstruction operator CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json). Defaults apply when absent.
    #[arg(short, long, env = "ARC_REPL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Operator subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List every stored reconstruction offset.
    Offsets,
    /// Show how far a (tenant, category) pair lags behind the backup log.
    Lag {
        /// Tenant to inspect. Ignored for graph categories.
        #[arg(short, long)]
        tenant: TenantId,
        /// Category name.
        #[arg(short, long)]
        category: String,
    },
}

/// Reconstruction lag of one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LagReport {
    /// Tenant inspected.
    pub tenant: TenantId,
    /// Canonical category name.
    pub category: String,
    /// Stored offset.
    pub offset: u64,
    /// Sequence of the latest log entry, 0 for an empty log.
    pub tip: u64,
    /// Entries after the stored offset.
    pub pending: usize,
}

impl fmt::Display for LagReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tenant={} category={} offset={} tip={} pending={}",
            self.tenant, self.category, self.offset, self.tip, self.pending
        )
    }
}

/// Compute the lag of `category` for `tenant`, resolving graph categories to
/// the admin tenant.
pub async fn lag(
    config: &ReconConfig,
    log: &dyn BackupLog,
    offsets: &dyn OffsetStore,
    tenant: TenantId,
    category: &str,
) -> Result<LagReport> {
    let collection = config
        .collections
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(category))
        .with_context(|| format!("unknown category {}", category))?;
    let category = collection.name.to_uppercase();
    let tenant = match collection.kind {
        CategoryKind::Flat => tenant,
        CategoryKind::Graph => config.admin_tenant,
    };

    let offset = offsets.find_offset(tenant, &category).await?;
    let tip = log
        .list_entries(tenant, &category, None, Some(1), Order::Desc)
        .await?
        .first()
        .map_or(0, |e| e.sequence);
    let pending = log
        .list_entries(tenant, &category, Some(offset), None, Order::Asc)
        .await?
        .len();

    Ok(LagReport {
        tenant,
        category,
        offset,
        tip,
        pending,
    })
}

/// One line per cursor.
pub fn render_offsets(cursors: &[OffsetCursor]) -> String {
    if cursors.is_empty() {
        return "no offsets stored\n".to_string();
    }
    cursors
        .iter()
        .map(|c| format!("tenant={} category={} offset={}\n", c.tenant, c.category, c.last_sequence))
        .collect()
}

impl Cli {
    /// Configuration selected by `--config`, or defaults.
    pub fn load_config(&self) -> Result<ReconConfig> {
        match &self.config {
            Some(path) => ReconConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display())),
            None => Ok(ReconConfig::default()),
        }
    }

    /// Execute the selected subcommand, printing to stdout.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let offsets = FileOffsetStore::open(&config.offset_file)
            .with_context(|| format!("opening offsets {}", config.offset_file.display()))?;

        match &self.command {
            Command::Offsets => {
                print!("{}", render_offsets(&offsets.all_offsets().await?));
            }
            Command::Lag { tenant, category } => {
                let log = FsBackupLog::new(&config.backup_root);
                let report = lag(&config, &log, &offsets, *tenant, category).await?;
                println!("{}", report);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_log::LogAction;
    use bytes::Bytes;

    #[test]
    fn test_parse_lag() {
        let cli = Cli::try_parse_from(["arc-repl", "--config", "/etc/a.toml", "lag", "--tenant", "3", "--category", "unit"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/a.toml")));
        assert_eq!(
            cli.command,
            Command::Lag {
                tenant: 3,
                category: "unit".to_string()
            }
        );
    }

    #[test]
    fn test_parse_offsets_and_reject_unknown() {
        let cli = Cli::try_parse_from(["arc-repl", "offsets"]).unwrap();
        assert_eq!(cli.command, Command::Offsets);
        assert!(Cli::try_parse_from(["arc-repl", "lag", "--tenant", "x", "--category", "UNIT"]).is_err());
    }

    #[tokio::test]
    async fn test_lag_report() {
        let dir = tempfile::tempdir().unwrap();
        let log = FsBackupLog::new(dir.path().join("backup"));
        for id in ["a", "b", "c"] {
            log.append(2, "UNIT", &format!("{}.json", id), LogAction::Write, Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }
        let offsets = FileOffsetStore::open(dir.path().join("offsets.json")).unwrap();
        offsets.create_or_update_offset(2, "UNIT", 1).await.unwrap();

        let config = ReconConfig::default();
        let report = lag(&config, &log, &offsets, 2, "unit").await.unwrap();
        assert_eq!(
            report,
            LagReport {
                tenant: 2,
                category: "UNIT".to_string(),
                offset: 1,
                tip: 3,
                pending: 2,
            }
        );
        assert_eq!(report.to_string(), "tenant=2 category=UNIT offset=1 tip=3 pending=2");

        let graph = lag(&config, &log, &offsets, 2, "UNIT_GRAPH").await.unwrap();
        assert_eq!(graph.tenant, config.admin_tenant);
        assert_eq!(graph.tip, 0);

        assert!(lag(&config, &log, &offsets, 2, "NOPE").await.is_err());
    }

    #[test]
    fn test_render_offsets() {
        assert_eq!(render_offsets(&[]), "no offsets stored\n");
        let text = render_offsets(&[OffsetCursor::new(0, "UNIT", 4), OffsetCursor::new(1, "UNIT_GRAPH", 2)]);
        assert_eq!(text, "tenant=0 category=UNIT offset=4\ntenant=1 category=UNIT_GRAPH offset=2\n");
    }
}
