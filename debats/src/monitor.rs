//! Health and contents of the search index.

use crate::es::{ClusterHealth, IndexStats, SearchIndex};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// A snapshot of the state of the cluster and the index.
///
/// Each part is fetched independently; a part which could not be fetched holds the error message
/// instead.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Status {
    pub timestamp: DateTime<Local>,
    pub index_name: String,
    pub cluster: Result<ClusterHealth, String>,
    /// Statistics of the index, or [`None`] if it does not exist.
    pub index: Result<Option<IndexStats>, String>,
    pub documents_by_year: Result<BTreeMap<i32, u64>, String>,
}

/// Reports on the state of a search index.
pub struct Monitor<'a> {
    index: &'a dyn SearchIndex,
}

impl<'a> Monitor<'a> {
    pub fn new(index: &'a dyn SearchIndex) -> Self {
        Self { index }
    }

    pub async fn status(&self) -> Status {
        let fail = |err: anyhow::Error| format!("{err:#}");
        Status {
            timestamp: Local::now(),
            index_name: self.index.name().to_string(),
            cluster: self.index.cluster_health().await.map_err(fail),
            index: self.index.index_stats().await.map_err(fail),
            documents_by_year: self.index.documents_by_year().await.map_err(fail),
        }
    }
}

fn status_indicator(status: &str) -> &'static str {
    match status {
        "green" => "🟢",
        "yellow" => "🟡",
        "red" => "🔴",
        _ => "❓",
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "Elasticsearch status at {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"))?;

        writeln!(f, "Cluster:")?;
        match &self.cluster {
            Ok(health) => {
                writeln!(
                    f,
                    "  status: {} {}",
                    status_indicator(&health.status),
                    health.status
                )?;
                writeln!(f, "  nodes: {}", health.number_of_nodes)?;
                writeln!(f, "  active shards: {}", health.active_shards)?;
            }
            Err(err) => writeln!(f, "  ❌ {err}")?,
        }

        writeln!(f, "Index {}:", self.index_name)?;
        match &self.index {
            Ok(Some(stats)) => {
                writeln!(f, "  documents: {}", stats.documents_count)?;
                writeln!(f, "  size: {:.1} MB", stats.size_mb())?;
            }
            Ok(None) => writeln!(f, "  ⚠️  index not found")?,
            Err(err) => writeln!(f, "  ❌ {err}")?,
        }

        writeln!(f, "Documents per year:")?;
        match &self.documents_by_year {
            Ok(by_year) if by_year.is_empty() => writeln!(f, "  none")?,
            Ok(by_year) => {
                for (year, count) in by_year {
                    writeln!(f, "  {year}: {count} documents")?;
                }
            }
            Err(err) => writeln!(f, "  ⚠️  unavailable: {err}")?,
        }
        Ok(())
    }
}
