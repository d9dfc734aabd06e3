//! An in-memory search index, for tests.

use super::{BulkSummary, ClusterHealth, Filter, IndexStats, SearchIndex, WriteMode};
use crate::transform::Document;
use anyhow::Error;
use async_std::sync::Mutex;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A search index which keeps its documents in memory.
#[derive(Debug, Default)]
pub struct MockIndex {
    name: String,
    offline: bool,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    exists: bool,
    docs: BTreeMap<String, Document>,
    bulk_requests: usize,
}

impl MockIndex {
    /// An empty index which already exists.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            offline: false,
            state: Mutex::new(State {
                exists: true,
                ..Default::default()
            }),
        }
    }

    /// An index whose cluster cannot be reached: every request fails.
    pub fn offline(name: impl Into<String>) -> Self {
        Self {
            offline: true,
            ..Self::new(name)
        }
    }

    /// The indexed documents, ordered by paragraph ID.
    pub async fn documents(&self) -> Vec<Document> {
        self.state.lock().await.docs.values().cloned().collect()
    }

    /// The number of bulk requests received so far.
    pub async fn bulk_requests(&self) -> usize {
        self.state.lock().await.bulk_requests
    }

    fn check_online(&self) -> Result<(), Error> {
        if self.offline {
            Err(Error::msg("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SearchIndex for MockIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), Error> {
        self.check_online()
    }

    async fn index_exists(&self) -> Result<bool, Error> {
        self.check_online()?;
        Ok(self.state.lock().await.exists)
    }

    async fn create_index(&self) -> Result<(), Error> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        state.exists = true;
        state.docs.clear();
        Ok(())
    }

    async fn bulk_index(
        &self,
        docs: &[Document],
        batch_size: usize,
        mode: WriteMode,
    ) -> Result<BulkSummary, Error> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        state.exists = true;
        let mut summary = BulkSummary::default();
        for chunk in docs.chunks(batch_size.max(1)) {
            state.bulk_requests += 1;
            for doc in chunk {
                // Like Elasticsearch, generate an id for documents without one.
                let id = if doc.para_id.is_empty() {
                    format!("auto-{}", state.docs.len())
                } else {
                    doc.para_id.clone()
                };
                if mode == WriteMode::KeepExisting && state.docs.contains_key(&id) {
                    summary.skipped_existing += 1;
                } else {
                    state.docs.insert(id, doc.clone());
                    summary.indexed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn count(&self, filter: &Filter) -> Result<u64, Error> {
        self.check_online()?;
        let state = self.state.lock().await;
        if !state.exists {
            return Err(Error::msg(format!("no such index [{}]", self.name)));
        }
        Ok(state.docs.values().filter(|doc| filter.matches(doc)).count() as u64)
    }

    async fn cluster_health(&self) -> Result<ClusterHealth, Error> {
        self.check_online()?;
        Ok(ClusterHealth {
            status: "green".into(),
            number_of_nodes: 1,
            active_shards: 1,
            ..Default::default()
        })
    }

    async fn index_stats(&self) -> Result<Option<IndexStats>, Error> {
        self.check_online()?;
        let state = self.state.lock().await;
        if !state.exists {
            return Ok(None);
        }
        let size_bytes = state
            .docs
            .values()
            .map(|doc| doc.texte.len() as u64)
            .sum();
        Ok(Some(IndexStats {
            documents_count: state.docs.len() as u64,
            size_bytes,
            ..Default::default()
        }))
    }

    async fn documents_by_year(&self) -> Result<BTreeMap<i32, u64>, Error> {
        self.check_online()?;
        let mut by_year = BTreeMap::new();
        for doc in self.state.lock().await.docs.values() {
            if let Some(annee) = doc.metadata.annee {
                *by_year.entry(annee).or_default() += 1;
            }
        }
        Ok(by_year)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::doc;
    use super::*;

    #[async_std::test]
    async fn test_write_modes() {
        let index = MockIndex::new("debats");
        let docs = [doc("1", 2022, 3), doc("2", 2022, 3), doc("3", 2021, 1)];

        let summary = index
            .bulk_index(&docs, 2, WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(summary.indexed, 3);
        assert_eq!(index.bulk_requests().await, 2);

        let mut updated = doc("1", 2022, 3);
        updated.texte = "modifié".into();
        let summary = index
            .bulk_index(&[updated.clone(), doc("4", 2022, 4)], 500, WriteMode::KeepExisting)
            .await
            .unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(index.documents().await[0].texte, "paragraphe 1");

        index
            .bulk_index(&[updated], 500, WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(index.documents().await[0].texte, "modifié");

        assert_eq!(
            index
                .count(&Filter {
                    annee: Some(2022),
                    publication_numero: None
                })
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            index.documents_by_year().await.unwrap(),
            [(2021, 1), (2022, 3)].into_iter().collect()
        );

        index.create_index().await.unwrap();
        assert_eq!(index.count(&Filter::default()).await.unwrap(), 0);
    }

    #[async_std::test]
    async fn test_documents_without_id() {
        let index = MockIndex::new("debats");
        let docs = [doc("", 2022, 3), doc("", 2022, 3)];
        let summary = index
            .bulk_index(&docs, 500, WriteMode::KeepExisting)
            .await
            .unwrap();
        assert_eq!(summary.indexed, 2);
        assert_eq!(index.count(&Filter::default()).await.unwrap(), 2);
    }

    #[async_std::test]
    async fn test_offline() {
        let index = MockIndex::offline("debats");
        assert!(index.ping().await.is_err());
        assert!(index.count(&Filter::default()).await.is_err());
        assert!(index.cluster_health().await.is_err());
    }
}
