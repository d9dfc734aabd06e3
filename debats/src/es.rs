//! The Elasticsearch index holding the transformed debates.

use crate::transform::Document;
use anyhow::Error;
use async_trait::async_trait;
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use surf::Url;

mod client;
#[cfg(any(test, feature = "testing"))]
mod mock;

pub use client::Client;
#[cfg(any(test, feature = "testing"))]
pub use mock::MockIndex;

/// The index used unless another one is configured.
pub const DEFAULT_INDEX: &str = "debats_assemblee_nationale";

/// Number of documents sent in each bulk request by default.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Elasticsearch connection options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// URL of the Elasticsearch cluster.
    #[clap(long, env = "DEBATS_ES_URL", default_value = "http://localhost:9200")]
    pub es_url: Url,

    /// Name of the index holding the debates.
    #[clap(long, env = "DEBATS_ES_INDEX", default_value = DEFAULT_INDEX)]
    pub es_index: String,
}

impl Options {
    /// Connect to the cluster, failing if it does not respond.
    pub async fn connect(&self) -> Result<Client, Error> {
        let client = Client::new(self.es_url.clone(), self.es_index.clone())?;
        client.ping().await.map_err(|err| {
            Error::msg(format!(
                "unable to reach Elasticsearch at {}: {err:#}",
                self.es_url
            ))
        })?;
        tracing::info!("connected to Elasticsearch at {}", self.es_url);
        Ok(client)
    }
}

/// A search index for debate documents.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// The name of the index.
    fn name(&self) -> &str;

    /// Check that the cluster is reachable.
    async fn ping(&self) -> Result<(), Error>;

    async fn index_exists(&self) -> Result<bool, Error>;

    /// Create the index with the debate [`mapping`], dropping it first if it already exists.
    async fn create_index(&self) -> Result<(), Error>;

    /// Index `docs` in batches of `batch_size`, then make them visible to searches.
    ///
    /// Documents are identified by their paragraph ID, so indexing the same paragraph twice never
    /// duplicates it.
    async fn bulk_index(
        &self,
        docs: &[Document],
        batch_size: usize,
        mode: WriteMode,
    ) -> Result<BulkSummary, Error>;

    /// Count the documents matching `filter`.
    async fn count(&self, filter: &Filter) -> Result<u64, Error>;

    async fn cluster_health(&self) -> Result<ClusterHealth, Error>;

    /// Statistics about the index, or [`None`] if it does not exist.
    async fn index_stats(&self) -> Result<Option<IndexStats>, Error>;

    /// The number of documents for each year of debates.
    async fn documents_by_year(&self) -> Result<BTreeMap<i32, u64>, Error>;
}

/// What to do with documents which are already in the index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite existing documents.
    #[default]
    Replace,
    /// Leave existing documents untouched.
    KeepExisting,
}

impl WriteMode {
    /// The bulk API action implementing this mode.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Replace => "index",
            Self::KeepExisting => "create",
        }
    }
}

/// The outcome of a bulk indexing request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub indexed: usize,
    /// Documents left alone because they were already indexed (only in [`WriteMode::KeepExisting`]).
    pub skipped_existing: usize,
    pub errors: Vec<String>,
}

impl BulkSummary {
    pub fn merge(&mut self, other: BulkSummary) {
        self.indexed += other.indexed;
        self.skipped_existing += other.skipped_existing;
        self.errors.extend(other.errors);
    }
}

/// Restrict a count to some sitting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub annee: Option<i32>,
    pub publication_numero: Option<u32>,
}

impl Filter {
    /// The query selecting the documents matching this filter.
    pub fn query(&self) -> Value {
        let mut terms = vec![];
        if let Some(annee) = self.annee {
            terms.push(json!({ "term": { "annee": annee } }));
        }
        if let Some(numero) = self.publication_numero {
            terms.push(json!({ "term": { "publication_numero": numero } }));
        }
        if terms.is_empty() {
            json!({ "match_all": {} })
        } else {
            json!({ "bool": { "filter": terms } })
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.annee.map_or(true, |annee| doc.metadata.annee == Some(annee))
            && self
                .publication_numero
                .map_or(true, |numero| doc.metadata.publication_numero == Some(numero))
    }
}

/// The health of the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterHealth {
    /// `green`, `yellow` or `red`.
    pub status: String,
    pub number_of_nodes: u64,
    pub active_shards: u64,
    pub relocating_shards: u64,
    pub unassigned_shards: u64,
}

/// Statistics about the primary shards of the index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexStats {
    pub documents_count: u64,
    pub documents_deleted: u64,
    pub size_bytes: u64,
    pub indexing_total: u64,
    pub indexing_time_ms: u64,
}

impl IndexStats {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1e6
    }
}

/// Settings and mappings of the debates index.
///
/// Text fields are analyzed in French; the ones we also sort or aggregate on get a `keyword`
/// sub-field.
pub fn mapping() -> Value {
    let french = json!({ "type": "text", "analyzer": "french" });
    let french_with_keyword = json!({
        "type": "text",
        "analyzer": "french",
        "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } },
    });
    let date = json!({ "type": "date", "format": "yyyy-MM-dd" });
    let integer = json!({ "type": "integer" });
    let keyword = json!({ "type": "keyword" });

    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0,
            "analysis": {
                "analyzer": {
                    "french": { "type": "french" }
                }
            }
        },
        "mappings": {
            "properties": {
                "date_seance": date,
                "date_parution": date,
                "annee": integer,
                "mois": integer,
                "legislature": integer,
                "session_nom": keyword,
                "session_parlementaire": keyword,
                "seance_numero": keyword,
                "publication_numero": integer,
                "numero_premiere_page": integer,
                "document_id": keyword,
                "section_id": keyword,
                "para_id": keyword,
                "texte": french_with_keyword,
                "orateur_nom": french_with_keyword,
                "orateur_fonction": keyword,
                "section_titre": french_with_keyword,
                "sous_section_titre": french,
                "niveau_section": integer,
                "vote_present": { "type": "boolean" },
                "vote": {
                    "properties": {
                        "nombre_votants": integer,
                        "nombre_suffrages_exprimes": integer,
                        "votes_pour": integer,
                        "votes_contre": integer,
                    }
                },
                "mots_cles_insecurite": keyword,
                "sentiment": keyword,
                "polarite": { "type": "float" },
                "folio": integer,
                "extraction_timestamp": { "type": "date" },
            }
        }
    })
}
