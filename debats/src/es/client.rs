//! A client for the Elasticsearch REST API.

use super::{mapping, BulkSummary, ClusterHealth, Filter, IndexStats, SearchIndex, WriteMode};
use crate::transform::Document;
use anyhow::Error;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use surf::{
    http::{Method, Mime, StatusCode},
    Url,
};

/// The error Elasticsearch reports when `create` finds an existing document.
const VERSION_CONFLICT: &str = "version_conflict_engine_exception";

/// An Elasticsearch client bound to a single index.
#[derive(Clone, Debug)]
pub struct Client {
    client: surf::Client,
    index: String,
}

impl Client {
    pub fn new(mut url: Url, index: String) -> Result<Self, Error> {
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }
        let client = surf::Client::try_from(surf::Config::new().set_base_url(url))
            .map_err(|err| Error::msg(format!("unable to configure HTTP client: {err}")))?;
        Ok(Self { client, index })
    }

    fn request(&self, method: Method, path: impl Into<String>) -> Request {
        Request::new(&self.client, method, path.into())
    }

    fn index_path(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.index)
    }

    async fn bulk_chunk(&self, docs: &[Document], mode: WriteMode) -> Result<BulkSummary, Error> {
        let body = bulk_body(&self.index, docs, mode)?;
        let res: BulkResponse = self
            .request(Method::Post, "_bulk")
            .ndjson(body)?
            .send()
            .await?;
        Ok(res.summary())
    }
}

#[async_trait]
impl SearchIndex for Client {
    fn name(&self) -> &str {
        &self.index
    }

    async fn ping(&self) -> Result<(), Error> {
        self.request(Method::Get, "").send::<Value>().await?;
        Ok(())
    }

    async fn index_exists(&self) -> Result<bool, Error> {
        let status = self
            .request(Method::Head, self.index.clone())
            .status()
            .await?;
        match status {
            StatusCode::Ok => Ok(true),
            StatusCode::NotFound => Ok(false),
            status => Err(Error::msg(format!(
                "error {status} checking index {}",
                self.index
            ))),
        }
    }

    async fn create_index(&self) -> Result<(), Error> {
        if self.index_exists().await? {
            tracing::info!("deleting existing index {}", self.index);
            self.request(Method::Delete, self.index.clone())
                .send::<Value>()
                .await?;
        }
        self.request(Method::Put, self.index.clone())
            .json(&mapping())?
            .send::<Value>()
            .await?;
        tracing::info!("created index {}", self.index);
        Ok(())
    }

    async fn bulk_index(
        &self,
        docs: &[Document],
        batch_size: usize,
        mode: WriteMode,
    ) -> Result<BulkSummary, Error> {
        let mut summary = BulkSummary::default();
        for (i, chunk) in docs.chunks(batch_size.max(1)).enumerate() {
            let res = self.bulk_chunk(chunk, mode).await?;
            tracing::debug!(
                batch = i,
                indexed = res.indexed,
                skipped = res.skipped_existing,
                errors = res.errors.len(),
                "bulk request"
            );
            summary.merge(res);
        }
        self.request(Method::Post, self.index_path("_refresh"))
            .send::<Value>()
            .await?;

        for err in summary.errors.iter().take(3) {
            tracing::warn!("indexing error: {err}");
        }
        Ok(summary)
    }

    async fn count(&self, filter: &Filter) -> Result<u64, Error> {
        #[derive(Deserialize)]
        struct CountResponse {
            count: u64,
        }

        let res: CountResponse = self
            .request(Method::Post, self.index_path("_count"))
            .json(&json!({ "query": filter.query() }))?
            .send()
            .await?;
        Ok(res.count)
    }

    async fn cluster_health(&self) -> Result<ClusterHealth, Error> {
        self.request(Method::Get, "_cluster/health").send().await
    }

    async fn index_stats(&self) -> Result<Option<IndexStats>, Error> {
        if !self.index_exists().await? {
            return Ok(None);
        }
        let res: Value = self
            .request(Method::Get, self.index_path("_stats"))
            .send()
            .await?;
        let primaries = &res["_all"]["primaries"];
        let field = |path: &[&str]| {
            path.iter()
                .fold(primaries, |value, key| &value[*key])
                .as_u64()
                .ok_or_else(|| Error::msg(format!("missing {} in index stats", path.join("."))))
        };
        Ok(Some(IndexStats {
            documents_count: field(&["docs", "count"])?,
            documents_deleted: field(&["docs", "deleted"])?,
            size_bytes: field(&["store", "size_in_bytes"])?,
            indexing_total: field(&["indexing", "index_total"])?,
            indexing_time_ms: field(&["indexing", "index_time_in_millis"])?,
        }))
    }

    async fn documents_by_year(&self) -> Result<BTreeMap<i32, u64>, Error> {
        #[derive(Deserialize)]
        struct SearchResponse {
            aggregations: HashMap<String, Aggregation>,
        }
        #[derive(Deserialize)]
        struct Aggregation {
            buckets: Vec<Bucket>,
        }
        #[derive(Deserialize)]
        struct Bucket {
            key: i32,
            doc_count: u64,
        }

        let res: SearchResponse = self
            .request(Method::Post, self.index_path("_search"))
            .json(&json!({
                "size": 0,
                "aggs": {
                    "by_year": { "terms": { "field": "annee", "size": 50 } }
                }
            }))?
            .send()
            .await?;
        Ok(res
            .aggregations
            .into_values()
            .flat_map(|agg| agg.buckets)
            .map(|bucket| (bucket.key, bucket.doc_count))
            .collect())
    }
}

/// Build the NDJSON body of a bulk request writing `docs` to `index`.
fn bulk_body(index: &str, docs: &[Document], mode: WriteMode) -> Result<String, Error> {
    let mut body = String::new();
    for doc in docs {
        // Elasticsearch rejects an empty `_id`, but generates one if it is missing.
        let action = if doc.para_id.is_empty() {
            json!({ mode.action(): { "_index": index } })
        } else {
            json!({ mode.action(): { "_index": index, "_id": doc.para_id } })
        };
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc)?);
        body.push('\n');
    }
    Ok(body)
}

/// Response from the `_bulk` endpoint.
#[derive(Debug, Deserialize)]
struct BulkResponse {
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    error: Option<BulkError>,
}

#[derive(Debug, Deserialize)]
struct BulkError {
    #[serde(rename = "type")]
    kind: String,
    reason: Option<String>,
}

impl BulkResponse {
    fn summary(self) -> BulkSummary {
        let mut summary = BulkSummary::default();
        for item in self.items.into_iter().flat_map(|item| item.into_values()) {
            match item.error {
                None => summary.indexed += 1,
                Some(err) if err.kind == VERSION_CONFLICT => summary.skipped_existing += 1,
                Some(err) => summary.errors.push(format!(
                    "{}: {}: {}",
                    item.id.as_deref().unwrap_or("?"),
                    err.kind,
                    err.reason.as_deref().unwrap_or_default()
                )),
            }
        }
        summary
    }
}

/// A request to the Elasticsearch API.
struct Request {
    builder: surf::RequestBuilder,
    path: String,
}

impl Request {
    fn new(client: &surf::Client, method: Method, path: String) -> Self {
        let builder = match method {
            Method::Head => client.head(&path),
            Method::Put => client.put(&path),
            Method::Post => client.post(&path),
            Method::Delete => client.delete(&path),
            _ => client.get(&path),
        };
        Self { builder, path }
    }

    fn json(mut self, body: &Value) -> Result<Self, Error> {
        self.builder = self.builder.body_json(body).map_err(Error::msg)?;
        Ok(self)
    }

    fn ndjson(mut self, body: String) -> Result<Self, Error> {
        let mime = Mime::from_str("application/x-ndjson").map_err(Error::msg)?;
        self.builder = self.builder.body_string(body).content_type(mime);
        Ok(self)
    }

    async fn status(self) -> Result<StatusCode, Error> {
        tracing::debug!(path = %self.path, "Elasticsearch request");
        let res = self.builder.await.map_err(Error::msg)?;
        Ok(res.status())
    }

    async fn send<T: DeserializeOwned>(self) -> Result<T, Error> {
        tracing::debug!(path = %self.path, "Elasticsearch request");
        let mut res = self.builder.await.map_err(Error::msg)?;
        if !res.status().is_success() {
            let body = res.body_string().await.unwrap_or_default();
            return Err(Error::msg(format!(
                "Elasticsearch error {} on {}: {body}",
                res.status(),
                self.path
            )));
        }
        res.body_json().await.map_err(Error::msg)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::doc;
    use super::*;
    use std::env;

    #[test]
    fn test_bulk_body() {
        let docs = [doc("1", 2022, 3), doc("2", 2022, 3)];
        let body = bulk_body("debats", &docs, WriteMode::KeepExisting).unwrap();
        let lines = body.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action, json!({ "create": { "_index": "debats", "_id": "1" } }));
        let source: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["para_id"], "1");
        assert_eq!(source["annee"], 2022);

        let body = bulk_body("debats", &docs[..1], WriteMode::Replace).unwrap();
        assert!(body.starts_with(r#"{"index":"#));
    }

    #[test]
    fn test_bulk_body_without_para_id() {
        let body = bulk_body("debats", &[doc("", 2022, 3)], WriteMode::Replace).unwrap();
        let action: Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(action, json!({ "index": { "_index": "debats" } }));
    }

    #[test]
    fn test_bulk_response() {
        let res: BulkResponse = serde_json::from_value(json!({
            "took": 3,
            "errors": true,
            "items": [
                { "create": { "_id": "1", "status": 201 } },
                { "create": { "_id": "2", "status": 409, "error": {
                    "type": "version_conflict_engine_exception",
                    "reason": "document already exists",
                } } },
                { "create": { "_id": "3", "status": 400, "error": {
                    "type": "mapper_parsing_exception",
                    "reason": "failed to parse field [annee]",
                } } },
            ]
        }))
        .unwrap();
        assert_eq!(
            res.summary(),
            BulkSummary {
                indexed: 1,
                skipped_existing: 1,
                errors: vec![
                    "3: mapper_parsing_exception: failed to parse field [annee]".into()
                ],
            }
        );
    }

    #[async_std::test]
    async fn test_live_cluster() {
        let Ok(url) = env::var("ES_TESTS") else {
            tracing::warn!("skipping Elasticsearch test since ES_TESTS is not set");
            return;
        };
        let client = Client::new(
            url.parse().unwrap(),
            format!("debats_test_{}", std::process::id()),
        )
        .unwrap();
        client.ping().await.unwrap();
        client.create_index().await.unwrap();
        assert!(client.index_exists().await.unwrap());

        let docs = [doc("1", 2022, 3), doc("2", 2022, 3), doc("3", 2021, 1)];
        let summary = client
            .bulk_index(&docs, 2, WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(summary.indexed, 3);

        let summary = client
            .bulk_index(&docs, 2, WriteMode::KeepExisting)
            .await
            .unwrap();
        assert_eq!(summary.indexed, 0);
        assert_eq!(summary.skipped_existing, 3);

        let filter = Filter {
            annee: Some(2022),
            publication_numero: Some(3),
        };
        assert_eq!(client.count(&filter).await.unwrap(), 2);
        assert_eq!(client.count(&Filter::default()).await.unwrap(), 3);
        assert_eq!(
            client.documents_by_year().await.unwrap(),
            [(2021, 1), (2022, 2)].into_iter().collect()
        );
        assert_eq!(
            client.index_stats().await.unwrap().unwrap().documents_count,
            3
        );

        client
            .request(Method::Delete, client.index.clone())
            .send::<Value>()
            .await
            .unwrap();
    }
}
