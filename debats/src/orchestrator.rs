//! The complete pipeline: download, transform and index.

use crate::{
    batch::{BatchOptions, BatchRunner},
    dila::{self, DownloadSummary, Downloader, Fetch},
    es::{BulkSummary, Filter, SearchIndex, WriteMode, DEFAULT_BATCH_SIZE},
    monitor::{Monitor, Status},
    report::RunReport,
    transform::{Document, Transformer},
};
use anyhow::Error;
use async_std::task::spawn_blocking;
use derive_more::Display;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// The size of the index.
#[derive(Clone, Debug, Display, PartialEq, Eq, Serialize)]
#[display(fmt = "index {}: {} documents", index_name, document_count)]
pub struct Stats {
    pub index_name: String,
    pub document_count: u64,
}

/// Runs the stages of the pipeline, alone or chained.
///
/// The search index is optional: everything except loading and monitoring works without one.
pub struct Orchestrator<F = dila::Client> {
    downloader: Downloader<F>,
    transformer: Transformer,
    index: Option<Box<dyn SearchIndex>>,
    report: Option<PathBuf>,
}

impl<F: Fetch + Clone> Orchestrator<F> {
    pub fn new(
        downloader: Downloader<F>,
        transformer: Transformer,
        index: Option<Box<dyn SearchIndex>>,
    ) -> Self {
        Self {
            downloader,
            transformer,
            index,
            report: None,
        }
    }

    /// Append the report of each batch run to the file at `path`.
    pub fn with_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.report = Some(path.into());
        self
    }

    fn index(&self) -> Result<&dyn SearchIndex, Error> {
        self.index
            .as_deref()
            .ok_or_else(|| Error::msg("not connected to Elasticsearch"))
    }

    /// Create the index if it does not exist, or unconditionally if `recreate` is set.
    ///
    /// Recreating the index deletes all the documents in it.
    pub async fn setup_index(&self, recreate: bool) -> Result<(), Error> {
        let index = self.index()?;
        if !recreate && index.index_exists().await? {
            tracing::info!("index {} already exists", index.name());
            return Ok(());
        }
        index.create_index().await
    }

    /// Download the archives of `years`, with at most `max_workers` downloads at once.
    pub async fn extract(
        &self,
        years: &[u16],
        max_workers: usize,
    ) -> Result<DownloadSummary, Error> {
        tracing::info!(?years, max_workers, "extract");
        self.downloader
            .clone()
            .with_max_workers(max_workers)
            .download_years(years)
            .await
    }

    /// Extract the documents from a single archive.
    pub async fn transform_file(&self, path: &Path, append: bool) -> Result<Vec<Document>, Error> {
        let transformer = self.transformer.clone();
        let path = path.to_path_buf();
        spawn_blocking(move || transformer.process_taz_file(&path, append)).await
    }

    /// Extract the documents from all the archives in `dir`.
    pub async fn transform_directory(
        &self,
        dir: &Path,
        append: bool,
    ) -> Result<Vec<Document>, Error> {
        let transformer = self.transformer.clone();
        let dir = dir.to_path_buf();
        spawn_blocking(move || transformer.process_directory(&dir, append)).await
    }

    /// Extract the documents from all the downloaded archives of `year`.
    pub async fn transform_year(&self, year: u16, append: bool) -> Result<Vec<Document>, Error> {
        let dir = self.downloader.raw_dir().join(year.to_string());
        self.transform_directory(&dir, append).await
    }

    /// Index `docs`.
    pub async fn load(
        &self,
        docs: &[Document],
        batch_size: usize,
        mode: WriteMode,
    ) -> Result<BulkSummary, Error> {
        if docs.is_empty() {
            tracing::warn!("no documents to load");
            return Ok(Default::default());
        }
        let index = self.index()?;
        tracing::info!("indexing {} documents into {}", docs.len(), index.name());
        let summary = index.bulk_index(docs, batch_size, mode).await?;
        tracing::info!(
            indexed = summary.indexed,
            skipped_existing = summary.skipped_existing,
            errors = summary.errors.len(),
            "load finished"
        );
        Ok(summary)
    }

    /// Transform a single archive, and index its documents if `index` is set.
    pub async fn run_etl_file(
        &self,
        path: &Path,
        index: bool,
        mode: WriteMode,
    ) -> Result<Vec<Document>, Error> {
        tracing::info!("ETL for {}", path.display());
        let docs = self.transform_file(path, false).await?;
        if index && !docs.is_empty() {
            self.load(&docs, DEFAULT_BATCH_SIZE, mode).await?;
        }
        Ok(docs)
    }

    /// Run the pipeline on a year, downloading its archives first if `download` is set.
    pub async fn run_etl_year(
        &self,
        year: u16,
        download: bool,
        index: bool,
    ) -> Result<Vec<Document>, Error> {
        self.run_etl_years(&[year], download, index).await
    }

    /// Run the pipeline on several years, one after the other.
    ///
    /// When `download` is set, all years are downloaded before any is transformed.
    pub async fn run_etl_years(
        &self,
        years: &[u16],
        download: bool,
        index: bool,
    ) -> Result<Vec<Document>, Error> {
        tracing::info!(?years, download, index, "ETL");
        if download {
            self.extract(years, self.downloader.max_workers()).await?;
        }

        let mut all = vec![];
        for &year in years {
            tracing::info!(year, "transforming");
            let docs = self.transform_year(year, true).await?;
            if index && !docs.is_empty() {
                self.load(&docs, DEFAULT_BATCH_SIZE, WriteMode::Replace)
                    .await?;
            }
            all.extend(docs);
        }
        tracing::info!("ETL finished: {} documents", all.len());
        Ok(all)
    }

    /// Process the raw directory in bulk, downloading the archives of `options.years` first if
    /// `download` is set.
    pub async fn run_batch(
        &self,
        download: bool,
        options: &BatchOptions,
    ) -> Result<RunReport, Error> {
        if download {
            if options.years.is_empty() {
                tracing::warn!("no years given, skipping download");
            } else {
                let years = options
                    .years
                    .iter()
                    .map(|&year| {
                        u16::try_from(year).map_err(|_| Error::msg(format!("invalid year {year}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.extract(&years, options.max_workers).await?;
            }
        }

        let index = if options.index {
            Some(self.index()?)
        } else {
            None
        };
        let mut runner = BatchRunner::new(self.transformer.clone(), index);
        if let Some(path) = &self.report {
            runner = runner.with_report(path);
        }
        runner.run(self.downloader.raw_dir(), options).await
    }

    pub async fn stats(&self) -> Result<Stats, Error> {
        let index = self.index()?;
        Ok(Stats {
            index_name: index.name().to_string(),
            document_count: index.count(&Filter::default()).await?,
        })
    }

    pub async fn status(&self) -> Result<Status, Error> {
        Ok(Monitor::new(self.index()?).status().await)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        dila::{Fetched, Publication},
        es::MockIndex,
        transform::{archive::test::taz, test::REPORT},
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Serves a fixed set of archives.
    #[derive(Clone, Default)]
    struct Archives(Arc<HashMap<Publication, Vec<u8>>>);

    #[async_trait]
    impl Fetch for Archives {
        async fn fetch(&self, publication: Publication) -> Result<Fetched, Error> {
            Ok(match self.0.get(&publication) {
                Some(bytes) => Fetched::Found(bytes.clone()),
                None => Fetched::Missing,
            })
        }
    }

    fn archives() -> Archives {
        let mut archives = HashMap::new();
        archives.insert(
            Publication::new(2022, 2),
            taz("AN_2022002/CRI_20220002.xml", REPORT.as_bytes()),
        );
        Archives(Arc::new(archives))
    }

    fn orchestrator(
        dir: &TempDir,
        index: Option<Box<dyn SearchIndex>>,
    ) -> Orchestrator<Archives> {
        Orchestrator::new(
            Downloader::new(archives(), dir.path().join("raw")).with_catalog([(2022, 2)]),
            Transformer::new(dir.path().join("transformed")),
            index,
        )
        .with_report(dir.path().join("report.json"))
    }

    #[async_std::test]
    async fn test_without_index() {
        crate::init_logging();
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, None);

        let docs = orchestrator.run_etl_year(2022, true, false).await.unwrap();
        assert_eq!(docs.len(), 3);
        assert!(dir.path().join("raw/2022/AN_2022002.taz").exists());
        assert!(dir.path().join("transformed/2022/2022-01-04.json").exists());

        // Nothing to load is fine, but loading something needs a connection.
        assert_eq!(
            orchestrator.load(&[], 500, WriteMode::Replace).await.unwrap(),
            BulkSummary::default()
        );
        assert!(orchestrator
            .load(&docs, 500, WriteMode::Replace)
            .await
            .is_err());
        assert!(orchestrator.stats().await.is_err());
        assert!(orchestrator.setup_index(false).await.is_err());

        let report = orchestrator
            .run_batch(
                false,
                &BatchOptions {
                    index: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.statistics.success, 1);
    }

    #[async_std::test]
    async fn test_etl_file() {
        crate::init_logging();
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, Some(Box::new(MockIndex::new("debats"))));
        orchestrator.setup_index(true).await.unwrap();

        let summary = orchestrator.extract(&[2022], 1).await.unwrap();
        assert_eq!(summary.downloaded, [Publication::new(2022, 2)]);
        assert_eq!(summary.missing, [Publication::new(2022, 1)]);

        let path = dir.path().join("raw/2022/AN_2022002.taz");
        let docs = orchestrator
            .run_etl_file(&path, true, WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(
            orchestrator.stats().await.unwrap(),
            Stats {
                index_name: "debats".into(),
                document_count: 3,
            }
        );
        assert_eq!(
            orchestrator.stats().await.unwrap().to_string(),
            "index debats: 3 documents"
        );

        let status = orchestrator.status().await.unwrap();
        assert_eq!(status.documents_by_year, Ok([(2022, 3)].into_iter().collect()));
    }

    #[async_std::test]
    async fn test_setup_index() {
        crate::init_logging();
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, Some(Box::new(MockIndex::new("debats"))));
        orchestrator.run_etl_year(2022, true, true).await.unwrap();
        assert_eq!(orchestrator.stats().await.unwrap().document_count, 3);

        // An existing index is kept unless it is recreated.
        orchestrator.setup_index(false).await.unwrap();
        assert_eq!(orchestrator.stats().await.unwrap().document_count, 3);
        orchestrator.setup_index(true).await.unwrap();
        assert_eq!(orchestrator.stats().await.unwrap().document_count, 0);
    }

    #[async_std::test]
    async fn test_batch_with_download() {
        crate::init_logging();
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, Some(Box::new(MockIndex::new("debats"))));

        let options = BatchOptions {
            parallel: true,
            max_workers: 4,
            years: vec![2022],
            ..Default::default()
        };
        let report = orchestrator.run_batch(true, &options).await.unwrap();
        assert_eq!(report.statistics.success, 1);
        assert_eq!(report.statistics.documents_indexed, 3);
        assert!(dir.path().join("report.json").exists());

        // Already downloaded and indexed: nothing left to do.
        let report = orchestrator.run_batch(true, &options).await.unwrap();
        assert_eq!(report.statistics.skipped, 1);
        assert_eq!(orchestrator.stats().await.unwrap().document_count, 3);

        let options = BatchOptions {
            years: vec![-1],
            ..options
        };
        assert!(orchestrator.run_batch(true, &options).await.is_err());
    }
}
