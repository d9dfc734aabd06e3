//! Bulk processing of a whole tree of raw archives.

use crate::{
    dila::Publication,
    es::{Filter, SearchIndex, WriteMode, DEFAULT_BATCH_SIZE},
    report::{FileOutcome, FileStatus, RunReport},
    transform::Transformer,
};
use anyhow::{Context, Error};
use async_std::task::spawn_blocking;
use chrono::Local;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// How to run a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchOptions {
    /// Process several archives at once.
    pub parallel: bool,
    /// Maximum number of archives processed at once, when `parallel` is set.
    pub max_workers: usize,
    /// Skip archives whose publication already has documents in the index.
    pub skip_existing: bool,
    /// Only process these years (all years if empty), in this order.
    pub years: Vec<i32>,
    /// Index the extracted documents.
    pub index: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            max_workers: 3,
            skip_existing: true,
            years: vec![],
            index: true,
        }
    }
}

/// The archives of one year, as shown by a dry run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YearPlan {
    pub year: Option<i32>,
    pub files: usize,
    /// The names of the first few archives.
    pub sample: Vec<String>,
}

/// Transforms and indexes every archive under a directory.
pub struct BatchRunner<'a> {
    transformer: Transformer,
    index: Option<&'a dyn SearchIndex>,
    report: Option<PathBuf>,
}

impl<'a> BatchRunner<'a> {
    /// A runner indexing into `index`, if any.
    ///
    /// Without an index, runs with [`BatchOptions::index`] set fail on every archive, and nothing
    /// is ever considered already indexed.
    pub fn new(transformer: Transformer, index: Option<&'a dyn SearchIndex>) -> Self {
        Self {
            transformer,
            index,
            report: None,
        }
    }

    /// Append the report of each run to the file at `path`.
    pub fn with_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.report = Some(path.into());
        self
    }

    /// Process all the archives under `base`.
    pub async fn run(&self, base: &Path, options: &BatchOptions) -> Result<RunReport, Error> {
        let mut report = RunReport::new(Local::now());
        tracing::info!("looking for archives in {}", base.display());

        let files = find_taz_files(base)?;
        if files.is_empty() {
            tracing::warn!("no .taz files found in {}", base.display());
            return Ok(report);
        }
        tracing::info!("{} archives found", files.len());

        let mut by_year = group_by_year(&files);
        for (year, files) in &by_year {
            tracing::info!("{}: {} files", year_label(*year), files.len());
        }

        let files = if options.years.is_empty() {
            files
        } else {
            let files = options
                .years
                .iter()
                .flat_map(|year| by_year.remove(&Some(*year)).unwrap_or_default())
                .collect::<Vec<_>>();
            tracing::info!("{} files for years {:?}", files.len(), options.years);
            files
        };
        if files.is_empty() {
            tracing::warn!("no files left to process");
            return Ok(report);
        }

        let total = files.len();
        if options.parallel {
            let workers = options.max_workers.max(1);
            tracing::info!("processing {total} files with {workers} workers");
            let mut outcomes = stream::iter(&files)
                .map(|file| self.process_file(file, options))
                .buffer_unordered(workers);
            while let Some(outcome) = outcomes.next().await {
                record(&mut report, outcome, total);
            }
        } else {
            tracing::info!("processing {total} files sequentially");
            for file in &files {
                let outcome = self.process_file(file, options).await;
                record(&mut report, outcome, total);
            }
        }

        report.finish(Local::now());
        report.log_summary();
        if let Some(path) = &self.report {
            report.append_to(path)?;
        }
        Ok(report)
    }

    /// Transform and index a single archive.
    ///
    /// Failures are reported in the outcome rather than returned, so that one bad archive does not
    /// stop a batch.
    pub async fn process_file(&self, file: &Path, options: &BatchOptions) -> FileOutcome {
        let start = Instant::now();
        let year = year_of(file);

        if options.skip_existing {
            if let Some(index) = self.index {
                if is_already_indexed(index, file).await {
                    tracing::debug!("{} already indexed", file.display());
                    return FileOutcome::skipped(file.to_path_buf(), year);
                }
            }
        }

        match self.transform_and_load(file, options.index).await {
            Ok(0) => FileOutcome::failed(
                file.to_path_buf(),
                year,
                "no documents extracted".into(),
                start.elapsed(),
            ),
            Ok(documents) => {
                FileOutcome::success(file.to_path_buf(), year, documents, start.elapsed())
            }
            Err(err) => {
                FileOutcome::failed(file.to_path_buf(), year, format!("{err:#}"), start.elapsed())
            }
        }
    }

    async fn transform_and_load(&self, file: &Path, index: bool) -> Result<usize, Error> {
        let transformer = self.transformer.clone();
        let path = file.to_path_buf();
        let docs = spawn_blocking(move || transformer.process_taz_file(&path, false)).await?;
        if docs.is_empty() || !index {
            return Ok(docs.len());
        }

        let es = self
            .index
            .ok_or_else(|| Error::msg("indexing requested without an Elasticsearch connection"))?;
        let summary = es
            .bulk_index(&docs, DEFAULT_BATCH_SIZE, WriteMode::KeepExisting)
            .await?;
        if !summary.errors.is_empty() {
            tracing::warn!(
                "{}: {} documents could not be indexed",
                file.display(),
                summary.errors.len()
            );
        }
        Ok(docs.len())
    }
}

fn record(report: &mut RunReport, outcome: FileOutcome, total: usize) {
    let name = outcome
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match outcome.status {
        FileStatus::Failed => tracing::warn!(
            "{name} failed: {}",
            outcome.error.as_deref().unwrap_or_default()
        ),
        status => tracing::debug!("{name}: {status}, {} documents", outcome.documents),
    }
    report.record(outcome);

    let stats = &report.statistics;
    tracing::info!(
        "[{}/{total}] {} succeeded, {} failed, {} skipped",
        stats.total,
        stats.success,
        stats.failed,
        stats.skipped
    );
}

/// Find all the `.taz` archives under `base`, recursively, sorted by path.
pub fn find_taz_files(base: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = vec![];
    if base.is_dir() {
        collect_taz_files(base, &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn collect_taz_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in fs::read_dir(dir).with_context(|| format!("unable to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_taz_files(&path, files)?;
        } else if path.extension().map_or(false, |ext| ext == "taz") {
            files.push(path);
        }
    }
    Ok(())
}

/// The year of the debates in an archive, judging from its path.
///
/// A directory named after a year takes precedence over the `AN_AAAANNN` file name.
pub fn year_of(path: &Path) -> Option<i32> {
    let is_year = |s: &str| s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit());
    for part in path.components() {
        if let Some(part) = part.as_os_str().to_str().filter(|part| is_year(*part)) {
            return part.parse().ok();
        }
    }

    let stem = path.file_stem()?.to_str()?;
    if stem.len() < 9 {
        return None;
    }
    stem.get(3..7).filter(|year| is_year(*year))?.parse().ok()
}

/// Group archives by [year](year_of), keeping them in order within each year.
pub fn group_by_year(files: &[PathBuf]) -> BTreeMap<Option<i32>, Vec<PathBuf>> {
    let mut by_year = BTreeMap::<_, Vec<_>>::new();
    for file in files {
        by_year.entry(year_of(file)).or_default().push(file.clone());
    }
    by_year
}

pub fn year_label(year: Option<i32>) -> String {
    year.map(|year| year.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Whether the publication in `file` already has documents in `index`.
///
/// Files not named after a publication, and errors from the index, count as not indexed.
pub async fn is_already_indexed(index: &dyn SearchIndex, file: &Path) -> bool {
    let Some(publication) = Publication::from_path(file) else {
        return false;
    };
    let filter = Filter {
        annee: Some(publication.year.into()),
        publication_numero: Some(publication.number.into()),
    };
    match index.count(&filter).await {
        Ok(count) => count > 0,
        Err(err) => {
            tracing::debug!("unable to check whether {publication} is indexed: {err:#}");
            false
        }
    }
}

/// Describe what a batch over `base` would process, without processing anything.
pub fn plan(base: &Path, years: &[i32]) -> Result<Vec<YearPlan>, Error> {
    let files = find_taz_files(base)?;
    Ok(group_by_year(&files)
        .into_iter()
        .filter(|(year, _)| {
            years.is_empty() || year.map_or(false, |year| years.contains(&year))
        })
        .map(|(year, files)| YearPlan {
            year,
            files: files.len(),
            sample: files
                .iter()
                .take(3)
                .filter_map(|file| file.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
        })
        .collect())
}
