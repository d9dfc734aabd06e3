//! Bulk download of raw archives into a local directory.

use super::{Fetch, Fetched, Publication, MAX_PUBLICATION_NUMBER};
use anyhow::{Context, Error};
use async_std::task::spawn_blocking;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Downloads archives into `raw_dir/<year>/`, skipping archives which are already present.
#[derive(Clone, Debug)]
pub struct Downloader<F> {
    fetcher: F,
    raw_dir: PathBuf,
    max_workers: usize,
    catalog: HashMap<u16, u16>,
}

/// What happened to each archive of a download.
#[derive(Clone, Debug, Default)]
pub struct DownloadSummary {
    pub downloaded: Vec<Publication>,
    pub already_present: Vec<Publication>,
    pub missing: Vec<Publication>,
    pub failed: Vec<(Publication, String)>,
}

enum Outcome {
    Downloaded,
    Missing,
    Failed(Error),
}

impl<F: Fetch> Downloader<F> {
    pub fn new(fetcher: F, raw_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            raw_dir: raw_dir.into(),
            max_workers: 5,
            catalog: Default::default(),
        }
    }

    /// Limit the number of archives in flight at any time.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Register the number of archives published in some years.
    pub fn with_catalog(mut self, catalog: impl IntoIterator<Item = (u16, u16)>) -> Self {
        self.catalog.extend(catalog);
        self
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// List the archives of `year` which still need to be downloaded.
    ///
    /// Returns [`None`] if the number of archives in `year` is not known, in which case the year
    /// can only be downloaded by probing.
    pub fn plan_year(&self, year: u16) -> Result<Option<Vec<Publication>>, Error> {
        let Some(&count) = self.catalog.get(&year) else {
            tracing::warn!(year, "no archive count known");
            return Ok(None);
        };
        self.create_year_dir(year)?;
        tracing::info!(year, count, "preparing downloads");

        let mut tasks = vec![];
        for number in 1..=count {
            let publication = Publication::new(year, number);
            if publication.local_path(&self.raw_dir).exists() {
                tracing::debug!("already present: {}", publication.file_name());
            } else {
                tasks.push(publication);
            }
        }
        if tasks.is_empty() {
            tracing::info!(year, "all archives already downloaded");
        } else {
            tracing::info!(year, "{} archives to download", tasks.len());
        }
        Ok(Some(tasks))
    }

    /// Download every archive of `years`.
    ///
    /// All years with a known archive count share a single pool of workers. Years without one are
    /// then probed one after the other. Failures are collected in the summary rather than aborting
    /// the download.
    pub async fn download_years(&self, years: &[u16]) -> Result<DownloadSummary, Error> {
        let mut summary = DownloadSummary::default();
        let mut tasks = vec![];
        let mut probe = vec![];
        for &year in years {
            match self.plan_year(year)? {
                Some(planned) => {
                    let count = self.catalog[&year];
                    summary.already_present.extend(
                        (1..=count)
                            .map(|number| Publication::new(year, number))
                            .filter(|publication| !planned.contains(publication)),
                    );
                    tasks.extend(planned);
                }
                None => probe.push(year),
            }
        }

        if !tasks.is_empty() {
            tracing::info!(
                "starting {} downloads (max {} workers)",
                tasks.len(),
                self.max_workers
            );
            for (publication, outcome) in self.run(tasks).await {
                summary.record(publication, outcome);
            }
        }

        for year in probe {
            self.probe_year(year, &mut summary).await?;
        }

        tracing::info!(
            downloaded = summary.downloaded.len(),
            already_present = summary.already_present.len(),
            missing = summary.missing.len(),
            failed = summary.failed.len(),
            "download finished"
        );
        Ok(summary)
    }

    /// Download the archives of a year whose archive count is unknown.
    ///
    /// Archives are requested in windows of `max_workers` consecutive numbers until a window
    /// contains a missing archive.
    async fn probe_year(&self, year: u16, summary: &mut DownloadSummary) -> Result<(), Error> {
        self.create_year_dir(year)?;
        tracing::info!(year, "probing archives");

        let width = u16::try_from(self.max_workers).unwrap_or(MAX_PUBLICATION_NUMBER);
        let mut next = 1;
        while next <= MAX_PUBLICATION_NUMBER {
            let last = next
                .saturating_add(width - 1)
                .min(MAX_PUBLICATION_NUMBER);
            let mut tasks = vec![];
            for number in next..=last {
                let publication = Publication::new(year, number);
                if publication.local_path(&self.raw_dir).exists() {
                    summary.already_present.push(publication);
                } else {
                    tasks.push(publication);
                }
            }

            let mut exhausted = false;
            for (publication, outcome) in self.run(tasks).await {
                exhausted |= matches!(outcome, Outcome::Missing);
                summary.record(publication, outcome);
            }
            if exhausted {
                break;
            }
            next = last + 1;
        }
        Ok(())
    }

    async fn run(&self, tasks: Vec<Publication>) -> Vec<(Publication, Outcome)> {
        stream::iter(tasks)
            .map(|publication| async move { (publication, self.download(publication).await) })
            .buffer_unordered(self.max_workers)
            .collect()
            .await
    }

    async fn download(&self, publication: Publication) -> Outcome {
        match self.fetcher.fetch(publication).await {
            Ok(Fetched::Found(bytes)) => {
                let path = publication.local_path(&self.raw_dir);
                match spawn_blocking(move || write_atomically(&path, &bytes)).await {
                    Ok(()) => Outcome::Downloaded,
                    Err(err) => Outcome::Failed(err),
                }
            }
            Ok(Fetched::Missing) => Outcome::Missing,
            Err(err) => Outcome::Failed(err),
        }
    }

    fn create_year_dir(&self, year: u16) -> Result<(), Error> {
        let dir = self.raw_dir.join(year.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create directory {}", dir.display()))
    }
}

impl DownloadSummary {
    fn record(&mut self, publication: Publication, outcome: Outcome) {
        match outcome {
            Outcome::Downloaded => {
                tracing::info!("{} downloaded", publication.file_name());
                self.downloaded.push(publication);
            }
            Outcome::Missing => {
                tracing::info!("{} is not published", publication.file_name());
                self.missing.push(publication);
            }
            Outcome::Failed(err) => {
                tracing::error!("unable to download {}: {err:#}", publication.file_name());
                self.failed.push((publication, format!("{err:#}")));
            }
        }
    }
}

/// Write `bytes` to `path` so that `path` only ever exists with its complete contents.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let part = path.with_extension("taz.part");
    fs::write(&part, bytes).with_context(|| format!("unable to write {}", part.display()))?;
    fs::rename(&part, path).with_context(|| format!("unable to rename {}", part.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use async_std::task::sleep;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// A fake DILA serving a fixed set of archives.
    #[derive(Default)]
    struct MockDila {
        published: HashMap<Publication, Vec<u8>>,
        broken: HashSet<Publication>,
        requests: Mutex<Vec<Publication>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockDila {
        fn publish(mut self, year: u16, count: u16) -> Self {
            for number in 1..=count {
                let publication = Publication::new(year, number);
                self.published
                    .insert(publication, publication.to_string().into_bytes());
            }
            self
        }

        fn break_archive(mut self, publication: Publication) -> Self {
            self.broken.insert(publication);
            self
        }

        fn requests(&self) -> Vec<Publication> {
            let mut requests = self.requests.lock().unwrap().clone();
            requests.sort();
            requests
        }
    }

    #[async_trait]
    impl Fetch for MockDila {
        async fn fetch(&self, publication: Publication) -> Result<Fetched, Error> {
            self.requests.lock().unwrap().push(publication);
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.broken.contains(&publication) {
                return Err(Error::msg("error 500"));
            }
            Ok(match self.published.get(&publication) {
                Some(bytes) => Fetched::Found(bytes.clone()),
                None => Fetched::Missing,
            })
        }
    }

    #[test]
    fn test_plan_year() {
        let dir = TempDir::new().unwrap();
        let downloader = Downloader::new(MockDila::default(), dir.path()).with_catalog([(2022, 3)]);

        fs::create_dir_all(dir.path().join("2022")).unwrap();
        fs::write(Publication::new(2022, 2).local_path(dir.path()), b"").unwrap();

        assert_eq!(
            downloader.plan_year(2022).unwrap().unwrap(),
            [Publication::new(2022, 1), Publication::new(2022, 3)]
        );
        assert_eq!(downloader.plan_year(2023).unwrap(), None);
    }

    #[async_std::test]
    async fn test_download_known_years() {
        crate::init_logging();
        let dir = TempDir::new().unwrap();
        let dila = MockDila::default()
            .publish(2021, 4)
            .publish(2022, 3)
            .break_archive(Publication::new(2022, 3));
        let downloader = Downloader::new(dila, dir.path())
            .with_max_workers(2)
            .with_catalog([(2021, 4), (2022, 3)]);

        fs::create_dir_all(dir.path().join("2021")).unwrap();
        fs::write(Publication::new(2021, 1).local_path(dir.path()), b"old").unwrap();

        let summary = downloader.download_years(&[2021, 2022]).await.unwrap();
        let mut downloaded = summary.downloaded.clone();
        downloaded.sort();
        assert_eq!(
            downloaded,
            [
                Publication::new(2021, 2),
                Publication::new(2021, 3),
                Publication::new(2021, 4),
                Publication::new(2022, 1),
                Publication::new(2022, 2),
            ]
        );
        assert_eq!(summary.already_present, [Publication::new(2021, 1)]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, Publication::new(2022, 3));

        // Existing files are neither requested nor overwritten.
        assert!(!downloader
            .fetcher
            .requests()
            .contains(&Publication::new(2021, 1)));
        assert_eq!(
            fs::read(Publication::new(2021, 1).local_path(dir.path())).unwrap(),
            b"old"
        );
        assert_eq!(
            fs::read(Publication::new(2022, 2).local_path(dir.path())).unwrap(),
            b"AN_2022002"
        );

        // A failed download leaves nothing behind.
        let failed = Publication::new(2022, 3).local_path(dir.path());
        assert!(!failed.exists());
        assert!(!failed.with_extension("taz.part").exists());

        assert!(downloader.fetcher.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[async_std::test]
    async fn test_probe_unknown_year() {
        crate::init_logging();
        let dir = TempDir::new().unwrap();
        let downloader =
            Downloader::new(MockDila::default().publish(2019, 3), dir.path()).with_max_workers(2);

        let summary = downloader.download_years(&[2019]).await.unwrap();
        assert_eq!(summary.downloaded.len(), 3);
        assert_eq!(summary.missing, [Publication::new(2019, 4)]);
        assert!(summary.failed.is_empty());

        // Probing stops with the window containing the first missing archive.
        assert_eq!(
            downloader.fetcher.requests(),
            (1..=4)
                .map(|number| Publication::new(2019, number))
                .collect::<Vec<_>>()
        );
        for number in 1..=3 {
            assert!(Publication::new(2019, number)
                .local_path(dir.path())
                .exists());
        }
    }
}
