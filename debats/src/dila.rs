//! Facilities for pulling raw debate archives from the DILA open data service.
//!
//! The DILA publishes the verbatim report of every sitting of the Assemblée Nationale as a
//! compressed archive (a `.taz` file). Archives are numbered sequentially within each year, so the
//! whole corpus for a year can be addressed as `AN_{year}001.taz`, `AN_{year}002.taz`, and so on.

use anyhow::Error;
use async_trait::async_trait;
use clap::Args;
use derive_more::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use surf::Url;

mod client;
mod download;

pub use client::Client;
pub use download::{DownloadSummary, Downloader};

/// Where the DILA publishes the debates of the Assemblée Nationale.
pub const DEFAULT_BASE_URL: &str = "https://echanges.dila.gouv.fr/OPENDATA/Debats/AN/";

/// Publication numbers are zero-padded to 3 digits, so there are at most this many per year.
pub const MAX_PUBLICATION_NUMBER: u16 = 999;

/// Download options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Base URL of the DILA debates archive.
    #[clap(long, env = "DEBATS_DILA_URL", default_value = DEFAULT_BASE_URL)]
    pub dila_url: Url,

    /// Directory where raw `.taz` archives are stored, one subdirectory per year.
    #[clap(long, env = "DEBATS_RAW_DIR", default_value = "data/raw")]
    pub raw_dir: PathBuf,

    /// Number of archives published in a given year.
    ///
    /// Years without a known count are probed: archives are downloaded in order until the server
    /// reports one missing.
    #[clap(
        long,
        env = "DEBATS_FILES_PER_YEAR",
        value_name = "YEAR=COUNT",
        value_delimiter = ','
    )]
    pub files_per_year: Vec<YearCount>,
}

impl Options {
    /// Build a downloader fetching from the configured DILA endpoint.
    pub fn downloader(&self, max_workers: usize) -> Result<Downloader<Client>, Error> {
        Ok(Downloader::new(Client::new(self.dila_url.clone())?, &self.raw_dir)
            .with_max_workers(max_workers)
            .with_catalog(self.files_per_year.iter().map(|c| (c.year, c.count))))
    }
}

/// The number of archives published in a year, as given on the command line (`2022=135`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct YearCount {
    pub year: u16,
    pub count: u16,
}

impl FromStr for YearCount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, count) = s
            .split_once('=')
            .ok_or_else(|| Error::msg(format!("expected YEAR=COUNT, got {s:?}")))?;
        let year = year
            .trim()
            .parse()
            .map_err(|err| Error::msg(format!("invalid year in {s:?}: {err}")))?;
        let count: u16 = count
            .trim()
            .parse()
            .map_err(|err| Error::msg(format!("invalid count in {s:?}: {err}")))?;
        if count > MAX_PUBLICATION_NUMBER {
            return Err(Error::msg(format!(
                "at most {MAX_PUBLICATION_NUMBER} archives can be published in a year, got {count}"
            )));
        }
        Ok(Self { year, count })
    }
}

/// A source of raw archives.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Retrieve the archive for `publication`.
    ///
    /// A publication which does not exist (yet) is not an error: it is reported as
    /// [`Fetched::Missing`], so that callers can discover how many publications a year has.
    async fn fetch(&self, publication: Publication) -> Result<Fetched, Error>;
}

/// The result of fetching a single archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fetched {
    Found(Vec<u8>),
    Missing,
}

/// A single published sitting report, identified by year and sequence number.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "AN_{}{:03}", year, number)]
pub struct Publication {
    pub year: u16,
    pub number: u16,
}

impl Publication {
    pub fn new(year: u16, number: u16) -> Self {
        Self { year, number }
    }

    /// The name of the archive, like `AN_2022002.taz`.
    pub fn file_name(&self) -> String {
        format!("{self}.taz")
    }

    /// The path of the archive relative to the DILA base URL.
    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.year, self.file_name())
    }

    /// Where the archive is stored under `raw_dir`.
    pub fn local_path(&self, raw_dir: &Path) -> PathBuf {
        raw_dir.join(self.year.to_string()).join(self.file_name())
    }

    /// Recover the publication from an archive path following the `AN_AAAANNN.taz` convention.
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        let year = digits(stem.get(3..7)?)?;
        let number = digits(stem.get(7..10)?)?;
        Some(Self { year, number })
    }
}

fn digits(s: &str) -> Option<u16> {
    if s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_publication_names() {
        let publication = Publication::new(2022, 2);
        assert_eq!(publication.to_string(), "AN_2022002");
        assert_eq!(publication.file_name(), "AN_2022002.taz");
        assert_eq!(publication.remote_path(), "2022/AN_2022002.taz");
        assert_eq!(
            publication.local_path(Path::new("data/raw")),
            Path::new("data/raw/2022/AN_2022002.taz")
        );
        assert_eq!(Publication::new(2019, 123).to_string(), "AN_2019123");
    }

    #[test]
    fn test_publication_from_path() {
        assert_eq!(
            Publication::from_path(Path::new("data/raw/2022/AN_2022002.taz")),
            Some(Publication::new(2022, 2))
        );
        assert_eq!(
            Publication::from_path(Path::new("AN_2013145.taz")),
            Some(Publication::new(2013, 145))
        );
        assert_eq!(Publication::from_path(Path::new("AN_20220.taz")), None);
        assert_eq!(Publication::from_path(Path::new("AN_2022x02.taz")), None);
        assert_eq!(Publication::from_path(Path::new("notes.taz")), None);
    }

    #[test]
    fn test_year_count() {
        assert_eq!(
            "2022=135".parse::<YearCount>().unwrap(),
            YearCount {
                year: 2022,
                count: 135
            }
        );
        assert_eq!(
            " 2019 = 7".parse::<YearCount>().unwrap(),
            YearCount {
                year: 2019,
                count: 7
            }
        );
        assert!("2022".parse::<YearCount>().is_err());
        assert!("2022=abc".parse::<YearCount>().is_err());
        assert!("2022=1000".parse::<YearCount>().is_err());
    }
}
