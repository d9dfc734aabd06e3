//! Reports of batch runs.

use anyhow::{Context, Error};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::Display;

/// The report file used unless another one is configured.
pub const DEFAULT_REPORT: &str = "batch_load_report.json";

/// How processing a single archive ended.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileStatus {
    Success,
    Failed,
    /// The archive was already indexed.
    Skipped,
}

/// The result of processing a single archive.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FileOutcome {
    pub file: PathBuf,
    pub year: Option<i32>,
    pub status: FileStatus,
    pub documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_seconds: f64,
}

impl FileOutcome {
    pub fn success(file: PathBuf, year: Option<i32>, documents: usize, duration: Duration) -> Self {
        Self {
            file,
            year,
            status: FileStatus::Success,
            documents,
            error: None,
            duration_seconds: duration.as_secs_f64(),
        }
    }

    pub fn failed(file: PathBuf, year: Option<i32>, error: String, duration: Duration) -> Self {
        Self {
            file,
            year,
            status: FileStatus::Failed,
            documents: 0,
            error: Some(error),
            duration_seconds: duration.as_secs_f64(),
        }
    }

    pub fn skipped(file: PathBuf, year: Option<i32>) -> Self {
        Self {
            file,
            year,
            status: FileStatus::Skipped,
            documents: 0,
            error: None,
            duration_seconds: 0.,
        }
    }
}

/// Counters over all the archives of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Statistics {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub documents_indexed: usize,
}

impl Statistics {
    /// `count` as a percentage of the total number of archives.
    pub fn percent(&self, count: usize) -> f64 {
        count as f64 * 100. / self.total.max(1) as f64
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileError {
    pub file: PathBuf,
    pub error: String,
}

/// The report of a batch run.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunReport {
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration_seconds: f64,
    pub statistics: Statistics,
    pub errors: Vec<FileError>,
    pub files_details: Vec<FileOutcome>,
    pub documents_by_year: BTreeMap<i32, usize>,
}

impl RunReport {
    /// Start a report for a run beginning at `start_time`.
    pub fn new(start_time: DateTime<Local>) -> Self {
        Self {
            start_time,
            end_time: start_time,
            duration_seconds: 0.,
            statistics: Default::default(),
            errors: vec![],
            files_details: vec![],
            documents_by_year: Default::default(),
        }
    }

    /// Account for the processing of one archive.
    pub fn record(&mut self, outcome: FileOutcome) {
        let stats = &mut self.statistics;
        stats.total += 1;
        match outcome.status {
            FileStatus::Success => {
                stats.success += 1;
                stats.documents_indexed += outcome.documents;
                if let Some(year) = outcome.year {
                    *self.documents_by_year.entry(year).or_default() += outcome.documents;
                }
            }
            FileStatus::Failed => {
                stats.failed += 1;
                self.errors.push(FileError {
                    file: outcome.file.clone(),
                    error: outcome.error.clone().unwrap_or_default(),
                });
            }
            FileStatus::Skipped => stats.skipped += 1,
        }
        self.files_details.push(outcome);
    }

    /// Mark the run as ended at `end_time`.
    pub fn finish(&mut self, end_time: DateTime<Local>) {
        self.end_time = end_time;
        self.duration_seconds = (end_time - self.start_time)
            .to_std()
            .map(|duration| duration.as_secs_f64())
            .unwrap_or_default();
    }

    /// Average processing time of a successful archive, over the whole run.
    pub fn average_seconds_per_file(&self) -> Option<f64> {
        if self.statistics.success == 0 {
            None
        } else {
            Some(self.duration_seconds / self.statistics.success as f64)
        }
    }

    /// Log a summary of the run.
    pub fn log_summary(&self) {
        let stats = &self.statistics;
        tracing::info!(
            "run completed in {:.2}s ({:.1} min)",
            self.duration_seconds,
            self.duration_seconds / 60.
        );
        tracing::info!(
            "{} files: {} succeeded ({:.1}%), {} skipped ({:.1}%), {} failed ({:.1}%)",
            stats.total,
            stats.success,
            stats.percent(stats.success),
            stats.skipped,
            stats.percent(stats.skipped),
            stats.failed,
            stats.percent(stats.failed),
        );
        tracing::info!("{} documents indexed", stats.documents_indexed);
        if let Some(avg) = self.average_seconds_per_file() {
            tracing::info!("{avg:.2}s per file on average");
        }

        if !self.errors.is_empty() {
            tracing::warn!("{} errors", self.errors.len());
            for (i, err) in self.errors.iter().take(5).enumerate() {
                let name = err.file.file_name().unwrap_or(err.file.as_os_str());
                tracing::warn!("{}. {}: {}", i + 1, name.to_string_lossy(), err.error);
            }
            if self.errors.len() > 5 {
                tracing::warn!("... and {} more", self.errors.len() - 5);
            }
        }
    }

    /// Add this report to the runs recorded in the file at `path`.
    ///
    /// The file holds `{"runs": [...]}`. Files written in older formats (a single report, or a bare
    /// list of reports) are converted; a file which cannot be read is replaced.
    pub fn append_to(&self, path: &Path) -> Result<(), Error> {
        let mut runs = if path.exists() {
            match read_runs(path) {
                Ok(runs) => runs,
                Err(err) => {
                    tracing::warn!("unable to read existing report {}: {err:#}", path.display());
                    vec![]
                }
            }
        } else {
            vec![]
        };
        runs.push(serde_json::to_value(self)?);

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file =
            File::create(path).with_context(|| format!("unable to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &json!({ "runs": runs }))?;
        tracing::info!("report saved to {}", path.display());
        Ok(())
    }
}

fn read_runs(path: &Path) -> Result<Vec<Value>, Error> {
    let file = File::open(path)?;
    Ok(match serde_json::from_reader::<_, Value>(BufReader::new(file))? {
        Value::Object(mut obj) => match obj.remove("runs") {
            Some(Value::Array(runs)) => runs,
            Some(_) => return Err(Error::msg("\"runs\" is not a list")),
            None => vec![Value::Object(obj)],
        },
        Value::Array(runs) => runs,
        _ => return Err(Error::msg("unexpected report format")),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> RunReport {
        let start = Local::now();
        let mut report = RunReport::new(start);
        report.record(FileOutcome::success(
            "raw/2022/AN_2022001.taz".into(),
            Some(2022),
            10,
            Duration::from_secs(1),
        ));
        report.record(FileOutcome::success(
            "raw/2022/AN_2022002.taz".into(),
            Some(2022),
            5,
            Duration::from_secs(1),
        ));
        report.record(FileOutcome::failed(
            "raw/2021/AN_2021001.taz".into(),
            Some(2021),
            "no documents extracted".into(),
            Duration::from_secs(1),
        ));
        report.record(FileOutcome::skipped("raw/2021/AN_2021002.taz".into(), Some(2021)));
        report.finish(start + chrono::Duration::seconds(4));
        report
    }

    #[test]
    fn test_record() {
        let report = sample();
        assert_eq!(
            report.statistics,
            Statistics {
                total: 4,
                success: 2,
                failed: 1,
                skipped: 1,
                documents_indexed: 15,
            }
        );
        assert_eq!(report.statistics.percent(1), 25.);
        assert_eq!(
            report.errors,
            [FileError {
                file: "raw/2021/AN_2021001.taz".into(),
                error: "no documents extracted".into(),
            }]
        );
        assert_eq!(report.documents_by_year, [(2022, 15)].into_iter().collect());
        assert_eq!(report.duration_seconds, 4.);
        assert_eq!(report.average_seconds_per_file(), Some(2.));
        assert_eq!(report.files_details.len(), 4);

        let value = serde_json::to_value(&report.files_details[3]).unwrap();
        assert_eq!(value["status"], "skipped");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let report = sample();

        report.append_to(&path).unwrap();
        report.append_to(&path).unwrap();
        let runs = read_runs(&path).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(
            serde_json::from_value::<RunReport>(runs[1].clone()).unwrap(),
            report
        );
    }

    #[test]
    fn test_append_legacy_formats() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let report = sample();

        // A single report becomes the first run.
        fs::write(&path, r#"{"start_time": "2024-01-01T00:00:00"}"#).unwrap();
        report.append_to(&path).unwrap();
        let runs = read_runs(&path).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0]["start_time"], "2024-01-01T00:00:00");

        // A bare list is taken as the runs.
        fs::write(&path, r#"[{"a": 1}, {"b": 2}]"#).unwrap();
        report.append_to(&path).unwrap();
        assert_eq!(read_runs(&path).unwrap().len(), 3);

        // Garbage is replaced.
        fs::write(&path, "not json").unwrap();
        report.append_to(&path).unwrap();
        assert_eq!(read_runs(&path).unwrap().len(), 1);
    }
}
