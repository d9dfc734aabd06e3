use anyhow::Error;
use clap::{Args, Parser};
use debats::{
    batch::{self, BatchOptions},
    dila, es,
    es::{SearchIndex, WriteMode},
    init_logging,
    orchestrator::Orchestrator,
    report::DEFAULT_REPORT,
    transform::Transformer,
};
use std::path::PathBuf;

/// Download, transform and index the debates of the Assemblée Nationale.
#[derive(Parser)]
enum Command {
    /// Create the Elasticsearch index.
    Init {
        /// Delete and recreate the index if it already exists.
        #[clap(long)]
        recreate: bool,

        #[clap(flatten)]
        pipeline: Pipeline,
    },
    /// Download the raw archives of some years.
    Extract {
        #[clap(name = "YEAR", required = true)]
        years: Vec<u16>,

        #[clap(flatten)]
        pipeline: Pipeline,
    },
    /// Transform downloaded archives without indexing them.
    Transform {
        /// Transform the archives of YEAR.
        #[clap(short, long, name = "YEAR", conflicts_with = "DIR")]
        year: Option<u16>,

        /// Transform the archives in DIR.
        #[clap(short, long, name = "DIR", required_unless_present = "YEAR")]
        dir: Option<PathBuf>,

        /// Add to existing summary files instead of replacing them.
        #[clap(long)]
        append: bool,

        #[clap(flatten)]
        pipeline: Pipeline,
    },
    /// Transform and index a single archive.
    File {
        path: PathBuf,

        /// Only transform the archive.
        #[clap(long)]
        no_index: bool,

        /// Leave documents which are already indexed untouched.
        #[clap(long)]
        keep_existing: bool,

        #[clap(flatten)]
        pipeline: Pipeline,
    },
    /// Transform and index some years, one after the other.
    Run {
        #[clap(name = "YEAR", required = true)]
        years: Vec<u16>,

        /// Download the archives first.
        #[clap(long)]
        download: bool,

        /// Only transform the archives.
        #[clap(long)]
        no_index: bool,

        #[clap(flatten)]
        pipeline: Pipeline,
    },
    /// Process the whole raw directory in bulk.
    Batch {
        /// Download the archives of the selected years first.
        #[clap(long, env = "DEBATS_DOWNLOAD")]
        download: bool,

        /// Process several archives at once.
        #[clap(long, env = "DEBATS_PARALLEL")]
        parallel: bool,

        /// Reprocess archives which are already indexed.
        #[clap(long)]
        no_skip: bool,

        /// Only process these years.
        #[clap(long, value_delimiter = ',')]
        years: Vec<u16>,

        /// Show what would be processed and stop.
        #[clap(long)]
        dry_run: bool,

        /// Delete and recreate the index first.
        #[clap(long)]
        create_index: bool,

        /// Only transform the archives.
        #[clap(long)]
        no_index: bool,

        #[clap(flatten)]
        pipeline: Pipeline,
    },
    /// Show the state of the cluster and the index.
    Status {
        #[clap(flatten)]
        pipeline: Pipeline,
    },
}

/// Options shared by all commands.
#[derive(Args)]
struct Pipeline {
    /// Directory where per-sitting summaries are written.
    #[clap(
        long,
        visible_alias = "output-dir",
        env = "DEBATS_TRANSFORMED_DIR",
        default_value = "data/transformed"
    )]
    transformed_dir: PathBuf,

    /// Maximum number of archives downloaded or processed at once.
    #[clap(long, env = "DEBATS_MAX_WORKERS", default_value = "5")]
    max_workers: usize,

    /// File to which batch reports are appended.
    #[clap(long, env = "DEBATS_REPORT", default_value = DEFAULT_REPORT)]
    report: PathBuf,

    #[clap(flatten)]
    dila: dila::Options,

    #[clap(flatten)]
    es: es::Options,
}

impl Pipeline {
    /// Build the pipeline, connecting to Elasticsearch only if `index` is set.
    async fn orchestrator(&self, index: bool) -> Result<Orchestrator, Error> {
        let es: Option<Box<dyn SearchIndex>> = if index {
            Some(Box::new(self.es.connect().await?))
        } else {
            None
        };
        Ok(Orchestrator::new(
            self.dila.downloader(self.max_workers)?,
            Transformer::new(&self.transformed_dir),
            es,
        )
        .with_report(&self.report))
    }
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    init_logging();

    match Command::parse() {
        Command::Init { recreate, pipeline } => {
            pipeline.orchestrator(true).await?.setup_index(recreate).await?;
        }
        Command::Extract { years, pipeline } => {
            let summary = pipeline
                .orchestrator(false)
                .await?
                .extract(&years, pipeline.max_workers)
                .await?;
            for (publication, err) in &summary.failed {
                tracing::error!("{publication}: {err}");
            }
        }
        Command::Transform {
            year,
            dir,
            append,
            pipeline,
        } => {
            let orchestrator = pipeline.orchestrator(false).await?;
            let docs = match (year, dir) {
                (Some(year), _) => orchestrator.transform_year(year, append).await?,
                (None, Some(dir)) => orchestrator.transform_directory(&dir, append).await?,
                (None, None) => return Err(Error::msg("either a year or a directory is required")),
            };
            tracing::info!("{} documents extracted", docs.len());
        }
        Command::File {
            path,
            no_index,
            keep_existing,
            pipeline,
        } => {
            let mode = if keep_existing {
                WriteMode::KeepExisting
            } else {
                WriteMode::Replace
            };
            pipeline
                .orchestrator(!no_index)
                .await?
                .run_etl_file(&path, !no_index, mode)
                .await?;
        }
        Command::Run {
            years,
            download,
            no_index,
            pipeline,
        } => {
            let orchestrator = pipeline.orchestrator(!no_index).await?;
            orchestrator
                .run_etl_years(&years, download, !no_index)
                .await?;
            if !no_index {
                println!("{}", orchestrator.stats().await?);
            }
        }
        Command::Batch {
            download,
            parallel,
            no_skip,
            years,
            dry_run,
            create_index,
            no_index,
            pipeline,
        } => {
            let options = BatchOptions {
                parallel,
                max_workers: pipeline.max_workers,
                skip_existing: !no_skip,
                years: years.iter().copied().map(i32::from).collect(),
                index: !no_index,
            };
            if dry_run {
                for year in batch::plan(&pipeline.dila.raw_dir, &options.years)? {
                    println!(
                        "{}: {} files ({}...)",
                        batch::year_label(year.year),
                        year.files,
                        year.sample.join(", ")
                    );
                }
                return Ok(());
            }

            let orchestrator = pipeline.orchestrator(!no_index).await?;
            if create_index && !no_index {
                orchestrator.setup_index(true).await?;
            }
            let report = orchestrator.run_batch(download, &options).await?;
            if report.statistics.failed > 0 {
                tracing::warn!(
                    "{} archives failed, see {}",
                    report.statistics.failed,
                    pipeline.report.display()
                );
            }
            if !no_index {
                println!("{}", orchestrator.stats().await?);
            }
        }
        Command::Status { pipeline } => {
            let status = pipeline.orchestrator(true).await?.status().await?;
            print!("{status}");
        }
    }

    Ok(())
}
