use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{bail, Result, WrapErr};
use datafusion::arrow::util::pretty::pretty_format_batches;
use ingestor::{readback, Config, Ingestor};
use prom_ingest::{api::AppState, http, load_config, load_samples, Backend};

#[derive(Debug, Parser)]
#[command(version, about = "Prometheus remote-write ingestion")]
struct Cli {
    #[command(flatten)]
    opts: IngestOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct IngestOpts {
    /// JSON config file; the flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Store samples in this SQLite database instead of memory
    #[arg(long, global = true)]
    sqlite: Option<PathBuf>,
    /// Number of copier workers
    #[arg(long, global = true)]
    copiers: Option<usize>,
    /// Series cache capacity, 0 disables the cache
    #[arg(long, global = true)]
    cache_capacity: Option<usize>,
    /// Enable HA deduplication
    #[arg(long, global = true)]
    ha: bool,
    /// Timeout of each catalog and store call, in milliseconds
    #[arg(long, global = true)]
    call_timeout_ms: Option<u64>,
    /// Attempts per catalog and store call
    #[arg(long, global = true)]
    retries: Option<u32>,
}

impl IngestOpts {
    fn config(&self) -> Result<Config> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(copiers) = self.copiers {
            config.copier_workers = copiers;
        }
        if let Some(capacity) = self.cache_capacity {
            config.cache_capacity = capacity;
        }
        if self.ha {
            config.ha.enabled = true;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.retries {
            config.retry.max_attempts = attempts;
        }
        config.validate().wrap_err("invalid configuration")?;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest Prometheus query-API JSON files from a directory
    Load {
        samples_dir: PathBuf,
        /// SQL to run against the ingested data, e.g. `SELECT count(*) FROM up`
        #[arg(long)]
        sql: Option<String>,
    },
    /// Accept JSON write requests over HTTP
    Serve {
        #[arg(long, default_value = "0.0.0.0:5080")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = cli.opts.config()?;
    let backend = Backend::open(cli.opts.sqlite.as_deref())?;
    let ingestor = Arc::new(
        Ingestor::builder(backend.catalog(), backend.store())
            .config(config)
            .build()?,
    );

    match cli.command {
        Command::Load { samples_dir, sql } => load(&ingestor, &backend, samples_dir, sql).await,
        Command::Serve { addr } => {
            let state = AppState {
                ingestor,
                catalog: backend.catalog(),
            };
            http::server(addr, state).await
        }
    }
}

async fn load(
    ingestor: &Ingestor,
    backend: &Backend,
    samples_dir: PathBuf,
    sql: Option<String>,
) -> Result<()> {
    let start_time = time::Instant::now();
    let requests = load_samples(&samples_dir)?;
    tracing::info!(files = requests.len(), "prepare time: {}", start_time.elapsed());

    let mut rows = 0;
    for req in requests {
        let report = ingestor.ingest(req).await;
        tracing::info!(
            rows = report.rows_inserted,
            batches = report.batches,
            failed = report.failed_batches,
            "ingested file"
        );
        rows += report.into_result()?;
    }
    ingestor.shutdown().await;
    tracing::info!(rows, "ingest time: {}", start_time.elapsed());

    let Some(sql) = sql else {
        return Ok(());
    };
    let Backend::Memory(memory) = backend else {
        bail!("--sql only works with the in-memory backend");
    };
    let ctx = readback::session_context(memory)?;
    let batches = ctx.sql(&sql).await?.collect().await?;
    println!("{}", pretty_format_batches(&batches)?);
    Ok(())
}
