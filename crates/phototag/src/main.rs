use std::io::Write;
use std::process;

use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt};

use phototag::cli::{Cli, Commands, IngestArgs, RecordsArgs};
use phototag::config;
use phototag::error::AppError;
use phototag::services::{CancelSignal, UploadBatch, UploadItem, build_pipeline_context};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(cli.verbose));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Ingest(args)) => run_ingest(args).await?,
        Some(Commands::Records(args)) => run_records(args).await?,
        None => Cli::print_help(),
    }

    Ok(())
}

async fn run_ingest(args: IngestArgs) -> Result<(), AppError> {
    let mut cfg = config::load()?;
    if let Some(folder) = args.folder {
        cfg.ingest.folder = folder;
    }
    if let Some(workers) = args.workers {
        cfg.ingest.workers = workers;
    }
    let ctx = build_pipeline_context(&cfg)?;

    let mut items = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let item = UploadItem::from_path(path)
            .await
            .map_err(|source| AppError::Io {
                path: path.clone(),
                source,
            })?;
        items.push(item);
    }

    let (cancel_handle, cancel) = CancelSignal::new();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling items that have not started");
            cancel_handle.cancel();
        }
    });

    let outcome = ctx
        .coordinator
        .ingest(UploadBatch::new(args.owner, items), cancel)
        .await;
    interrupt.abort();
    let result = outcome?;

    let stats = ctx.coordinator.stager().stats();
    info!(
        succeeded = result.succeeded(),
        failed = result.failed(),
        staged = stats.acquired,
        released = stats.released,
        release_failures = stats.release_failures,
        "ingest complete"
    );
    print_json(&result)
}

async fn run_records(args: RecordsArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let ctx = build_pipeline_context(&cfg)?;
    let records = ctx.records.list_by_owner(&args.owner, args.limit).await?;
    info!(owner = %args.owner, count = records.len(), "records listed");
    print_json(&records)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out).map_err(AppError::Output)?;
    Ok(())
}
