//! CLI entry point for the parget download manager.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use parget_core::{
    Config, DownloadManager, JobId, JobSnapshot, JobState, ProgressSubscription, SubmitRequest,
};
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Arguments before tracing, so --help exits without log output
    let args = Args::parse();

    // RUST_LOG overrides the --quiet/--verbose flags
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    match args.command {
        Command::Download {
            urls,
            output,
            threads,
            concurrency,
        } => download(urls, output, threads, concurrency, args.quiet).await,
        Command::Resume { job_id } => resume(&job_id, args.quiet).await,
        Command::Jobs => list_jobs().await,
    }
}

/// Builds the engine configuration from defaults, the home directory,
/// and CLI overrides.
fn build_config(output: Option<PathBuf>, threads: Option<u8>, concurrency: Option<u8>) -> Config {
    let mut config = Config::default();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        config.download_dir = home.join("Downloads");
        config.state_dir = home.join(".parget").join("jobs");
    }
    if let Some(dir) = output {
        config.download_dir = dir;
    }
    if let Some(threads) = threads {
        config.threads_per_download = usize::from(threads);
    }
    if let Some(limit) = concurrency {
        config.max_concurrent_downloads = usize::from(limit);
    }
    config
}

async fn download(
    urls: Vec<String>,
    output: Option<PathBuf>,
    threads: Option<u8>,
    concurrency: Option<u8>,
    quiet: bool,
) -> Result<()> {
    let config = build_config(output, threads, concurrency);
    let manager = DownloadManager::new(config)?;

    let bars = MultiProgress::new();
    let mut watchers = Vec::new();
    for url in urls {
        let id = manager.submit(SubmitRequest::new(&url));
        debug!(job_id = %id, url = %url, "Job submitted");
        let subscription = manager.subscribe(&id)?;
        let bar = bars.add(new_spinner(quiet));
        watchers.push(tokio::spawn(watch_job(subscription, bar)));
    }

    let mut completed = 0usize;
    let mut failed = 0usize;
    for watcher in watchers {
        match watcher.await? {
            JobState::Completed => completed += 1,
            _ => failed += 1,
        }
    }

    info!(completed, failed, "All downloads finished");
    if failed > 0 {
        anyhow::bail!("{failed} download(s) did not complete");
    }
    Ok(())
}

async fn resume(job_id: &str, quiet: bool) -> Result<()> {
    let config = build_config(None, None, None);
    let manager = DownloadManager::new(config)?;

    let restored = manager.restore().await?;
    debug!(restored = restored.len(), "Checkpoints scanned");

    let id = JobId::from(job_id);
    manager.resume(&id).await?;
    let subscription = manager.subscribe(&id)?;

    let state = watch_job(subscription, new_spinner(quiet)).await;
    if state == JobState::Completed {
        Ok(())
    } else {
        anyhow::bail!("job {job_id} ended in state {state}")
    }
}

async fn list_jobs() -> Result<()> {
    let config = build_config(None, None, None);
    let manager = DownloadManager::new(config)?;
    manager.restore().await?;

    let jobs = manager.jobs();
    if jobs.is_empty() {
        println!("No resumable jobs. Submit one with `parget download <URL>`.");
        return Ok(());
    }

    println!("{:<10} {:<12} {:>10} {:>10}  FILE", "JOB", "STATE", "DONE", "TOTAL");
    for snapshot in jobs {
        let done = HumanBytes(snapshot.bytes_completed).to_string();
        let total = snapshot
            .total_size
            .map_or_else(|| "?".to_string(), |size| HumanBytes(size).to_string());
        let file = snapshot
            .filename
            .as_deref()
            .unwrap_or(snapshot.url.as_str());
        println!(
            "{:<10} {:<12} {:>10} {:>10}  {}",
            snapshot.id, snapshot.state, done, total, file
        );
    }
    Ok(())
}

fn new_spinner(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Drives one progress bar from a job's snapshot stream and returns the
/// state the job ended in.
async fn watch_job(mut subscription: ProgressSubscription, bar: ProgressBar) -> JobState {
    let mut state = JobState::Failed;
    while let Some(snapshot) = subscription.next().await {
        bar.set_message(progress_message(&snapshot));
        state = snapshot.state;
    }
    if state == JobState::Completed {
        bar.finish();
    } else {
        bar.abandon();
    }
    state
}

fn progress_message(snapshot: &JobSnapshot) -> String {
    let name = snapshot
        .filename
        .as_deref()
        .unwrap_or(snapshot.url.as_str());
    if snapshot.state == JobState::Failed {
        if let Some(error) = snapshot.error.as_deref() {
            return format!("{name}: failed: {error}");
        }
    }
    let speed = HumanBytes(snapshot.speed_bps as u64);
    match (snapshot.percent(), snapshot.total_size) {
        (Some(percent), Some(total)) => format!(
            "{name}: {} {percent:.1}% of {} ({speed}/s)",
            snapshot.state,
            HumanBytes(total),
        ),
        _ => format!(
            "{name}: {} {} ({speed}/s)",
            snapshot.state,
            HumanBytes(snapshot.bytes_completed),
        ),
    }
}
