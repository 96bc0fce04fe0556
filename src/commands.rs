use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use mget::downloader::{DownloadReport, Downloader};
use mget::metadata::{sidecar_path, MetadataStore, SIDECAR_SUFFIX};
use mget::side_table::KEY_PASSWORD;
use mget::state::DownloadState;
use mget::utils::rate_kbps;

const RETRY_DELAY: Duration = Duration::from_secs(1);

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr_with_hz(5));
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}",
    ) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

fn render(pb: &ProgressBar, state: &DownloadState) {
    if state.total_size > 0 && pb.length() != Some(state.total_size) {
        pb.set_length(state.total_size);
    }
    pb.set_position(state.current_size);
    pb.set_message(format!(
        "{} [{} conn, {}/{} chunks, {}]",
        state.file_name,
        state.acon,
        state.completed_parts(),
        state.parts.len(),
        state.status.label()
    ));
}

fn completion_line(report: &DownloadReport) -> String {
    let name = report
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| report.path.display().to_string());
    format!(
        "{} - {} saved in {} [{:.2}KB/s]",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        name,
        HumanDuration(report.elapsed),
        rate_kbps(report.bytes, report.elapsed.as_secs_f64())
    )
}

/// Downloads every URL in turn; with no URL, resumes `resume_from` alone.
pub async fn run_downloads(
    downloader: &Downloader,
    urls: &[String],
    resume_from: Option<&Path>,
    retries: u32,
) -> Result<()> {
    if urls.is_empty() {
        run_single_download(downloader, None, resume_from, retries).await?;
        return Ok(());
    }

    let mut failed = Vec::new();
    for url in urls {
        if let Err(e) = run_single_download(downloader, Some(url), resume_from, retries).await {
            eprintln!("Failed to download {}: {:#}", url, e);
            failed.push(url.clone());
            if downloader.cancel_token().is_cancelled() {
                break;
            }
        }
    }
    if !failed.is_empty() {
        bail!("{} of {} downloads failed", failed.len(), urls.len());
    }
    Ok(())
}

/// Runs one target up to `retries` times. Every attempt resumes from the
/// sidecar the previous one left behind.
pub async fn run_single_download(
    downloader: &Downloader,
    url: Option<&str>,
    resume_from: Option<&Path>,
    retries: u32,
) -> Result<DownloadReport> {
    let label = url
        .map(str::to_string)
        .or_else(|| resume_from.map(|p| p.display().to_string()))
        .unwrap_or_default();
    let mut resume: Option<PathBuf> = resume_from.map(Path::to_path_buf);
    let attempts = retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let pb = progress_bar();
        let mut renamed: Option<String> = None;
        let result = downloader
            .download(url, resume.as_deref(), &mut |state: &DownloadState| {
                render(&pb, state);
                renamed = Some(state.file_name.clone());
            })
            .await;

        match result {
            Ok(report) => {
                pb.finish_and_clear();
                println!("{}", completion_line(&report));
                return Ok(report);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                pb.abandon();
                warn!("attempt {attempt}/{attempts} for {label} failed: {e}; retrying");
                // A server-suggested name moved the sidecar; follow it.
                if resume.is_none() {
                    if let Some(name) = renamed.filter(|n| !n.is_empty()) {
                        let dir = downloader.options().output_dir.clone();
                        if downloader.options().output_name.is_none() && dir.join(&name).exists() {
                            resume = Some(dir.join(name));
                        }
                    }
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                pb.abandon();
                return Err(e).with_context(|| format!("download of {label} failed after {attempt} attempt(s)"));
            }
        }
    }
}

/// Prints what a sidecar records without touching it.
pub fn inspect(path: &Path, json: bool) -> Result<()> {
    let sidecar = match path.extension() {
        Some(ext) if ext == SIDECAR_SUFFIX => path.to_path_buf(),
        _ => sidecar_path(path),
    };
    let store = MetadataStore::load_existing(&sidecar)
        .with_context(|| format!("Failed to read {}", sidecar.display()))?
        .with_context(|| format!("No metadata at {}", sidecar.display()))?;
    let state = store.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let header = store.header();
    let last_time = DateTime::from_timestamp(state.last_time as i64, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("Metadata:    {} (version {})", sidecar.display(), header.version);
    println!("URL:         {}", state.url);
    println!("File:        {}", state.file_name);
    println!("Status:      {}", state.status.label());
    println!(
        "Progress:    {} / {} ({})",
        HumanBytes(state.current_size),
        HumanBytes(state.total_size),
        state
            .percent()
            .map(|p| format!("{p:.2}%"))
            .unwrap_or_else(|| "unknown".to_string())
    );
    println!("Chunk size:  {}", HumanBytes(state.chunk_size));
    println!(
        "Connections: {} requested, {} chunks",
        state.nr_user, state.nr_effective
    );
    println!("Last update: {}", last_time);
    println!("Time spent:  {}", HumanDuration(Duration::from_secs(state.acc_time.into())));
    println!();

    println!("{:<6} {:<15} {:<15} {:<15} {:<10}", "Chunk", "Start", "Current", "End", "Done");
    println!("{:-<6} {:-<15} {:-<15} {:-<15} {:-<10}", "", "", "", "", "");
    for part in &state.parts {
        println!(
            "{:<6} {:<15} {:<15} {:<15} {:<10}",
            part.index,
            part.start_byte,
            part.current_byte,
            part.end_byte,
            if part.completed { "yes" } else { "no" }
        );
    }

    println!();
    for (key, value) in store.side_entries() {
        let shown = if key == KEY_PASSWORD { "****" } else { value };
        println!("{key:<8} {shown}");
    }
    Ok(())
}
