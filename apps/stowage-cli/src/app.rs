//! Upload run: wires config, backend and scheduler together.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use stowage_transfer::{format_eta, format_file_size, format_speed};
use stowage_uploader::{
    HttpBackend, JobId, LocalBackend, ProgressSnapshot, StaticToken, StorageBackend,
    UploadEvent, UploadFile, UploadScheduler, UploadStats,
};
use tokio::sync::mpsc;

use crate::Args;
use crate::config::CliConfig;

/// Token used against a local directory when none is configured.
const LOCAL_TOKEN: &str = "local";

/// Uploads every file in `args`; fails if any upload ends in error.
pub async fn run(args: Args, config: CliConfig) -> anyhow::Result<()> {
    let (backend, token): (Arc<dyn StorageBackend>, StaticToken) = match &args.local_root {
        Some(root) => {
            tracing::info!(root = %root.display(), "storing into local directory");
            let token = config.token().unwrap_or_else(|| LOCAL_TOKEN.into());
            (Arc::new(LocalBackend::new(root)), StaticToken::new(token))
        }
        None => {
            let backend = HttpBackend::new(&config.server_url)
                .with_context(|| format!("invalid server url {}", config.server_url))?;
            let token = config.token().map(StaticToken::new).unwrap_or_default();
            (Arc::new(backend), token)
        }
    };

    let files = args
        .files
        .iter()
        .map(|p| UploadFile::from_path(p).with_context(|| format!("cannot read {}", p.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let scheduler = UploadScheduler::new(config.uploader.clone(), backend, Arc::new(token));
    let events = scheduler.events()?;
    let ids = scheduler.submit(files, None, None)?;
    let names: HashMap<JobId, String> = scheduler
        .jobs()?
        .into_iter()
        .map(|job| (job.id, job.name))
        .collect();
    let printer = tokio::spawn(print_events(events, names));

    let upload = scheduler.start(args.target.as_deref());
    tokio::pin!(upload);
    let result = tokio::select! {
        result = &mut upload => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("SIGINT received, cancelling uploads");
            for id in &ids {
                if let Err(e) = scheduler.cancel(*id) {
                    tracing::debug!(job = %id, error = %e, "cancel skipped");
                }
            }
            upload.await
        }
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "upload run failed");
    }

    let stats = scheduler.stats()?;
    scheduler.dispose();
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "event printer stopped");
    }
    println!("{}", summary_line(&stats));

    if stats.error > 0 {
        anyhow::bail!("{} of {} uploads failed", stats.error, stats.total);
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<UploadEvent>, names: HashMap<JobId, String>) {
    // Last whole percent printed per job.
    let mut shown: HashMap<JobId, u64> = HashMap::new();
    while let Some(event) = events.recv().await {
        let name = names.get(&event.job()).map(String::as_str).unwrap_or("?");
        match event {
            UploadEvent::Progress { job, progress } => {
                let whole = progress.percent.floor() as u64;
                if shown.get(&job).is_some_and(|last| *last == whole) {
                    continue;
                }
                shown.insert(job, whole);
                println!("{}", progress_line(name, &progress));
            }
            UploadEvent::Complete { result, .. } => {
                println!("{name}: done -> {} ({})", result.path, format_file_size(result.size));
            }
            UploadEvent::Error { message, .. } => eprintln!("{name}: failed: {message}"),
            UploadEvent::Cancelled { .. } => eprintln!("{name}: cancelled"),
        }
    }
}

fn progress_line(name: &str, progress: &ProgressSnapshot) -> String {
    let mut line = format!(
        "{name}: {:>5.1}% {} / {}",
        progress.percent,
        format_file_size(progress.uploaded_bytes),
        format_file_size(progress.total_bytes),
    );
    if progress.speed > 0.0 {
        line.push_str(&format!(" {}", format_speed(progress.speed)));
    }
    if let Some(eta) = progress.eta_secs {
        line.push_str(&format!(" eta {}", format_eta(eta)));
    }
    line
}

fn summary_line(stats: &UploadStats) -> String {
    format!(
        "{} completed, {} failed, {} cancelled ({} uploaded)",
        stats.completed,
        stats.error,
        stats.cancelled,
        format_file_size(stats.uploaded_bytes),
    )
}
