use anyhow::Result;
use shuttervault::backup::BackupManager;
use shuttervault::utils::{config, logging};
use shuttervault::RunOutcome;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let config = config::load_config()?;

    info!("Starting ShutterVault v1.0.0");
    info!("Source: {}", config.source_root.display());
    for (i, dest) in config.destinations.iter().enumerate() {
        info!("Destination {}: {}", i, dest.display());
    }
    info!("CPU cores available: {}", num_cpus::get());

    let manager = Arc::new(BackupManager::new(config)?);

    // Ctrl+C / SIGTERM cancel the run; workers stop at their next checkpoint
    // and already-copied files still get verified.
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_manager.cancel();
    });

    // Headless progress rendering off the shared snapshot
    let render_manager = manager.clone();
    let render = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let snap = render_manager.snapshot();
            if snap.outcome.is_some() {
                break;
            }
            let eta = snap
                .eta_seconds
                .map(|s| humantime::format_duration(Duration::from_secs(s)).to_string())
                .unwrap_or_else(|| "--".to_string());
            info!(
                "[{}] {:>5.1}% | {}/s | eta {} | {}",
                snap.phase,
                snap.overall * 100.0,
                human_bytes(snap.bytes_per_second),
                eta,
                snap.current_file.as_deref().unwrap_or("")
            );
        }
    });

    let outcome = manager.run().await?;
    render.abort();

    let snapshot = manager.snapshot();
    for dest in &snapshot.destinations {
        info!(
            "{}: {} copied, {} skipped, {} quarantined, {} verified, {} failed",
            dest.root.display(),
            dest.files_completed,
            dest.files_skipped,
            dest.files_quarantined,
            dest.files_verified,
            dest.files_failed
        );
    }

    match outcome {
        RunOutcome::CompletedClean => {
            info!("Backup completed clean");
            Ok(())
        }
        RunOutcome::CompletedWithFailures { failed_files } => {
            for failed in &failed_files {
                error!(
                    "Failed (destination {}): {}: {}",
                    failed.destination,
                    failed.relative_path.display(),
                    failed.error
                );
            }
            std::process::exit(1);
        }
        RunOutcome::Cancelled => {
            warn!("Backup cancelled");
            std::process::exit(130);
        }
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
