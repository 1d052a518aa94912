//! # voxlink - Interactive Synthesis Client
//!
//! Reads lines from stdin, synthesizes each one through a [`SynthesisManager`],
//! and saves the audio to `<output.dir>/<basename>_<idx>_<timestamp>.<ext>`.
//!
//! ## Configuration:
//! Everything comes from config.toml and `APP_` environment variables (see
//! [`voxlink::config`]); `VOXLINK_URL` is a shortcut for the endpoint.
//!
//! Ctrl+C or end of input closes the manager and exits.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxlink::{AppConfig, SynthesisManager, SynthesisOptions, SynthesizedAudio};

#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voxlink v{}", env!("CARGO_PKG_VERSION"));
    info!(
        url = %config.connection.url,
        format = %config.synthesis.default_format,
        voice = %config.synthesis.default_voice,
        "Configuration loaded"
    );

    let out_dir = PathBuf::from(&config.output.dir);
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    let manager = SynthesisManager::from_config(&config)?;

    tokio::select! {
        result = interactive_loop(&manager, &out_dir, &config.output.basename) => {
            if let Err(e) = result {
                error!("Input loop failed: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
        }
    }

    manager.close().await;

    let metrics = manager.metrics();
    info!(
        submitted = metrics.submitted,
        succeeded = metrics.succeeded,
        failed = metrics.failed,
        "Client stopped"
    );
    println!("\nBye!");
    Ok(())
}

/// Prompt, synthesize, save; until end of input.
///
/// A failed request is reported and the loop keeps going.
async fn interactive_loop(
    manager: &SynthesisManager,
    out_dir: &Path,
    basename: &str,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut idx: u32 = 0;

    println!("Type text and press Enter to synthesize. Ctrl+C to quit.\n");

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        match manager.submit(text, SynthesisOptions::default()).await {
            Ok(audio) => {
                let path = save(&audio, out_dir, basename, idx).await?;
                println!(
                    "[ok] saved → {} ({} bytes, {} Hz, rtf {:.2})",
                    path.display(),
                    audio.bytes.len(),
                    audio.sample_rate,
                    audio.stats.rtf
                );
                idx += 1;
            }
            Err(e) => println!("[{}] {}", e.kind(), e),
        }
    }

    Ok(())
}

async fn save(
    audio: &SynthesizedAudio,
    out_dir: &Path,
    basename: &str,
    idx: u32,
) -> Result<PathBuf> {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let extension = audio.format.extension();
    let file_name = format!("{}_{:04}_{}.{}", basename, idx, timestamp, extension);
    let path = out_dir.join(file_name);

    tokio::fs::write(&path, &audio.bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g. "debug", "voxlink=info")
/// - If not set, defaults to "voxlink=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxlink=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
