//! Album upload CLI: sends a photo through the issue-then-PUT protocol, or
//! lists what the album has received.

use album_service::{Config, HttpTransport, UploadOrchestrator};
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "album-upload", about = "Wedding album upload client")]
struct Cli {
    /// Album service base URL (overrides ALBUM__CLIENT__BASE_URL)
    #[arg(long)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a photo
    Upload {
        /// Path to the image file
        file: PathBuf,
        /// Content type to send; guessed from the extension when omitted
        #[arg(long)]
        content_type: Option<String>,
    },
    /// List received uploads
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(server) = cli.server {
        config.client.base_url = server;
    }

    let transport = HttpTransport::new(&config.client).context("Failed to build HTTP client")?;

    match cli.command {
        Commands::Upload { file, content_type } => {
            let payload = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let content_type = content_type.unwrap_or_else(|| content_type_for(&file).to_string());

            let orchestrator = UploadOrchestrator::new(transport, config.display_delay());
            let ack = orchestrator
                .perform_upload(Bytes::from(payload), &content_type)
                .await
                .context("Upload failed")?;

            println!("Uploaded {}", ack.key);
        }
        Commands::List => {
            let listing = transport
                .list_uploads()
                .await
                .context("Failed to list uploads")?;

            for upload in &listing.uploads {
                println!("{}  {:>6} KB  {}", upload.date, upload.approx_size_kb, upload.key);
            }
            println!("{} upload(s)", listing.total);
        }
    }

    Ok(())
}

/// Content type for an image file extension
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    match ext.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}
