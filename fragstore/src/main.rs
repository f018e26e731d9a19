use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use fragstore::cadapter::{DataClient, LocalFsNodes, MemoryNodes};
use fragstore::cli::{Args, Command, default_demo_dir};
use fragstore::meta::InMemoryControlPlane;
use fragstore::server::{ServerState, create_router};
use fragstore::{Config, ObjectIo};

const DEMO_SIZE: usize = 2 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.tuning.to_config();
    let control = Arc::new(InMemoryControlPlane::with_nodes(
        args.tuning.nodes,
        args.tuning.replicas,
    ));

    match args.command {
        Command::Demo { dir } => {
            let dir = dir.unwrap_or_else(default_demo_dir);
            demo(config, control, &dir).await
        }
        Command::Serve {
            files,
            data_dir,
            host,
            port,
        } => {
            let data: Arc<dyn DataClient> = match data_dir {
                Some(dir) => Arc::new(LocalFsNodes::new(dir)),
                None => Arc::new(MemoryNodes::new()),
            };
            serve(config, control, data, &files, &host, port).await
        }
    }
}

async fn demo(config: Config, control: Arc<InMemoryControlPlane>, dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create {}", dir.display()))?;
    let io = ObjectIo::new(config, control, Arc::new(LocalFsNodes::new(dir)))?;

    let body: Vec<u8> = (0..DEMO_SIZE).map(|i| (i * 31 % 251) as u8).collect();
    let outcome = io
        .upload_bytes("demo", "blob.bin", "application/octet-stream", Bytes::from(body.clone()))
        .await?;

    let back = io.read_range("demo", "blob.bin", 0, DEMO_SIZE as u64).await?;
    if back[..] != body[..] {
        bail!("read back {} bytes that differ from the upload", back.len());
    }
    let mid = io.read_range("demo", "blob.bin", 700_000, 900_000).await?;
    if mid[..] != body[700_000..900_000] {
        bail!("range read differs from the upload");
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    println!("demo: OK ({} bytes in {} parts)", outcome.size, outcome.parts.len());
    Ok(())
}

async fn serve(
    config: Config,
    control: Arc<InMemoryControlPlane>,
    data: Arc<dyn DataClient>,
    files: &[PathBuf],
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let io = Arc::new(ObjectIo::new(config, control, data)?);

    for path in files {
        let key = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("no usable file name in {}", path.display()))?;
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let outcome = io
            .upload_bytes("local", key, content_type_of(path), Bytes::from(body))
            .await?;
        tracing::info!(key, size = outcome.size, etag = %outcome.etag, "serving /local/{key}");
    }

    let app = create_router(Arc::new(ServerState::new(io)));
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn content_type_of(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down...");
}
