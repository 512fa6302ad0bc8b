// glink-server: coordinator daemon. Creates the configured clusters and serves them over UDP.

use std::path::PathBuf;

use anyhow::Context;
use glink_rdp::config::{self, ClusterConfig};
use glink_rdp::Server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("glink-server {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("glink_rdp=info,glink_server=info")),
        )
        .init();

    let mut cfg = match &config_path {
        Some(path) => config::load_path(path)?,
        None => config::load()?,
    };
    if cfg.clusters.is_empty() {
        cfg.clusters.push(ClusterConfig {
            index: 1,
            name: "default".to_string(),
            partitions: 1,
            identity: None,
        });
    }

    let server = Server::new("glink", cfg.server());
    for c in &cfg.clusters {
        let identity = c.identity()?;
        let cluster = server
            .add_cluster_with_identity(c.index, &c.name, c.partitions, identity)
            .with_context(|| format!("cluster {}", c.name))?;
        info!(
            cluster = cluster.name(),
            index = cluster.index(),
            certificate = %cluster.certificate(),
            partitions = cluster.partitions(),
            "cluster ready"
        );
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let cancel = CancellationToken::new();
        let serve = tokio::spawn({
            let server = server.clone();
            let cancel = cancel.clone();
            let port = cfg.port;
            async move { server.listen(port, cancel).await }
        });
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "cannot wait for shutdown signal");
        }
        info!("shutting down");
        cancel.cancel();
        serve.await??;
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
