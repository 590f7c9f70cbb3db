use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use rustedbytes_sharedfolders::args::{Args, ResolveTarget};
use rustedbytes_sharedfolders::server::{FolderServer, ServerConfig};
use rustedbytes_sharedfolders::shfl::{CreateRequest, GuestPath};

/// Looks a guest path up through a throwaway session and logs the outcome.
fn resolve_once(server: &Arc<FolderServer>, target: &ResolveTarget, case_sensitive: bool) -> anyhow::Result<()> {
    let mut session = server.connect();
    session.set_utf8();
    let root = session
        .map_folder(&target.share, '/', case_sensitive)
        .with_context(|| format!("mapping {:?}", target.share))?;

    let request = CreateRequest {
        lookup: true,
        ..Default::default()
    };
    let reply = session
        .create(root, &GuestPath::utf8(&target.path), &request)
        .with_context(|| format!("looking up {:?}", target.path))?;

    match reply.info {
        Some(info) => info!(
            "{}:{} -> {:?}, {:?}, {} bytes",
            target.share, target.path, reply.result, info.kind, info.size
        ),
        None => info!("{}:{} -> {:?}", target.share, target.path, reply.result),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Debug).init();

    let args = Args::parse();

    let config = ServerConfig {
        shares: args.shares,
        max_handles: args.max_handles,
        max_read_size: args.max_read_size,
    };
    for share in &config.shares {
        info!(
            "Shared folder {:?} -> {:?}{}",
            share.name,
            share.host_path,
            if share.writable { "" } else { " (read-only)" }
        );
    }
    info!("Max open handles: {}", config.max_handles);
    info!("Max read buffer size: {} bytes", config.max_read_size);

    let server = Arc::new(FolderServer::with_config(&config).context("setting up shared folders")?);

    for target in &args.resolve {
        if let Err(e) = resolve_once(&server, target, !args.case_insensitive_guest) {
            error!("{:#}", e);
        }
    }

    let mut changes = server.notifier().subscribe();
    info!("Shared folders service ready, press Ctrl-C to stop");
    loop {
        tokio::select! {
            received = changes.recv() => match received {
                Ok(version) => info!("Mapping table changed, version {}", version),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} mapping change notifications", skipped),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                break;
            }
        }
    }

    info!("Shutting down with {} open handles", server.open_handles());
    Ok(())
}
