//! A server for the Minecraft Classic 0.30 protocol.
//!
//! The session supervisor accepts TCP connections and hands each one to its
//! own worker task. Workers share two explicitly passed handles instead of
//! process globals: the peer registry for fan-out and the world store, whose
//! edit log a background task periodically compacts into the world file.

mod command;
pub mod config;
mod connect;
pub mod identity;
pub mod policy;
mod registry;

use std::sync::Arc;

use anyhow::Context;
use classic_world::WorldStore;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub use crate::config::Config;
use crate::identity::IdentityStore;
use crate::registry::PeerRegistry;

/// State shared by the accept loop, every connection worker, and the
/// compactor.
#[derive(Clone)]
pub struct SharedServerState(Arc<SharedStateInner>);

struct SharedStateInner {
    config: Config,
    world: WorldStore,
    registry: PeerRegistry,
    identities: IdentityStore,
    /// Limits simultaneous connections before the play state.
    connection_sema: Arc<Semaphore>,
}

impl SharedServerState {
    pub(crate) fn config(&self) -> &Config {
        &self.0.config
    }

    pub(crate) fn world(&self) -> &WorldStore {
        &self.0.world
    }

    pub(crate) fn registry(&self) -> &PeerRegistry {
        &self.0.registry
    }

    pub(crate) fn identities(&self) -> &IdentityStore {
        &self.0.identities
    }
}

/// Runs the server until interrupted.
///
/// Fatal initialization failures (an unreadable world file, a bind failure)
/// are returned. After the interrupt the listener stops, a final compaction
/// pass drains the edit log, and in-flight workers are abandoned.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let world = WorldStore::open(&config.world_path, config.dimensions, config.compact_chunk)
        .with_context(|| format!("opening world file {}", config.world_path.display()))?;
    let identities = IdentityStore::load(&config.users_path)
        .with_context(|| format!("loading identity store {}", config.users_path.display()))?;

    let shared = SharedServerState(Arc::new(SharedStateInner {
        connection_sema: Arc::new(Semaphore::new(config.max_players)),
        registry: PeerRegistry::new(),
        world,
        identities,
        config,
    }));

    let listener = TcpListener::bind(shared.config().address)
        .await
        .with_context(|| format!("binding {}", shared.config().address))?;

    let dims = shared.config().dimensions;
    info!(x = dims.x, y = dims.y, z = dims.z, cells = dims.volume(), "world loaded");
    info!(address = %shared.config().address, "listening");

    tokio::spawn(autosave_loop(shared.clone()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            accepted = accept_next(&shared, &listener) => {
                match accepted {
                    Ok((permit, stream, remote_addr)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            connect::handle_connection(shared, stream, remote_addr).await;
                            drop(permit);
                        });
                    }
                    Err(e) => error!("failed to accept incoming connection: {e:#}"),
                }
            }
        }
    }

    let final_pass = shared.clone();
    match tokio::task::spawn_blocking(move || final_pass.world().compact()).await {
        Ok(Ok(merged)) => info!(merged, "final compaction complete"),
        Ok(Err(e)) => error!("final compaction failed: {e}"),
        Err(e) => error!("final compaction task failed: {e}"),
    }

    Ok(())
}

async fn accept_next(
    shared: &SharedServerState,
    listener: &TcpListener,
) -> anyhow::Result<(
    tokio::sync::OwnedSemaphorePermit,
    tokio::net::TcpStream,
    std::net::SocketAddr,
)> {
    let permit = shared
        .0
        .connection_sema
        .clone()
        .acquire_owned()
        .await
        .context("connection limiter closed")?;
    let (stream, remote_addr) = listener.accept().await?;
    Ok((permit, stream, remote_addr))
}

/// Periodically merges the edit log into the world file. Failures keep the
/// log intact and are retried on the next tick.
async fn autosave_loop(shared: SharedServerState) {
    let mut ticks = tokio::time::interval(shared.config().autosave_interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticks.tick().await;

    loop {
        ticks.tick().await;

        let pending = shared.world().pending_edits();
        if pending == 0 {
            continue;
        }

        info!(pending, "compacting world");
        let pass = shared.clone();
        match tokio::task::spawn_blocking(move || pass.world().compact()).await {
            Ok(Ok(merged)) => info!(merged, "compaction pass complete"),
            Ok(Err(e)) => warn!("compaction failed, will retry: {e}"),
            Err(e) => warn!("compaction task failed: {e}"),
        }
    }
}
