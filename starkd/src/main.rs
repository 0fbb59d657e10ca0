mod cli;
mod config;
mod driver;
mod pack_registry;
mod server;
mod session;
mod submissions;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use libscheduler::{
    ClusterState, NodeManager, NodeManagerConfig, Scheduler, models::SchedulerConfig,
};
use libstore::{DocumentStore, EtcdStore};
use librouter::{Router, RouterConfig};
use log::{error, info};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::load_config;
use crate::pack_registry::PackRegistry;
use crate::server::{ServerDeps, serve};
use crate::session::SessionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config.to_str().unwrap())?;

            let endpoints: Vec<&str> = cfg.store.endpoints.iter().map(|s| s.as_str()).collect();
            let store: Arc<dyn DocumentStore> = Arc::new(
                EtcdStore::new(&endpoints)
                    .await
                    .context("connecting to the document store failed")?,
            );

            let state = Arc::new(RwLock::new(ClusterState::new()));
            let scheduler = Arc::new(Scheduler::new(
                SchedulerConfig {
                    enable_preemption: cfg.scheduler.enable_preemption,
                    default_priority: cfg.scheduler.default_priority,
                },
                state.clone(),
            ));
            let node_manager = Arc::new(NodeManager::new(
                NodeManagerConfig {
                    heartbeat_interval: Duration::from_secs(cfg.nodes.heartbeat_interval_secs),
                    offline_grace: Duration::from_secs(cfg.nodes.offline_grace_secs),
                    scan_interval: Duration::from_secs(cfg.nodes.scan_interval_secs),
                },
                state.clone(),
            ));
            let packs = Arc::new(PackRegistry::new(state.clone(), store.clone()));

            // Rehydrate registry records and apply config seeds.
            let loaded = packs.load_existing().await?;
            info!("loaded {loaded} pack(s) from the store");
            {
                let mut guard = state.write().await;
                for class in &cfg.seed.priority_classes {
                    if let Err(e) = guard.add_priority_class(class.clone()) {
                        error!("seed priority class {}: {e}", class.name);
                    }
                }
                for builtin in [
                    common::PriorityClass::system_cluster_critical(),
                    common::PriorityClass::system_node_critical(),
                ] {
                    let _ = guard.add_priority_class(builtin);
                }
            }
            for pack in &cfg.seed.packs {
                if let Err(e) = packs.register(pack.clone()).await {
                    error!("seed pack {}: {e}", pack.id);
                }
            }

            let sessions = Arc::new(SessionRegistry::default());
            scheduler.run();
            node_manager.run();
            driver::spawn(
                scheduler.clone(),
                node_manager.clone(),
                sessions.clone(),
                store.clone(),
            )
            .await;
            submissions::spawn(store.clone(), scheduler.clone());

            for tier in &cfg.routers {
                let router = Router::new(
                    store.clone(),
                    RouterConfig {
                        user: tier.user.clone(),
                        num_routers: tier.num_routers,
                        router_index: tier.router_index,
                    },
                );
                let cancel = CancellationToken::new();
                tokio::spawn(async move {
                    if let Err(e) = router.run(cancel).await {
                        error!("router tier stopped: {e}");
                    }
                });
            }

            println!("[starkd] listening on {}", cfg.addr);
            let deps = Arc::new(ServerDeps {
                store,
                scheduler,
                node_manager,
                sessions,
                auth: cfg.auth.clone(),
                ping_interval: Duration::from_secs(cfg.nodes.ping_interval_secs),
            });
            serve(cfg.addr, deps).await?;
        }
    }

    Ok(())
}
