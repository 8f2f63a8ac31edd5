use crate::{
    core::{ConfigStore, Grammar},
    discovery,
    firewall::{Driver, Enforcer, Netfilter},
    index::Index,
    k8s, ConfigWatcher,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use std::path::PathBuf;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "access-controller",
    about = "Grants tunnel clients access to cluster workloads and services"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "access_controller=info,warn",
        env = "ACCESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Directory of client descriptors, one file per client.
    #[clap(long, default_value = "/tmp/ccd", env = "ACCESS_CONTROLLER_CCD_DIR")]
    ccd_dir: PathBuf,

    /// Directive that binds a client to its tunnel address.
    #[clap(long, default_value = "ifconfig-push")]
    binding_keyword: String,

    /// Directive that carries a client's routes.
    #[clap(long, default_value = "push")]
    routing_keyword: String,

    /// Chain that holds each client's block rule.
    #[clap(long, default_value = "FORWARD")]
    chain: String,

    #[clap(long, default_value = "ipset")]
    ipset_path: PathBuf,

    #[clap(long, default_value = "iptables")]
    iptables_path: PathBuf,

    /// How often to scan the descriptor directory when file notifications are unavailable.
    #[clap(long, default_value = "10")]
    poll_interval_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            ccd_dir,
            binding_keyword,
            routing_keyword,
            chain,
            ipset_path,
            iptables_path,
            poll_interval_secs,
        } = self;

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_client(client)
            .with_admin(admin)
            .build()
            .await?;

        // Nothing may be reconciled until the backend is known to work.
        let netfilter = Netfilter::new(ipset_path, iptables_path, &chain);
        netfilter
            .probe()
            .await
            .context("firewall backend is unavailable")?;
        let installed = netfilter
            .block_rules()
            .await
            .context("failed to list block rules")?;

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let index = Index::shared(ops_tx);
        tokio::spawn(
            Enforcer::new(netfilter, ops_rx)
                .run()
                .instrument(info_span!("enforcer")),
        );

        discovery::list_all(runtime.client(), &index)
            .await
            .context("initial discovery failed")?;

        let store = ConfigStore::new(
            ccd_dir,
            Grammar {
                binding_keyword,
                routing_keyword,
            },
        );
        let descriptors = store
            .read_all()
            .with_context(|| format!("failed to read {}", store.dir().display()))?;
        {
            let mut index = index.write();
            index.reload_all(descriptors);
            index.prune(installed);
        }
        info!(dir = %store.dir().display(), %chain, "Initial state established");

        // Spawn resource watches.

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")),
        );

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services)
                .instrument(info_span!("services")),
        );

        let watcher = ConfigWatcher::new(store, index, Duration::from_secs(poll_interval_secs));
        tokio::spawn(watcher.run().instrument(info_span!("config")));

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
