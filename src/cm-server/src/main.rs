//! Communication Manager process: loads configuration, wires C2-C11
//! together, serves the SM gRPC endpoint, and drives the cloud link until a
//! clean shutdown signal (spec.md §6 "Exit codes").

mod blob_provider;
mod config;
mod network_bridge;
mod provisioning;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cm_cloudlink::cert_provider::{CertProviderItf, FileCertChangeStream, FileCertProvider};
use cm_cloudlink::cert_watcher::{CertWatcher, RestartHook};
use cm_cloudlink::fanout;
use cm_cloudlink::link::{CloudLink, CloudLinkConfig};
use cm_cloudlink::transport::TlsCredentials;
use cm_network::dns::DnsController;
use cm_network::manager::NetworkManager;
use cm_network::storage::{InMemoryStorage, NetworkManagerStorage};
use cm_network::subnet_pool::{NoRoutes, SubnetPool};
use cm_proto::sm::sm_service_server::SmServiceServer;
use cm_smcontroller::controller::SmController;
use tokio::sync::{mpsc, watch};
use tonic::transport::Server;
use tracing::{error, info, warn};

use blob_provider::CloudBlobInfoProvider;
use config::{Args, Config};

/// How often the cert watcher polls `cert.pem`'s mtime (spec.md §4.10).
const CERT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Delay between a rotation being observed and the cloud link/SM controller
/// restart it triggers (spec §4.10 "≈1s").
const CERT_RESTART_DELAY: Duration = Duration::from_secs(1);

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = <Args as clap::Parser>::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the tokio runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("cm: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load(&args.config).context("loading configuration")?;
    let bind_addr: SocketAddr = config.cm_server_url.parse().context("parsing cmServerUrl as a bind address")?;

    if let Some(disk_encryption_cmd) = config.disk_encryption_cmd.as_deref() {
        provisioning::run_command(disk_encryption_cmd).context("running diskEncryptionCmd")?;
    }

    let cert_provider = FileCertProvider::new(config.cert_storage_dir(), &config.ca_cert);
    let (credentials, system_id) = match cert_provider.load().await {
        Ok(loaded) => loaded,
        Err(load_err) => {
            let Some(start_cmd) = config.start_provisioning_cmd.as_deref() else {
                return Err(load_err).context("loading TLS credentials (not in provisioning mode, spec.md §7 fatal)");
            };
            warn!("TLS credentials not found; running startProvisioningCmd");
            provisioning::run_command(start_cmd).context("running startProvisioningCmd")?;
            let loaded = cert_provider.load().await.context("loading TLS credentials after provisioning")?;
            if let Some(finish_cmd) = config.finish_provisioning_cmd.as_deref() {
                provisioning::run_command(finish_cmd).context("running finishProvisioningCmd")?;
            }
            loaded
        }
    };

    let storage: Arc<dyn NetworkManagerStorage> = Arc::new(InMemoryStorage::new());
    let dns = Arc::new(DnsController::new(config.working_dir.join("dns"), bind_addr.ip().to_string()));
    let subnet_pool = SubnetPool::new(Box::new(NoRoutes));
    let network_manager = Arc::new(NetworkManager::load(subnet_pool, storage, dns).await.context("restoring persisted network state")?);
    info!(instances = network_manager.list_instances().await.len(), "recovered network state");

    let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<TlsCredentials>();
    let cert_watcher_task = spawn_cert_watcher(&config, restart_tx);

    let mut credentials = credentials;
    loop {
        let stack = spawn_cloud_stack(&config, bind_addr, system_id.clone(), credentials).context("building cloud link")?;

        let next_credentials = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for shutdown signal")?;
                info!("shutdown requested");
                stack.stop().await;
                cert_watcher_task.abort();
                return Ok(());
            }
            Some(new_credentials) = restart_rx.recv() => {
                info!("certificate rotation detected, restarting cloud link and SM controller");
                stack.stop().await;
                new_credentials
            }
        };
        credentials = next_credentials;
    }
}

/// Everything that depends on the current TLS credentials: the cloud link,
/// the SM controller (whose blob provider holds an `Arc<CloudLink>`), and
/// the tasks wired between them. Rebuilt wholesale on certificate rotation
/// (spec.md §4.10 "Stop, Start of the cloud link and SM controller").
struct CloudStack {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
    sm_controller: Arc<SmController>,
}

impl CloudStack {
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, "task did not shut down cleanly: {e}");
            }
        }
        self.sm_controller.shutdown().await;
    }
}

fn spawn_cloud_stack(config: &Config, bind_addr: SocketAddr, system_id: String, credentials: TlsCredentials) -> Result<CloudStack, cm_ore::error::CmError> {
    let (sm_events_tx, sm_events_rx) = mpsc::unbounded_channel();

    let cloud_link_config = CloudLinkConfig {
        system_id,
        discovery_url: config.service_discovery_url.clone(),
        cloud_response_wait_timeout: config.cloud_response_wait_timeout,
        reconnect_floor: config.cm_reconnect_timeout,
        max_retries: 4,
    };
    let (cloud_link, cloud_inbound_rx) = CloudLink::new(cloud_link_config, credentials)?;

    let blob_info_provider = Arc::new(CloudBlobInfoProvider::new(cloud_link.clone()));
    let sm_controller = Arc::new(SmController::new(blob_info_provider, sm_events_tx));

    let (stop_tx, stop_rx) = watch::channel(false);

    let grpc_task = cm_ore::task::spawn(|| "sm-grpc-server", serve_sm_grpc(bind_addr, sm_controller.clone(), stop_rx.clone()));
    let cloud_run_task = cm_ore::task::spawn(|| "cloud-link", cloud_link.clone().run(stop_rx.clone()));
    let fanout_task = cm_ore::task::spawn(|| "upstream-fanout", fanout::run(sm_events_rx, cloud_link.clone()));
    let dispatch_task = cm_ore::task::spawn(|| "cloud-inbound-dispatch", network_bridge::dispatch_inbound(cloud_inbound_rx));
    let events_task = cm_ore::task::spawn(|| "cloud-connection-events", broadcast_connection_events(cloud_link.subscribe(), sm_controller.clone()));

    Ok(CloudStack {
        stop_tx,
        tasks: vec![("grpc", grpc_task), ("cloud-link", cloud_run_task), ("fanout", fanout_task), ("dispatch", dispatch_task), ("events", events_task)],
        sm_controller,
    })
}

fn spawn_cert_watcher(config: &Config, restart_tx: mpsc::UnboundedSender<TlsCredentials>) -> tokio::task::JoinHandle<()> {
    let provider = FileCertProvider::new(config.cert_storage_dir(), &config.ca_cert);
    let stream = FileCertChangeStream::new(provider, CERT_POLL_INTERVAL);
    let (watcher, _state_rx) = CertWatcher::new(CERT_RESTART_DELAY);
    let restart: RestartHook = Arc::new(move |new_credentials| {
        let restart_tx = restart_tx.clone();
        Box::pin(async move {
            let _ = restart_tx.send(new_credentials);
        })
    });
    cm_ore::task::spawn(|| "cert-watcher", async move { watcher.run(stream, restart).await })
}

async fn serve_sm_grpc(bind_addr: SocketAddr, sm_controller: Arc<SmController>, mut stop_rx: watch::Receiver<bool>) {
    let server = Server::builder().add_service(SmServiceServer::from_arc(sm_controller)).serve_with_shutdown(bind_addr, async move {
        let _ = stop_rx.changed().await;
    });
    if let Err(e) = server.await {
        error!("SM gRPC server failed: {e}");
    }
}

async fn broadcast_connection_events(mut events: tokio::sync::broadcast::Receiver<cm_cloudlink::link::ConnectionEvent>, sm_controller: Arc<SmController>) {
    use cm_cloudlink::link::ConnectionEvent;
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected) => sm_controller.broadcast_cloud_connected(true).await,
            Ok(ConnectionEvent::Disconnected) => sm_controller.broadcast_cloud_connected(false).await,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "connection event subscriber lagged"),
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
