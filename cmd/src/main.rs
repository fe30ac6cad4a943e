use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cmstore::Store;
use libp2p::Multiaddr;
use log::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the registry handler and join the cluster DHT.
    Serve(ServeArgs),
    /// Standalone Peer Router operations, for debugging a running cluster
    /// without standing up the full registry handler.
    Route(RouteArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address the registry handler listens on, e.g. 0.0.0.0:5000.
    #[arg(long, default_value = "0.0.0.0:5000")]
    listen: String,

    /// Address the /metrics endpoint listens on. Unset disables it.
    #[arg(long)]
    metrics_listen: Option<String>,

    /// OCI image-layout directory this node mirrors content from.
    #[arg(long)]
    store_dir: PathBuf,

    /// Multiaddrs the DHT swarm listens on.
    #[arg(long = "dht-listen", default_value = "/ip4/0.0.0.0/tcp/4246")]
    dht_listen: Vec<Multiaddr>,

    /// Peers dialed on startup to join the existing DHT.
    #[arg(long)]
    bootstrap: Vec<Multiaddr>,

    #[arg(long, default_value = "22h")]
    reprovide_interval: humantime::Duration,

    #[arg(long, default_value = "10m")]
    resync_interval: humantime::Duration,

    /// How long to wait for the first candidate peer before falling back
    /// to origin.
    #[arg(long, default_value = "20ms")]
    resolve_timeout: humantime::Duration,

    /// How many peers to try before giving up and falling back to origin.
    #[arg(long, default_value_t = 3)]
    retry_budget: usize,

    /// Whether `latest`-tagged manifests may be served from the DHT at all.
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    resolve_latest_tag: bool,

    /// Port every cluster node serves its registry handler on, used to
    /// turn a DHT peer's bare IP into an HTTP address.
    #[arg(long, default_value_t = 5000)]
    registry_http_port: u16,
}

#[derive(clap::Args, Debug)]
struct RouteArgs {
    #[command(subcommand)]
    command: RouteCommand,
}

#[derive(Subcommand, Debug)]
enum RouteCommand {
    /// Join the DHT and print every peer reported to hold `key`.
    Resolve {
        key: String,
        #[arg(long)]
        bootstrap: Vec<Multiaddr>,
        #[arg(long, default_value = "2s")]
        timeout: humantime::Duration,
    },
    /// Join the DHT, advertise `key` once, and exit.
    AdvertiseNow {
        key: String,
        #[arg(long)]
        bootstrap: Vec<Multiaddr>,
        #[arg(long, default_value = "/ip4/0.0.0.0/tcp/0")]
        listen: Vec<Multiaddr>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    match args.command {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::Route(route_args) => route(route_args).await,
    }
}

async fn serve(args: ServeArgs) {
    let router_config = cmrouter::Config {
        listen_addrs: args.dht_listen,
        bootstrap_peers: args.bootstrap,
        reprovide_interval: args.reprovide_interval.into(),
    };
    let (router, router_handle) = cmrouter::PeerRouter::spawn(router_config)
        .await
        .expect("failed to start peer router");
    info!("peer router listening, local_peer_id={}", router.local_peer_id());

    let store: Arc<dyn Store> = cmstore::OciDirStore::open(args.store_dir)
        .await
        .expect("failed to open store directory");

    let (tracker, tracker_handle) =
        cmtracker::Tracker::spawn(store.clone(), router.clone(), args.resync_interval.into());

    let client = cmclient::Client::new().expect("failed to build oci http client");

    let state = cmregistry::AppState {
        store,
        router: router.clone(),
        client,
        ready: tracker.ready(),
        config: cmregistry::Config {
            resolve_timeout: args.resolve_timeout.into(),
            retry_budget: args.retry_budget,
            resolve_latest_tag: args.resolve_latest_tag,
            registry_http_port: args.registry_http_port,
        },
    };

    if let Some(metrics_listen) = args.metrics_listen {
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(&metrics_listen).await {
                log::error!("metrics server stopped: {e:?}");
            }
        });
    }

    let app = cmregistry::router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e:?}", args.listen));
    info!("registry handler listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await
        .unwrap();

    // Tracker first: it unadvertises every key on shutdown, which must
    // still have a live router to talk to.
    tracker.shutdown();
    let _ = tracker_handle.await;
    drop(router);
    let _ = router_handle.await;
}

async fn serve_metrics(addr: &str) -> Result<(), std::io::Error> {
    let app = axum::Router::new().route("/metrics", axum::routing::get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics listening on {addr}");
    axum::serve(listener, app).await
}

async fn metrics_handler() -> Result<String, axum::http::StatusCode> {
    cmtelemetry::gather().map_err(|e| {
        log::error!("failed to gather metrics: {e:?}");
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn route(args: RouteArgs) {
    match args.command {
        RouteCommand::Resolve { key, bootstrap, timeout } => {
            let config = cmrouter::Config {
                listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".parse().unwrap()],
                bootstrap_peers: bootstrap,
                reprovide_interval: Duration::from_secs(22 * 60 * 60),
            };
            let (router, _handle) = cmrouter::PeerRouter::spawn(config)
                .await
                .expect("failed to start peer router");
            // give the swarm a moment to connect to bootstrap peers before querying
            tokio::time::sleep(Duration::from_millis(200)).await;

            let mut peers = router.resolve(key.as_bytes(), timeout.into()).await;
            let mut found = 0;
            while let Some(peer) = tokio::time::timeout(timeout.into(), peers.recv())
                .await
                .ok()
                .flatten()
            {
                println!("{} {:?}", peer.peer_id, peer.addresses);
                found += 1;
            }
            if found == 0 {
                println!("no peers found for {key}");
            }
        }
        RouteCommand::AdvertiseNow { key, bootstrap, listen } => {
            let config = cmrouter::Config {
                listen_addrs: listen,
                bootstrap_peers: bootstrap,
                reprovide_interval: Duration::from_secs(22 * 60 * 60),
            };
            let (router, _handle) = cmrouter::PeerRouter::spawn(config)
                .await
                .expect("failed to start peer router");
            tokio::time::sleep(Duration::from_millis(200)).await;
            router
                .advertise(key.as_bytes())
                .await
                .expect("advertise failed");
            println!("advertised {key} as {}", router.local_peer_id());
            // hold the swarm open briefly so the provider record actually
            // reaches other nodes before the process exits
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_requires_store_dir() {
        let err = Args::try_parse_from(["cluster-mirror", "serve"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn serve_applies_defaults() {
        let args = Args::try_parse_from([
            "cluster-mirror",
            "serve",
            "--store-dir",
            "/var/lib/images",
        ])
        .unwrap();
        let Command::Serve(serve_args) = args.command else {
            panic!("expected Serve subcommand");
        };
        assert_eq!(serve_args.listen, "0.0.0.0:5000");
        assert_eq!(serve_args.registry_http_port, 5000);
        assert_eq!(serve_args.retry_budget, 3);
        assert!(serve_args.resolve_latest_tag);
        assert!(serve_args.metrics_listen.is_none());
        assert!(serve_args.bootstrap.is_empty());
    }

    #[test]
    fn serve_parses_repeated_bootstrap_and_listen_addrs() {
        let args = Args::try_parse_from([
            "cluster-mirror",
            "serve",
            "--store-dir",
            "/var/lib/images",
            "--bootstrap",
            "/ip4/10.0.0.1/tcp/4246",
            "--bootstrap",
            "/ip4/10.0.0.2/tcp/4246",
            "--dht-listen",
            "/ip4/0.0.0.0/tcp/4247",
        ])
        .unwrap();
        let Command::Serve(serve_args) = args.command else {
            panic!("expected Serve subcommand");
        };
        assert_eq!(serve_args.bootstrap.len(), 2);
        assert_eq!(serve_args.dht_listen.len(), 1);
    }

    #[test]
    fn serve_rejects_resolve_latest_tag_garbage() {
        Args::try_parse_from([
            "cluster-mirror",
            "serve",
            "--store-dir",
            "/var/lib/images",
            "--resolve-latest-tag",
            "maybe",
        ])
        .unwrap_err();
    }

    #[test]
    fn route_resolve_parses() {
        let args = Args::try_parse_from([
            "cluster-mirror",
            "route",
            "resolve",
            "sha256:deadbeef",
            "--timeout",
            "5s",
        ])
        .unwrap();
        let Command::Route(route_args) = args.command else {
            panic!("expected Route subcommand");
        };
        let RouteCommand::Resolve { key, timeout, bootstrap } = route_args.command else {
            panic!("expected Resolve subcommand");
        };
        assert_eq!(key, "sha256:deadbeef");
        assert_eq!(timeout.as_secs(), 5);
        assert!(bootstrap.is_empty());
    }
}
