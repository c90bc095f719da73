use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use concierge::{
    FederatedQueryPlanner, FederationGateway, GatewayConfig, GatewayError, HttpQueryExecutor,
    InMemorySchemaRegistry, server,
};

/// A GraphQL federation gateway
#[derive(Debug, Parser)]
#[command(name = "concierge", version)]
struct Args {
    /// Path to the YAML gateway configuration
    #[arg(long, short, env = "CONCIERGE_CONFIG", default_value = "schemas/supergraph.yaml")]
    config: PathBuf,
    /// Address to listen on, overriding the configuration. Defaults to 0.0.0.0:4000.
    #[arg(long, short, env = "CONCIERGE_LISTEN")]
    listen: Option<SocketAddr>,
    /// Log filter, e.g. `info` or `concierge=debug`. Falls back to RUST_LOG.
    #[arg(long = "log-level", env = "CONCIERGE_LOG_LEVEL")]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_gateway(config: &GatewayConfig) -> FederationGateway {
    let mut executor = HttpQueryExecutor::new().with_timeout(config.subgraph_timeout());
    for name in config.subgraphs.keys() {
        executor = executor.with_subgraph_timeout(name.as_str(), config.timeout_for(name));
    }

    FederationGateway::new(
        Box::new(InMemorySchemaRegistry::new()),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(executor),
    )
}

async fn run(args: Args) -> Result<(), GatewayError> {
    let config = GatewayConfig::from_file(&args.config)?;
    let gateway = Arc::new(build_gateway(&config));
    gateway.load_schemas(&config).await?;

    let addr = args.listen.unwrap_or_else(|| config.listen_addr());
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })?;
    tracing::info!("GraphQL federation gateway listening on http://{addr}{}", config.graphql_path);
    tracing::info!("GraphiQL UI available at http://{addr}/graphiql");

    #[cfg(unix)]
    spawn_reload_on_sighup(Arc::clone(&gateway), args.config.clone());

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    server::serve(listener, gateway, &config.graphql_path, shutdown).await;
    Ok(())
}

/// Recomposes from the configuration file on every SIGHUP. A failed reload
/// keeps serving the previous supergraph.
#[cfg(unix)]
fn spawn_reload_on_sighup(gateway: Arc<FederationGateway>, config_path: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(error) => {
            tracing::warn!(%error, "schema reload on SIGHUP is unavailable");
            return;
        }
    };

    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            tracing::info!(path = %config_path.display(), "reloading subgraph schemas");
            let reloaded = match GatewayConfig::from_file(&config_path) {
                Ok(config) => gateway.reload(&config).await,
                Err(error) => Err(error),
            };
            if let Err(error) = reloaded {
                tracing::error!(%error, "schema reload failed, keeping the current supergraph");
            }
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "gateway failed");
            ExitCode::FAILURE
        }
    }
}
