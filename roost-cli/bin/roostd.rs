use std::sync::Arc;

use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use bollard::Docker;
use clap::Parser;
use roost_cli::{CliError, CliResult, Command, RoostdArgs};
use roost_core::{
    config::{Config, ConfigHandle},
    environment::docker::DockerEnvironmentFactory,
    remote::{self, PanelClient},
    server::Manager,
};
use roost_server::{route, state::AppState};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

//--------------------------------------------------------------------------------------------------
// Functions: Main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
pub async fn main() -> CliResult<()> {
    let args = RoostdArgs::parse();

    match args.command {
        Some(Command::Configure {
            ref panel_url,
            ref token,
            ref node,
            r#override,
            allow_insecure,
        }) => {
            configure(
                &args,
                panel_url,
                token,
                node,
                r#override,
                allow_insecure,
            )
            .await
        }
        Some(Command::Diagnostics) => diagnostics(&args).await,
        None => run_daemon(&args).await,
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Daemon
//--------------------------------------------------------------------------------------------------

async fn run_daemon(args: &RoostdArgs) -> CliResult<()> {
    let config = Config::from_path(&args.config)?;

    init_tracing(args.debug || *config.get_debug());
    tracing::info!("loaded node configuration from {}", args.config.display());

    let handle = ConfigHandle::new(config);
    let snapshot = handle.snapshot();

    // The container runtime client is process-wide; a node that cannot reach
    // it is not usable, so startup fails here rather than limping along.
    let docker = Arc::new(
        Docker::connect_with_local_defaults()
            .map_err(|err| CliError::Startup(format!("could not connect to docker: {}", err)))?,
    );
    docker
        .ping()
        .await
        .map_err(|err| CliError::Startup(format!("docker daemon is unreachable: {}", err)))?;

    let panel = if snapshot.get_remote().is_empty() {
        tracing::warn!("no panel URL configured, running without remote sync");
        None
    } else {
        Some(Arc::new(PanelClient::new(handle.clone())?))
    };

    let factory = Arc::new(DockerEnvironmentFactory::new(docker));
    let manager = Manager::new(handle.clone(), factory, panel.clone());

    if panel.is_some() {
        match manager.sync_from_panel().await {
            Ok(count) => tracing::info!("synced {} server configurations from the panel", count),
            Err(err) => tracing::warn!("panel sync failed, continuing with on-disk state: {}", err),
        }
    }

    let loaded = manager.init().await?;
    println!(
        "{} Managing {} servers on this node",
        console::style("✔").green(),
        loaded
    );

    if *snapshot.get_api().get_ssl().get_enabled() {
        tracing::warn!(
            "api.ssl is enabled in the configuration; terminate TLS in front of the daemon"
        );
    }

    let state = AppState::new(handle.clone(), Arc::clone(&manager), panel);
    let app = route::create_router(state).layer(cors_layer(&snapshot));

    let address = format!(
        "{}:{}",
        snapshot.get_api().get_host(),
        snapshot.get_api().get_port()
    );
    tracing::info!("starting api server on {}", address);
    println!(
        "{} API listening on {}",
        console::style("✔").green(),
        console::style(&address).yellow()
    );

    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager
        .broadcast_console("The node this server is running on is shutting down.")
        .await;

    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE]);

    let origins: Vec<HeaderValue> = config
        .get_allowed_origins()
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() || config.get_allowed_origins().iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install the SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Subcommands
//--------------------------------------------------------------------------------------------------

async fn configure(
    args: &RoostdArgs,
    panel_url: &str,
    token: &str,
    node: &str,
    overwrite: bool,
    allow_insecure: bool,
) -> CliResult<()> {
    init_tracing(args.debug);

    if args.config.exists() && !overwrite {
        eprintln!(
            "A configuration file already exists at {}; pass --override to replace it.",
            args.config.display()
        );
        std::process::exit(1);
    }

    match remote::configure_from_panel(panel_url, token, node, &args.config, allow_insecure).await
    {
        Ok(()) => {
            println!(
                "{} Successfully configured roost for node {}",
                console::style("✔").green(),
                node
            );
            Ok(())
        }
        Err(roost_core::RoostError::Unauthorized) => {
            eprintln!("The credentials provided were not valid for the panel.");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Failed to fetch the configuration from the panel: {}", err);
            std::process::exit(1);
        }
    }
}

async fn diagnostics(args: &RoostdArgs) -> CliResult<()> {
    println!("roostd {}", env!("CARGO_PKG_VERSION"));
    println!("platform: {}/{}", std::env::consts::OS, std::env::consts::ARCH);
    println!();

    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.version().await {
            Ok(version) => {
                println!(
                    "docker: {} (api {})",
                    version.version.unwrap_or_default(),
                    version.api_version.unwrap_or_default()
                );
            }
            Err(err) => println!("docker: unreachable ({})", err),
        },
        Err(err) => println!("docker: connection failed ({})", err),
    }
    println!();

    match Config::from_path(&args.config) {
        Ok(config) => {
            println!("configuration ({}):", args.config.display());
            println!("{}", serde_yaml::to_string(&config.redacted())?);
        }
        Err(err) => println!("configuration: {}", err),
    }

    Ok(())
}
