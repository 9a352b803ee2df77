//! SKYLINK CLI
//!
//! Relay server, discovery and gateway tooling for inter-cloud service use.

mod config;

use clap::{Parser, Subcommand};
use skylink_core::gatekeeper::SharedSecret;
use skylink_core::gateway::RelaySpec;
use skylink_core::orchestrator::{AllowAll, MemorySelectionStore};
use skylink_core::{
    Cloud, CloudIdentity, Gatekeeper, GatewayConnectionRequest, InterCloudOrchestrator,
    PollRequest, PollResponder, PreferredProvider, ProviderMatchmaker, SelectionOutcome,
    ServiceQuery, SystemDescriptor, TunnelBroker, TunnelResponder,
};
use skylink_crypto::TunnelKeypair;
use skylink_relay::{RelaySessionCache, UdpConnector, UdpRelayServer, UdpRelayServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use config::Config;

/// SKYLINK - service discovery and tunnelling between clouds over shared relays
#[derive(Parser)]
#[command(name = "skylink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a store-and-forward relay server
    Relay {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:61616")]
        bind: SocketAddr,

        /// Maximum registered clients
        #[arg(long)]
        max_clients: Option<usize>,
    },

    /// Poll every configured cloud for a service
    Discover {
        /// Service definition
        #[arg(required = true)]
        service: String,

        /// Required interface (repeatable)
        #[arg(short, long)]
        interface: Vec<String>,

        /// Preferred cloud as name.operator (repeatable, in priority order)
        #[arg(short, long)]
        prefer: Vec<String>,

        /// Ask providers for their gateway key
        #[arg(long)]
        gateway: bool,
    },

    /// Answer discovery polls and accept tunnels for the configured services
    Serve,

    /// Discover a service, tunnel to the chosen provider and expose it locally
    Connect {
        /// Service definition
        #[arg(required = true)]
        service: String,

        /// Required interface (repeatable)
        #[arg(short, long)]
        interface: Vec<String>,

        /// Preferred cloud as name.operator (repeatable, in priority order)
        #[arg(short, long)]
        prefer: Vec<String>,

        /// Name of the consuming system
        #[arg(long, default_value = "skylink-cli")]
        system: String,
    },

    /// Generate a gateway keypair
    Keygen {
        /// Output file for the private key (defaults to node.key_file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration and print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Relay { bind, max_clients } => {
            run_relay(bind, max_clients).await?;
        }
        Commands::Discover {
            service,
            interface,
            prefer,
            gateway,
        } => {
            discover(service, interface, prefer, gateway, &config).await?;
        }
        Commands::Serve => {
            serve(&config).await?;
        }
        Commands::Connect {
            service,
            interface,
            prefer,
            system,
        } => {
            connect(service, interface, prefer, system, &config).await?;
        }
        Commands::Keygen { output, force } => {
            generate_keypair(output, force, &config)?;
        }
        Commands::CheckConfig => {
            check_config(&config)?;
        }
    }

    Ok(())
}

/// Run the relay server until interrupted
async fn run_relay(bind: SocketAddr, max_clients: Option<usize>) -> anyhow::Result<()> {
    let mut server_config = UdpRelayServerConfig::default();
    if let Some(max_clients) = max_clients {
        server_config.max_clients = max_clients;
    }
    let server = UdpRelayServer::bind_with_config(bind, server_config).await?;
    println!("Relay listening on {}", server.local_addr()?);
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Relay shutting down");
        }
    }
    Ok(())
}

fn parse_cloud(text: &str) -> anyhow::Result<CloudIdentity> {
    match text.split_once('.') {
        Some((name, operator)) if !name.is_empty() && !operator.is_empty() => {
            Ok(CloudIdentity::new(name, operator))
        }
        _ => anyhow::bail!("cloud '{}' must be written as name.operator", text),
    }
}

fn poll_request(
    service: String,
    interfaces: Vec<String>,
    gateway: bool,
    config: &Config,
) -> PollRequest {
    let query = interfaces
        .into_iter()
        .fold(ServiceQuery::new(service), |query, i| query.with_interface(i));
    let request = PollRequest::new(query, config.identity());
    if gateway { request.with_gateway() } else { request }
}

fn preferences(prefer: &[String]) -> anyhow::Result<Vec<PreferredProvider>> {
    prefer
        .iter()
        .map(|p| parse_cloud(p).map(PreferredProvider::cloud))
        .collect()
}

fn connector_cache() -> Arc<RelaySessionCache> {
    RelaySessionCache::new(Arc::new(UdpConnector::new()))
}

/// Poll all configured clouds and show what the matchmaker would pick
async fn discover(
    service: String,
    interfaces: Vec<String>,
    prefer: Vec<String>,
    gateway: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let clouds = config.clouds()?;
    if clouds.is_empty() {
        anyhow::bail!("No clouds configured to poll");
    }
    let preferred = preferences(&prefer)?;
    let core = config.to_core();

    let cache = connector_cache();
    let gatekeeper = Gatekeeper::new(Arc::clone(&cache), core.gatekeeper);
    let request = poll_request(service, interfaces, gateway, config);
    println!(
        "Polling {} cloud(s) for '{}'",
        clouds.len(),
        request.query.service_definition
    );

    let outcome = gatekeeper.global_service_discovery(&clouds, request).await;
    for result in &outcome.results {
        match &result.outcome {
            Ok(answer) => {
                println!("  {}: {} provider(s)", result.cloud, answer.providers.len());
                for provider in &answer.providers {
                    println!(
                        "      {} at {}:{}",
                        provider.system_name, provider.address, provider.port
                    );
                }
            }
            Err(failure) => println!("  {}: {}", result.cloud, failure),
        }
    }
    println!(
        "{} answered, {} failed",
        outcome.success_count(),
        outcome.failure_count()
    );

    let matchmaker = ProviderMatchmaker::new(core.matchmaking.strategy);
    match matchmaker.select(
        &outcome.results,
        &preferred,
        core.matchmaking.store_on_no_match,
    ) {
        Ok(SelectionOutcome::Selected(selection)) => {
            print!("Selected {}", selection.answer.provider_cloud);
            if let Some(provider) = &selection.provider {
                print!(" / {}", provider.system_name);
            }
            println!(
                "{}",
                if selection.matched_preference {
                    " (preferred)"
                } else {
                    ""
                }
            );
        }
        Ok(SelectionOutcome::NoSelection) => println!("No preferred provider answered"),
        Err(e) => println!("No selection: {}", e),
    }

    cache.close_all().await;
    Ok(())
}

/// Serve discovery polls and tunnels for the local cloud until interrupted
async fn serve(config: &Config) -> anyhow::Result<()> {
    let relays = config.local_relays()?;
    if relays.is_empty() {
        anyhow::bail!("No local relays configured");
    }
    let keypair = Arc::new(config.load_keypair()?);
    let identity = config.identity();
    let core = config.to_core();
    let cache = connector_cache();

    let registry = Arc::new(config.service_registry());
    let mut responder = PollResponder::new(identity.clone(), registry.clone())
        .with_gateway_key(keypair.public_key());
    if let Some(secret) = &config.node.authentication_info {
        responder = responder.with_authenticator(Arc::new(SharedSecret(secret.clone())));
    }
    let responder = Arc::new(responder);

    let mut leases = Vec::new();
    let mut pollers = Vec::new();
    for relay in relays.iter().filter(|r| r.relay_type.carries_discovery()) {
        let lease = cache
            .get_or_create(&relay.address, relay.port, relay.secure)
            .await?;
        println!("Answering polls on {}:{}", relay.address, relay.port);
        pollers.push(Arc::clone(&responder).spawn(Arc::clone(lease.session())));
        leases.push(lease);
    }

    let gateway = match relays.iter().find(|r| r.relay_type.carries_tunnels()) {
        Some(relay) => {
            let tunnels = TunnelResponder::bind(
                Arc::clone(&cache),
                relay,
                identity.clone(),
                Arc::clone(&keypair),
                registry,
                core.gateway,
            )
            .await?;
            println!("Accepting tunnels on {}:{}", relay.address, relay.port);
            Some(tokio::spawn(tunnels.run()))
        }
        None => {
            tracing::warn!("No tunnel-capable local relay; tunnels will not be accepted");
            None
        }
    };

    println!("Cloud {} serving {} service(s)", identity, config.services.len());
    println!("Gateway key: {}", keypair.public_key().to_base64());
    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    for poller in &pollers {
        poller.abort();
    }
    if let Some(gateway) = &gateway {
        gateway.abort();
    }
    for lease in leases {
        lease.release().await;
    }
    cache.close_all().await;
    Ok(())
}

fn find_cloud<'a>(clouds: &'a [Cloud], identity: &CloudIdentity) -> anyhow::Result<&'a Cloud> {
    clouds
        .iter()
        .find(|c| &c.identity == identity)
        .ok_or_else(|| anyhow::anyhow!("Selected cloud {} is not configured", identity))
}

/// Discover, select, then expose the chosen provider on a local port
async fn connect(
    service: String,
    interfaces: Vec<String>,
    prefer: Vec<String>,
    system: String,
    config: &Config,
) -> anyhow::Result<()> {
    let clouds = config.clouds()?;
    let preferred = preferences(&prefer)?;
    let core = config.to_core();
    let cache = connector_cache();

    let orchestrator = InterCloudOrchestrator::new(
        Arc::new(Gatekeeper::new(Arc::clone(&cache), core.gatekeeper)),
        Arc::new(AllowAll),
        Arc::new(MemorySelectionStore::new()),
        core.matchmaking,
    );
    let request = poll_request(service.clone(), interfaces, true, config);
    let SelectionOutcome::Selected(selection) =
        orchestrator.orchestrate(&clouds, request, &preferred).await?
    else {
        anyhow::bail!("No preferred provider answered for '{}'", service);
    };

    let provider_cloud = find_cloud(&clouds, &selection.answer.provider_cloud)?;
    let relay = provider_cloud.tunnel_relay().ok_or_else(|| {
        anyhow::anyhow!("Cloud {} has no tunnel-capable relay", provider_cloud.identity)
    })?;
    let key = selection.answer.gateway_public_key.clone().ok_or_else(|| {
        anyhow::anyhow!("Cloud {} did not advertise a gateway", provider_cloud.identity)
    })?;
    let provider = selection
        .provider
        .ok_or_else(|| anyhow::anyhow!("Cloud {} listed no providers", provider_cloud.identity))?;
    println!(
        "Selected {} / {} at {}:{}",
        provider_cloud.identity, provider.system_name, provider.address, provider.port
    );

    let request = GatewayConnectionRequest {
        relay: Some(RelaySpec::from(relay)),
        consumer: Some(SystemDescriptor::new(
            system,
            core.gateway.bind_address.to_string(),
            *core.gateway.port_range.start(),
        )),
        provider: Some(provider),
        consumer_cloud: Some(config.identity()),
        provider_cloud: Some(provider_cloud.identity.clone()),
        service_definition: service,
        provider_gateway_public_key: key,
    };

    let broker = TunnelBroker::new(Arc::clone(&cache), core.gateway.clone());
    let exposed = broker.expose_local(&request).await?;
    println!(
        "Tunnel {} ready on {}:{}",
        hex::encode(exposed.session_id),
        core.gateway.bind_address,
        exposed.port
    );

    let (sent, received) = exposed.join().await?;
    println!(
        "Tunnel finished: {} sent, {} received",
        format_bytes(sent),
        format_bytes(received)
    );
    cache.close_all().await;
    Ok(())
}

/// Generate a gateway keypair
fn generate_keypair(output: Option<PathBuf>, force: bool, config: &Config) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(|| config.node.key_file.clone());
    if path.exists() && !force {
        anyhow::bail!("{} exists (use --force to overwrite)", path.display());
    }

    println!("Generating new X25519 gateway keypair...");
    let keypair = TunnelKeypair::generate();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let private_bytes = Zeroizing::new(keypair.private_key().to_bytes());
    std::fs::write(&path, private_bytes.as_slice())?;

    println!("Public key: {}", keypair.public_key().to_base64());
    println!("Private key saved to: {}", path.display());
    println!("\nKeep this file secure! It contains your gateway private key.");
    Ok(())
}

/// Print what the configuration describes
fn check_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration OK");
    println!("Cloud: {}", config.identity());
    println!("Local relays: {}", config.relays.len());
    for cloud in config.clouds()? {
        println!(
            "  neighbor {} via {} relay(s){}",
            cloud.identity,
            cloud.relays.len(),
            if cloud.discovery_relay().is_none() {
                " (no discovery relay)"
            } else {
                ""
            }
        );
    }
    println!("Services: {}", config.services.len());
    match config.load_keypair() {
        Ok(keypair) => println!("Gateway key: {}", keypair.public_key().to_base64()),
        Err(e) => println!("Gateway key: unavailable ({})", e),
    }
    Ok(())
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cloud() {
        assert_eq!(
            parse_cloud("testcloud2.elte").unwrap(),
            CloudIdentity::new("testcloud2", "elte")
        );
        assert!(parse_cloud("testcloud2").is_err());
        assert!(parse_cloud(".elte").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn test_poll_request_carries_interfaces() {
        let config = Config::default();
        let request = poll_request("echo".into(), vec!["TCP".into()], true, &config);
        assert_eq!(request.query.interface_requirements, vec!["TCP".to_string()]);
        assert!(request.gateway_is_present);
        assert_eq!(request.requester, config.identity());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "skylink", "discover", "echo", "-p", "testcloud2.elte", "--gateway",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Discover { gateway: true, .. }));
    }
}
