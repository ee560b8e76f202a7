use gossip_cluster::{ClusterService, Config};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--name <name>] [--key <hex>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:7946", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:7947 --seed 127.0.0.1:7946",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut name: Option<String> = None;
    let mut key: Option<Vec<u8>> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            "--name" => {
                name = Some(args[i + 1].clone());
                i += 2;
            }
            "--key" => {
                key = Some(parse_hex_key(&args[i + 1])?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");

    let mut config = Config::lan();
    config.bind_addr = bind_addr;
    if let Some(name) = name {
        config.name = name;
    }
    config.secret_key = key;

    tracing::info!("Starting node {} on {}", config.name, bind_addr);
    if seed_nodes.is_empty() {
        tracing::info!("No seeds given, starting a fresh cluster");
    } else {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    }

    let service = ClusterService::new(config).await?;
    service.start();

    if !seed_nodes.is_empty() {
        let contacted = service.join(&seed_nodes).await?;
        tracing::info!("Synced with {} seed node(s)", contacted);
    }

    // Stats reporter:
    let stats_service = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            let alive = stats_service.alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, health score {}",
                alive.len(),
                stats_service.health_score()
            );
            for node in alive {
                tracing::info!("  - {} at {} (inc={})", node.id, node.addr, node.incarnation);
            }
        }
    });

    tracing::info!("Press Ctrl+C to leave and shut down");
    tokio::signal::ctrl_c().await?;

    service.leave().await?;
    service.shutdown().await?;
    Ok(())
}

fn parse_hex_key(hex: &str) -> anyhow::Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        anyhow::bail!("key must be an even number of hex digits");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(Into::into))
        .collect()
}
