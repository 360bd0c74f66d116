use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;
use wg_gateway::config::load_with_env;
use wg_gateway::peer_registry::{FileRegistry, PeerRegistry};
use wg_gateway::subnet::{Subnet, DEFAULT_RANGE_CHUNK};
use wg_gateway::{keys, runtime};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if let Cmd::Ranges { cidr: Some(cidr), chunk } = &cli.cmd {
        init_logger("info");
        return print_ranges(&Subnet::parse(cidr)?, chunk.unwrap_or(DEFAULT_RANGE_CHUNK));
    }
    let cfg = load_with_env(cli.config)?;
    init_logger(&cfg.log_level);
    log::debug!("configuration: {cfg:?}");

    match cli.cmd {
        Cmd::Init => {
            let (pair, generated) = keys::load_or_generate(&cfg.key_dir, &cfg.key_file)?;
            let registry = FileRegistry::open(cfg.state_file.clone())?;
            if generated {
                println!("Generated server key at {}", cfg.key_path().display());
            }
            println!("Server public key: {}", pair.public_key);
            println!("Registry: {} ({} peers)", registry.path().display(), registry.list_all()?.len());
        }
        Cmd::Start => {
            if let Err(e) = runtime::start(&cfg) {
                log::error!("gateway stopped with error: {e}");
                return Err(e.into());
            }
        }
        Cmd::ListPeers => {
            let registry = FileRegistry::open(cfg.state_file.clone())?;
            for p in registry.list_all()? {
                let ip = p.assigned_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into());
                let key = if p.public_key.is_empty() { "-" } else { p.public_key.as_str() };
                let role = if p.is_gateway { " gateway" } else { "" };
                println!("{} {} {} {}{}", p.id, ip, p.status, key, role);
            }
        }
        Cmd::Ranges { cidr: _, chunk } => {
            print_ranges(&cfg.subnet()?, chunk.unwrap_or(cfg.range_chunk))?;
        }
        Cmd::ExportClientConfig { peer_id } => {
            let registry = FileRegistry::open(cfg.state_file.clone())?;
            let peer = registry.get_by_id(peer_id)?;
            let address = peer.assigned_ip.ok_or("peer has no assigned address")?;
            let server_pub = keys::public_key_from_private(&keys::load_private_key(&cfg.key_path())?)?;
            let txt = format!(
                "address=\"{}/{}\"\nserver_endpoint=\"{}\"\nserver_public_key_b64=\"{}\"\nserver_ip=\"{}\"\n",
                address, cfg.mask_bits, cfg.public_endpoint, server_pub, cfg.server_address
            );
            println!("{txt}");
            let code = qrcode::QrCode::new(txt.as_bytes())?;
            let image = code.render::<char>().quiet_zone(false).module_dimensions(2, 1).build();
            println!("{image}");
        }
    }
    Ok(())
}

fn init_logger(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn print_ranges(subnet: &Subnet, chunk: u32) -> Result<(), Box<dyn std::error::Error>> {
    for range in subnet.ranges(chunk)? {
        println!("{range} ({} addresses)", range.len());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "wg-gateway")]
#[command(version, about = "WireGuard overlay gateway")]
struct Cli {
    /// Configuration file, `gateway.toml` by default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create the server key and peer store
    Init,
    /// Bring the interface up and serve the API
    Start,
    ListPeers,
    /// Print the usable address ranges
    Ranges {
        /// Subnet to partition instead of the configured one; no config file is read
        #[arg(long)]
        cidr: Option<String>,
        #[arg(long)]
        chunk: Option<u32>,
    },
    /// Print a peer's client settings and a QR code of them
    ExportClientConfig { peer_id: Uuid },
}
