use crate::allocator::IpAllocator;
use crate::artifact::CargoBuilder;
use crate::config::ServerConfig;
use crate::enroll_http::spawn_api_server;
use crate::error::GatewayError;
use crate::lifecycle::InterfaceManager;
use crate::peer_registry::FileRegistry;
use crate::service::PeerService;
use crate::wg::{KernelDevice, TunnelDevice};
use log::{error, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/**
 * @brief Bring the gateway up, serve the API until Ctrl+C, then tear down.
 * @param cfg Validated configuration.
 */
pub fn start(cfg: &ServerConfig) -> Result<(), GatewayError> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down");
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| GatewayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    let registry = Arc::new(FileRegistry::open(cfg.state_file.clone())?);
    info!(
        "registry {} ready, migrations: {}",
        registry.path().display(),
        registry.applied_migrations().join(", ")
    );

    let device = KernelDevice::new(cfg.interface_name.clone()).map_err(|e| {
        error!("cannot open WireGuard control for {}: {e}", cfg.interface_name);
        e
    })?;
    let mut manager = InterfaceManager::new(device, cfg.interface_settings());
    let gateway = match manager.bring_up(&*registry) {
        Ok(g) => g,
        Err(e) => {
            error!("gateway bring-up failed: {e}");
            return Err(e.into());
        }
    };
    if gateway.key_generated {
        info!("generated new server key at {}", cfg.key_path().display());
    }
    if let Err(e) = manager.restore_peers(&*registry) {
        warn!("could not restore stored peers: {e}");
    }

    let allocator = IpAllocator::for_subnet(cfg.subnet()?, cfg.max_retries)?;
    let device: Arc<dyn TunnelDevice> = manager.device();
    let service = PeerService::new(
        registry,
        allocator,
        Arc::new(CargoBuilder::new(cfg.build_settings())),
        gateway.public_key.clone(),
        cfg.range_chunk,
    )
    .with_device(device);

    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.http_listen_port));
    let api = spawn_api_server(bind, Arc::new(service), cfg.output_dir.clone(), cfg.http_workers)?;
    info!(
        "gateway {} serving {} on {}, API at http://{}",
        gateway.peer_id,
        cfg.server_cidr(),
        cfg.interface_name,
        api.local_addr()
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(500));
    }

    api.shutdown();
    if let Err(e) = manager.teardown() {
        warn!("interface teardown failed: {e}");
    }
    info!("gateway stopped cleanly");
    Ok(())
}
