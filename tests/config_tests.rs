use std::fs;
use wg_gateway::config::{apply_overrides, load_server_config, ServerConfig};

#[test]
fn server_config_default_creates_file() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("gateway.toml");
    let cfg = load_server_config(Some(p.clone())).unwrap();
    assert!(p.exists());
    assert_eq!(cfg.interface_name, "wg0");
    assert_eq!(cfg.http_listen_port, 8080);
    assert_eq!(cfg.server_cidr(), "10.0.0.1/24");
    assert_eq!(cfg.key_path(), std::path::Path::new("config/keys/server_private.key"));
}

#[test]
fn partial_file_keeps_defaults_for_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("gateway.toml");
    fs::write(&p, "interface_name = \"wg-lab\"\nmask_bits = 16\n").unwrap();
    let cfg = load_server_config(Some(p)).unwrap();
    assert_eq!(cfg.interface_name, "wg-lab");
    assert_eq!(cfg.mask_bits, 16);
    assert_eq!(cfg.listen_port, 51820);
    assert!(cfg.validate().is_ok());
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("gateway.toml");
    fs::write(&p, "listen_port = \"many\"").unwrap();
    assert!(load_server_config(Some(p)).is_err());
}

#[test]
fn port_override_and_build_settings() {
    let cfg = apply_overrides(ServerConfig::default(), |k| match k {
        "PORT" => Some("9090".into()),
        "SERVER_ENDPOINT" => Some("vpn.example.net:51820".into()),
        "OUTPUT_DIR" => Some("/srv/builds".into()),
        _ => None,
    })
    .unwrap();
    assert_eq!(cfg.http_listen_port, 9090);
    let build = cfg.build_settings();
    assert_eq!(build.server_endpoint, "vpn.example.net:51820");
    assert_eq!(build.output_dir, std::path::PathBuf::from("/srv/builds"));
    assert_eq!(build.mask_bits, 24);
}
