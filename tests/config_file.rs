// tests/config_file.rs
// Loading and saving node configuration on disk

use std::time::Duration;

use dkg_node::config::validate_config;
use dkg_node::config_manager::NodeConfig;

#[test]
fn missing_file_is_created_with_an_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let created = NodeConfig::load_from(&path).unwrap();
    assert!(path.exists());
    assert!(created.peer_id().is_ok());

    // a second load reads the same identity back
    let loaded = NodeConfig::load_from(&path).unwrap();
    assert_eq!(loaded.identity.peer_id, created.identity.peer_id);
}

#[test]
fn edited_values_survive_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let mut config = NodeConfig::default();
    config.ensure_identity();
    config.network.bootstrap_peers = vec!["10.0.0.1:9000".into(), "10.0.0.2:9000".into()];
    config.rate_limit.blacklist_minutes = 5;
    config.sessions.max_open_sessions = 42;
    config.save_to(&path).unwrap();

    let loaded = NodeConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);

    let service = loaded.service_config();
    assert_eq!(service.max_open_sessions, 42);
    assert_eq!(service.guard.blacklist_window, Duration::from_secs(300));
    assert!(validate_config(&loaded).valid);
}

#[test]
fn corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(NodeConfig::load_from(&path).is_err());
}
