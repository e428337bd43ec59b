//! Configuration file loading

use carpd::{Config, ConfigError};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

fn write_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("carpd-{}-{name}.yaml", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_load_full_file() {
    let path = write_config(
        "full",
        r#"
logging:
  level: debug
  format: json

options:
  preempt: true
  log_bad_packets: false

watcher:
  poll_interval: 500ms

routers:
  - name: gateway
    vhid: 10
    advbase: 2
    advskew: 50
    password: hunter2
    addresses:
      - 192.168.10.1
      - 2001:db8::1
  - name: standby
    vhid: 11
    addresses: [192.168.11.1]
    enabled: false
"#,
    );

    let config = Config::load(Some(&path)).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.logging.level(), "debug");
    assert!(config.logging.is_json());
    assert_eq!(config.watcher.poll_interval, Duration::from_millis(500));

    let options = config.carp_options();
    assert!(options.preempt);
    assert!(!options.log_bad_packets);
    assert!(options.allow);

    assert_eq!(config.routers.len(), 2);
    let gateway = &config.routers[0];
    assert_eq!(gateway.addresses.len(), 2);
    assert_eq!(gateway.addresses[1], "2001:db8::1".parse::<IpAddr>().unwrap());

    let request = gateway.request();
    assert_eq!(request.vhid, Some(10));
    let timing = request.timing.unwrap();
    assert_eq!((timing.base, timing.skew), (2, 50));
    assert_eq!(&request.key.unwrap()[..7], b"hunter2");

    assert!(!config.routers[1].enabled);
}

#[test]
fn test_load_invalid_file() {
    let path = write_config(
        "invalid",
        r#"
routers:
  - name: gateway
    vhid: 10
    advbase: 0
    addresses: [192.168.10.1]
"#,
    );

    let result = Config::load_from_file(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

#[test]
fn test_load_malformed_yaml() {
    let path = write_config("malformed", "routers: [name: {");

    let result = Config::load_from_file(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn test_explicit_path_must_exist() {
    let path = std::env::temp_dir().join("carpd-does-not-exist.yaml");
    assert!(matches!(
        Config::load(Some(&path)),
        Err(ConfigError::FileNotFound(p)) if p == path
    ));
}
