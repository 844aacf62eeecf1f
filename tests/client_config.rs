use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use sightscan::Config;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SIGHTSCAN_CONFIG",
        "SIGHTSCAN_REGISTRY_URL",
        "SIGHTSCAN_DATA_DIR",
        "SIGHTSCAN_SYNTHETIC_CAMERAS",
        "SIGHTSCAN_HTTP_TIMEOUT_MS",
        "SIGHTSCAN_STOP_GRACE_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "registry": {
            "base_url": "http://registry.example:8080/api",
            "timeout_ms": 2500
        },
        "data_dir": "/var/lib/sightscan",
        "cameras": { "synthetic": 3 },
        "detection": { "image_size": 416, "stop_grace_ms": 1500 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SIGHTSCAN_CONFIG", file.path());
    std::env::set_var("SIGHTSCAN_STOP_GRACE_MS", "4000");

    let cfg = Config::load().expect("load config");

    assert_eq!(
        cfg.registry.base_url.as_str(),
        "http://registry.example:8080/api"
    );
    assert_eq!(cfg.registry.timeout, Duration::from_millis(2500));
    assert_eq!(cfg.data_dir, std::path::PathBuf::from("/var/lib/sightscan"));
    assert_eq!(cfg.cameras.synthetic, 3);
    assert_eq!(cfg.detection.image_size, 416);
    assert_eq!(cfg.detection.stop_grace, Duration::from_millis(4000));
    assert_eq!(
        cfg.versions_path(),
        std::path::PathBuf::from("/var/lib/sightscan/weights/versions.txt")
    );

    clear_env();
}

#[test]
fn env_only_configuration_works_with_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SIGHTSCAN_REGISTRY_URL", "https://registry.example/api");

    let cfg = Config::load().expect("load config");

    assert_eq!(cfg.registry.base_url.as_str(), "https://registry.example/api");
    assert_eq!(cfg.cameras.synthetic, 1);
    assert_eq!(cfg.detection.image_size, 640);

    clear_env();
}

#[test]
fn missing_registry_url_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = Config::load().expect_err("registry url is required");
    assert!(err.to_string().contains("registry base url"));

    clear_env();
}

#[test]
fn invalid_registry_url_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SIGHTSCAN_REGISTRY_URL", "not a url");

    assert!(Config::load().is_err());

    clear_env();
}

#[test]
fn zero_grace_period_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SIGHTSCAN_REGISTRY_URL", "http://registry.example/api");
    std::env::set_var("SIGHTSCAN_STOP_GRACE_MS", "0");

    assert!(Config::load().is_err());

    clear_env();
}
