//! Integration tests for layered configuration loading.

use seatrack::config::{SerialSettings, Settings};
use seatrack::error::DaqError;
use seatrack::track::SaveMode;
use serial_test::serial;
use std::fs;

const SAMPLE: &str = r#"
[serial.anemometer]
port = "/dev/ttyUSB1"
baudrate = 115200
topics = ["rm2/wind/speed", "rm2/wind/direction"]

[mqtt]
hostname = "broker.local"
topics = "rm1/gps/lat"

[aggregator]
interval = 2.0

[saving]
default_mode = "on-demand"

[units]
rm2 = "Anemometer"
"#;

#[test]
#[serial]
fn test_file_values_override_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("seatrack.toml");
    fs::write(&path, SAMPLE).expect("write config");

    let settings = Settings::load_from(&path).expect("load");
    let port = &settings.serial["anemometer"];
    assert_eq!(port.baudrate, 115200);
    assert_eq!(port.topics.len(), 2);
    let mqtt = settings.mqtt.as_ref().expect("mqtt section");
    assert_eq!(mqtt.hostname, "broker.local");
    assert_eq!(mqtt.port, 1883);
    assert_eq!(mqtt.topics, vec!["rm1/gps/lat"]);
    assert_eq!(settings.aggregator.interval, 2.0);
    assert_eq!(settings.saving.default_mode, SaveMode::OnDemand);
    assert_eq!(settings.track.checkpoint_interval, 30.0);
    assert_eq!(settings.unit_name("rm2"), "Anemometer");
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("seatrack.toml");
    fs::write(&path, SAMPLE).expect("write config");

    std::env::set_var("SEATRACK_AGGREGATOR__INTERVAL", "0.5");
    std::env::set_var("SEATRACK_TRACK__MAX_DATAPOINTS", "500");
    let loaded = Settings::load_from(&path);
    std::env::remove_var("SEATRACK_AGGREGATOR__INTERVAL");
    std::env::remove_var("SEATRACK_TRACK__MAX_DATAPOINTS");

    let settings = loaded.expect("load");
    assert_eq!(settings.aggregator.interval, 0.5);
    assert_eq!(settings.track.max_datapoints, 500);
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::load_from(dir.path().join("absent.toml")).expect("defaults");
    assert_eq!(settings, Settings::default());
}

#[test]
#[serial]
fn test_single_port_file_configures_only_that_port() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("seatrack.toml");
    fs::write(
        &path,
        "[serial.deck]\nport = \"/dev/ttyUSB3\"\ntopics = \"rm5/wind/speed\"\n",
    )
    .expect("write config");

    let settings = Settings::load_from(&path).expect("load");
    let ports: Vec<&str> = settings.serial.keys().map(String::as_str).collect();
    assert_eq!(ports, vec!["deck"]);
    assert!(settings.mqtt.is_none(), "no broker unless configured");
    assert!(settings.units.is_empty());
    let addresses: Vec<String> = settings
        .configured_addresses()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(addresses, vec!["rm5/wind/speed"]);
}

#[test]
#[serial]
fn test_invalid_file_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("seatrack.toml");
    fs::write(
        &path,
        "[status]\ntimeout_noncomm = 90.0\ntimeout_offline = 60.0\n",
    )
    .expect("write config");
    assert!(matches!(
        Settings::load_from(&path),
        Err(DaqError::Configuration(_))
    ));
}

#[test]
fn test_shipped_configuration_is_valid() {
    let text = fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/config/seatrack.toml"))
        .expect("shipped config");
    let settings = Settings::from_toml_str(&text).expect("valid");
    assert_eq!(settings.communicator.conversions.len(), 1);
    assert_eq!(settings.configured_addresses().len(), 5);
}

#[test]
#[serial]
fn test_written_settings_load_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.serial.insert(
        "deck".to_string(),
        SerialSettings {
            port: "/dev/ttyUSB3".to_string(),
            baudrate: 57600,
            topics: vec!["rm5/wind/speed".to_string()],
            enabled: true,
        },
    );
    settings.communicator.max_values = 20;
    settings.track.max_checkpoint_files = 5;
    settings.files.output_dir = dir.path().join("tracks");

    let path = dir.path().join("written.toml");
    fs::write(&path, toml::to_string(&settings).expect("serialize")).expect("write config");
    let loaded = Settings::load_from(&path).expect("load");

    assert_eq!(loaded.communicator.max_values, 20);
    assert_eq!(loaded.track.max_checkpoint_files, 5);
    assert_eq!(loaded.files.output_dir, dir.path().join("tracks"));
    assert_eq!(loaded.serial, settings.serial);
    assert!(loaded.mqtt.is_none());
    assert_eq!(loaded, settings);
}
