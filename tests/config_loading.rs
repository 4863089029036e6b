//! Configuration loading from files and the environment.

use std::io::Write;

use cryomag::config::CryomagConfig;
use cryomag::coordinator::ReadMode;
use serial_test::serial;
use tempfile::NamedTempFile;

const SHIPPED: &str = include_str!("../config/cryomag.toml");

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_shipped_config_loads() {
    let file = write_config(SHIPPED);
    let config = CryomagConfig::load_from(file.path()).unwrap();

    assert_eq!(config.magnet.ramp_limits, [0.25, 0.125, 0.125]);
    assert_eq!(config.magnet.read_mode, ReadMode::Direct);
    assert_eq!(config.controllers.len(), 3);
    assert_eq!(config.sensors.heat_switch.setpoint_on, Some(20.0));
    assert_eq!(config.control.condense.sorb_setpoint, 32.0);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(SHIPPED);
    std::env::set_var("CRYOMAG_MAGNET__RAMP_PROPORTION", "0.5");
    std::env::set_var("CRYOMAG_MAGNET__READ_MODE", "cached");
    let loaded = CryomagConfig::load_from(file.path());
    std::env::remove_var("CRYOMAG_MAGNET__RAMP_PROPORTION");
    std::env::remove_var("CRYOMAG_MAGNET__READ_MODE");

    let config = loaded.unwrap();
    assert_eq!(config.magnet.ramp_proportion, 0.5);
    assert_eq!(config.magnet.read_mode, ReadMode::Cached);
}

#[test]
#[serial]
fn test_invalid_override_is_rejected() {
    let file = write_config(SHIPPED);
    std::env::set_var("CRYOMAG_MAGNET__RAMP_PROPORTION", "1.5");
    let loaded = CryomagConfig::load_from(file.path());
    std::env::remove_var("CRYOMAG_MAGNET__RAMP_PROPORTION");

    let message = format!("{:#}", loaded.unwrap_err());
    assert!(message.contains("ramp proportion"), "{}", message);
}

#[test]
#[serial]
fn test_missing_file_fails_without_sections() {
    let dir = tempfile::tempdir().unwrap();
    let result = CryomagConfig::load_from(dir.path().join("absent.toml"));
    assert!(result.is_err());
}
