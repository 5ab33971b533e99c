//! Environment overrides for the configuration.
//!
//! Environment variables are process-global, so these tests run serially.

use current_scan::config::ScanConfig;
use current_scan::error::ScanError;
use serial_test::serial;
use std::env;

struct EnvGuard(&'static [&'static str]);

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in self.0 {
            env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn environment_overrides_file_values() {
    let _guard = EnvGuard(&["CURRENT_SCAN_METER__NPLC", "CURRENT_SCAN_SOURCE__RESOURCE"]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.toml");
    std::fs::write(&path, "[meter]\nnplc = 2.0\n").unwrap();

    env::set_var("CURRENT_SCAN_METER__NPLC", "0.5");
    env::set_var("CURRENT_SCAN_SOURCE__RESOURCE", "GPIB0::5::INSTR");

    let config = ScanConfig::load_from(&path).unwrap();
    assert_eq!(config.meter.nplc, 0.5);
    assert_eq!(config.source.resource, "GPIB0::5::INSTR");
    assert_eq!(config.meter.resource, "GPIB0::14::INSTR");
}

#[test]
#[serial]
fn invalid_override_is_rejected_by_validation() {
    let _guard = EnvGuard(&["CURRENT_SCAN_SWEEP__STEP"]);
    env::set_var("CURRENT_SCAN_SWEEP__STEP", "0");

    let dir = tempfile::tempdir().unwrap();
    let result = ScanConfig::load_from(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ScanError::Configuration(_))));
}

#[test]
#[serial]
fn malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[meter]\nnplc = \"fast\"\n").unwrap();

    assert!(matches!(ScanConfig::load_from(&path), Err(ScanError::Config(_))));
}
