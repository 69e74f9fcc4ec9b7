//! Experiment Run Test Suite
//!
//! Calibrates and acquires through the application layer with the simulated
//! bridge, checking the files a run leaves behind.
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_calibrate_writes_calibration` | pedestal and vernier files created |
//! | `test_calibration_directory_reused` | second calibration refused |
//! | `test_acquire_writes_outputs` | CSV rows, integrals and settings snapshot |
//! | `test_output_directory_reused` | second run into the same directory refused |
//! | `test_acquire_without_calibration` | missing calibration reported |
//! | `test_load_tree_from_file` | configuration file drives a full run |

use std::fs;
use std::path::Path;

use daq_driver_caen::v1729::SAMPLES_PER_CHANNEL;
use serde_json::{json, Value};
use vme_daq::config::load_tree;
use vme_daq::experiment::{
    self, ExperimentConfig, INTEGRALS_FILE, PULSES_FILE, SETTINGS_FILE,
};

// =============================================================================
// Helpers
// =============================================================================

fn tree(dir: &Path) -> Value {
    json!({
        "experiment": {
            "name": "pmtTest",
            "calibrationDirectory": dir.join("calibration"),
            "outputDirectory": dir.join("run"),
            "nPulses": 2,
            "nIntegratedPulses": 5,
            "integrationRange": [980, 1060],
            "nPedestal": 3
        },
        "bridge": {
            "model": "V2718",
            "linkIndex": 0,
            "boardIndex": 0,
            "IRQ": ["IRQ1"],
            "timeout": 200
        },
        "ADC": {
            "model": "V1729A",
            "address": "0x10000000",
            "triggerType": "software",
            "triggerSettings": ["rising"],
            "triggerThreshold": -20,
            "preTrig": 10000,
            "postTrig": 64,
            "samplingFrequency": "2GHz"
        }
    })
}

fn calibrate(root: &Value) {
    let bridge = experiment::simulated_bridge(root, 0).unwrap();
    experiment::calibrate(root, Box::new(bridge)).unwrap();
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count()
}

// =============================================================================
// Calibration
// =============================================================================

#[test]
fn test_calibrate_writes_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let root = tree(dir.path());
    let bridge = experiment::simulated_bridge(&root, 0).unwrap();

    let calibration = experiment::calibrate(&root, Box::new(bridge)).unwrap();

    assert!(calibration.pedestal[12..].iter().all(|&p| p == 1000));
    assert!(dir.path().join("calibration/pedestal.json").is_file());
    assert!(dir.path().join("calibration/vernier.json").is_file());
}

#[test]
fn test_calibration_directory_reused() {
    let dir = tempfile::tempdir().unwrap();
    let root = tree(dir.path());
    calibrate(&root);

    let bridge = experiment::simulated_bridge(&root, 0).unwrap();
    let err = experiment::calibrate(&root, Box::new(bridge)).unwrap_err();
    assert!(format!("{err:#}").contains("calibrationDirectory"));
}

// =============================================================================
// Acquisition
// =============================================================================

#[test]
fn test_acquire_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let root = tree(dir.path());
    calibrate(&root);

    let bridge = experiment::simulated_bridge(&root, 0).unwrap();
    let summary = experiment::acquire(&root, Box::new(bridge)).unwrap();

    let run = dir.path().join("run");
    assert_eq!(summary.output_directory, run);
    assert_eq!(summary.pulses, 2);
    assert_eq!(summary.integrals, 5);
    assert_eq!(summary.mean_integrals, [4000.0; 4]);

    // header plus one row per sample or event
    assert_eq!(line_count(&run.join(PULSES_FILE)), 1 + 2 * SAMPLES_PER_CHANNEL);
    assert_eq!(line_count(&run.join(INTEGRALS_FILE)), 1 + 5);
    let integrals = fs::read_to_string(run.join(INTEGRALS_FILE)).unwrap();
    assert!(integrals.starts_with("event,channel0,channel1,channel2,channel3"));
    assert!(integrals.lines().nth(1).unwrap().ends_with("4000,4000,4000,4000"));

    let snapshot: Value =
        serde_json::from_str(&fs::read_to_string(run.join(SETTINGS_FILE)).unwrap()).unwrap();
    assert_eq!(snapshot["experiment"]["nPulses"], json!(2));
    assert_eq!(snapshot["bridge"]["model"], json!("V2718"));
    assert_eq!(snapshot["ADC"]["address"], json!("0x10000000"));
}

#[test]
fn test_output_directory_reused() {
    let dir = tempfile::tempdir().unwrap();
    let root = tree(dir.path());
    calibrate(&root);
    fs::create_dir_all(dir.path().join("run")).unwrap();

    let bridge = experiment::simulated_bridge(&root, 0).unwrap();
    let err = experiment::acquire(&root, Box::new(bridge)).unwrap_err();
    assert!(format!("{err:#}").contains("outputDirectory"));
    assert!(!dir.path().join("run").join(PULSES_FILE).exists());
}

#[test]
fn test_acquire_without_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let root = tree(dir.path());

    let bridge = experiment::simulated_bridge(&root, 0).unwrap();
    let err = experiment::acquire(&root, Box::new(bridge)).unwrap_err();
    assert!(format!("{err:#}").contains("No usable calibration"));
    assert!(!dir.path().join("run").exists());
}

#[test]
fn test_load_tree_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = tree(dir.path());
    let path = dir.path().join("setup.json");
    fs::write(&path, serde_json::to_string_pretty(&root).unwrap()).unwrap();

    let loaded = load_tree(&path).unwrap();
    calibrate(&loaded);
    let config = ExperimentConfig::from_tree(&loaded)
        .unwrap()
        .with_pulses(0)
        .with_integrated_pulses(1);
    let bridge = experiment::simulated_bridge(&loaded, 0).unwrap();
    let summary = experiment::run(config, &loaded, Box::new(bridge)).unwrap();

    assert_eq!(summary.pulses, 0);
    assert_eq!(line_count(&dir.path().join("run").join(INTEGRALS_FILE)), 2);
}
