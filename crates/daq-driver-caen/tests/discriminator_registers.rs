//! Discriminator Register Test Suite
//!
//! Checks the register writes produced by the V895/V812 settings.
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_v895_register_writes` | thresholds, inhibit, width, majority |
//! | `test_v812_deadtime_registers` | dead time written to both halves |
//! | `test_a24_board` | A24/D16 addressing and modifiers |
//! | `test_d32_rejected` | unsupported transfer width |
//! | `test_invalid_setting_writes_nothing` | validation before any bus access |
//! | `test_test_pulse_and_module_info` | strobe and identification words |
//! | `test_settings_saved_with_defaults` | used default written back |

use std::sync::Arc;

use daq_driver_caen::discriminator::spec::registers;
use daq_driver_caen::{Discriminator, DiscriminatorModel};
use serde_json::{json, Value};
use vme_core::simulated::BusCall;
use vme_core::{
    AddressingMode, BusMaster, DataWidth, MasterConfig, ModeSet, SimulatedBackend, TransferMode,
};

const BASE: u64 = 0x2000_0000;

// =============================================================================
// Helpers
// =============================================================================

fn root(model: &str) -> Value {
    json!({
        "discriminator": {
            "model": model,
            "address": "0x20000000",
            "width": 25,
            "coincidence": 2,
            "threshold": { "CH00": -30, "CH03": -100, "CH15": -255 }
        }
    })
}

fn master(bridge: &SimulatedBackend) -> Arc<BusMaster> {
    Arc::new(BusMaster::open(MasterConfig::new("bridge"), Box::new(bridge.clone())).unwrap())
}

// =============================================================================
// Register writes
// =============================================================================

#[test]
fn test_v895_register_writes() {
    let bridge = SimulatedBackend::new();
    let disc = Discriminator::new("discriminator", &root("V895"), master(&bridge)).unwrap();
    assert_eq!(disc.model(), DiscriminatorModel::V895);

    assert_eq!(bridge.register(BASE + registers::THRESHOLD[0]), Some(30));
    assert_eq!(bridge.register(BASE + registers::THRESHOLD[3]), Some(100));
    assert_eq!(bridge.register(BASE + registers::THRESHOLD[15]), Some(255));
    assert_eq!(bridge.register(BASE + registers::THRESHOLD[1]), None);
    assert_eq!(bridge.register(BASE + registers::PATTERN_INHIBIT), Some(0x8009));
    assert_eq!(bridge.register(BASE + registers::OUTPUT_WIDTH_0_7), Some(25));
    assert_eq!(bridge.register(BASE + registers::OUTPUT_WIDTH_8_15), Some(25));
    assert_eq!(bridge.register(BASE + registers::MAJORITY_THRESHOLD), Some(19));
    assert_eq!(bridge.register(BASE + registers::DEADTIME_0_7), None);

    let widths: Vec<DataWidth> = bridge
        .calls()
        .iter()
        .filter_map(|call| match call {
            BusCall::WriteSingle { width, .. } => Some(*width),
            _ => None,
        })
        .collect();
    assert!(!widths.is_empty());
    assert!(widths.iter().all(|&w| w == DataWidth::D16));
}

#[test]
fn test_v812_deadtime_registers() {
    let mut root = root("V812");
    root["discriminator"]["deadtime"] = json!(150);
    let bridge = SimulatedBackend::new();
    let disc = Discriminator::new("discriminator", &root, master(&bridge)).unwrap();

    assert_eq!(disc.setup().deadtime, Some(0));
    assert_eq!(bridge.writes_to(BASE + registers::DEADTIME_0_7), vec![0]);
    assert_eq!(bridge.writes_to(BASE + registers::DEADTIME_8_15), vec![0]);
}

#[test]
fn test_a24_board() {
    let mut root = root("V895");
    root["discriminator"]["address"] = json!("0xEE0000");
    let bridge = SimulatedBackend::new();
    let modes = ModeSet::uniform(AddressingMode::A24, TransferMode::D16).unwrap();
    Discriminator::with_modes("discriminator", &root, master(&bridge), modes).unwrap();

    assert_eq!(bridge.register(0xEE_0000 + registers::PATTERN_INHIBIT), Some(0x8009));
    let a24_data = bridge.calls().iter().all(|call| match call {
        BusCall::WriteSingle { modifier, .. } => modifier.code == 0x39,
        _ => true,
    });
    assert!(a24_data);
}

#[test]
fn test_d32_rejected() {
    let bridge = SimulatedBackend::new();
    let modes = ModeSet::uniform(AddressingMode::A32, TransferMode::D32).unwrap();
    let err = Discriminator::with_modes("discriminator", &root("V895"), master(&bridge), modes)
        .unwrap_err();
    assert_eq!(err.kind(), "protocol_error");
}

#[test]
fn test_invalid_setting_writes_nothing() {
    let mut root = root("V895");
    root["discriminator"]["coincidence"] = json!(20);
    let bridge = SimulatedBackend::new();
    let err = Discriminator::new("discriminator", &root, master(&bridge)).unwrap_err();

    assert_eq!(err.kind(), "configuration_value_error");
    assert!(err.to_string().contains("coincidence"));
    assert!(!bridge
        .calls()
        .iter()
        .any(|call| matches!(call, BusCall::WriteSingle { .. })));
}

// =============================================================================
// Runtime operations
// =============================================================================

#[test]
fn test_test_pulse_and_module_info() {
    let bridge = SimulatedBackend::new();
    let disc = Discriminator::new("discriminator", &root("V812"), master(&bridge)).unwrap();
    bridge.set_register(BASE + registers::FIXED_CODE, 0xFAF5);
    bridge.set_register(BASE + registers::MODULE_TYPE, (0x02 << 10) | 0x51);
    bridge.set_register(BASE + registers::VERSION_SERIAL, 0x1042);

    disc.send_test_pulse().unwrap();
    assert_eq!(bridge.writes_to(BASE + registers::TEST_PULSE), vec![1]);

    let info = disc.module_info().unwrap();
    assert_eq!(info.fixed_code, 0xFAF5);
    assert_eq!(info.manufacturer, 2);
    assert_eq!(info.module_type, 0x51);
    assert_eq!(info.version, 1);
    assert_eq!(info.serial, 0x42);
}

#[test]
fn test_settings_saved_with_defaults() {
    let mut tree = root("V895");
    tree["discriminator"]
        .as_object_mut()
        .unwrap()
        .remove("coincidence");
    let bridge = SimulatedBackend::new();
    let disc = Discriminator::new("discriminator", &tree, master(&bridge)).unwrap();
    assert_eq!(disc.setup().majority, 1);

    let mut saved = json!({});
    disc.save_settings(&mut saved);
    assert_eq!(saved["discriminator"]["width"], json!(25));
    assert_eq!(saved["defaults"]["V895"]["coincidence"], json!(1));
}
