//! CAEN VME bridge models.
//!
//! A bridge is the [`BusMaster`] of a crate. The vendor library itself is an
//! external collaborator behind [`BusBackend`]; this module knows the models,
//! their block transfer quirks and how a bridge is configured.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use vme_core::{
    BackendLimits, BusBackend, BusMaster, MasterConfig, Result, Settings, TransferMode, Translator,
};

/// MBLT block length the V2718 sustains reliably.
pub const V2718_MBLT_BLOCK_LIMIT: usize = 96;

/// Supported CAEN bridge models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeModel {
    /// V1718 USB bridge.
    V1718,
    /// V2718 optical link bridge (A2818/A3818 PCI cards).
    V2718,
}

/// Model names accepted in the `model` key.
pub const BRIDGE_MODELS: Translator<BridgeModel> = Translator::new(&[
    ("V1718", BridgeModel::V1718),
    ("V2718", BridgeModel::V2718),
    ("CAEN_VX1718", BridgeModel::V1718),
    ("CAEN_VX2718", BridgeModel::V2718),
]);

impl BridgeModel {
    /// Block length limits of this model.
    ///
    /// The V2718 drops data on full-length MBLT cycles and is de-rated.
    pub fn limits(self) -> BackendLimits {
        match self {
            BridgeModel::V1718 => BackendLimits::nominal(),
            BridgeModel::V2718 => BackendLimits::nominal()
                .with_block_limit(TransferMode::Mblt, V2718_MBLT_BLOCK_LIMIT),
        }
    }
}

impl fmt::Display for BridgeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeModel::V1718 => write!(f, "V1718"),
            BridgeModel::V2718 => write!(f, "V2718"),
        }
    }
}

/// Configured bridge ready to be opened.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge model.
    pub model: BridgeModel,
    /// Session parameters.
    pub master: MasterConfig,
    /// Resolved settings, including materialized defaults.
    pub settings: Settings,
}

impl BridgeConfig {
    /// Read the bridge named `identifier` from `root`.
    pub fn from_tree(root: &Value, identifier: &str) -> Result<Self> {
        let mut settings = Settings::load(root, identifier)?;
        let model = settings.translate("model", &BRIDGE_MODELS)?;
        let master = MasterConfig::from_settings(identifier, &mut settings)?;
        Ok(Self {
            model,
            master,
            settings,
        })
    }

    /// Open the session on `backend`, applying the model's limits.
    pub fn open(&self, backend: Box<dyn BusBackend>) -> Result<Arc<BusMaster>> {
        let master =
            BusMaster::open_with_limits(self.master.clone(), backend, &self.model.limits())?;
        master.span().in_scope(|| {
            info!(
                model = %self.model,
                mblt_block = master.max_block_elements(TransferMode::Mblt),
                "CAEN bridge ready"
            )
        });
        Ok(Arc::new(master))
    }
}

/// Configure and open the bridge named `identifier` on `backend`.
///
/// # Errors
///
/// Configuration errors for a missing `linkIndex`/`boardIndex`, unknown
/// model or IRQ names and a zero `timeout`; bus errors when the session
/// cannot be opened.
pub fn open_master(
    root: &Value,
    identifier: &str,
    backend: Box<dyn BusBackend>,
) -> Result<Arc<BusMaster>> {
    BridgeConfig::from_tree(root, identifier)?.open(backend)
}
