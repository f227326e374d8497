//! App-layer engine configuration

use serde::{Deserialize, Serialize};

/// Configuration for the app-layer dispatch engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppLayerConfig {
    /// Enable app-layer inspection
    pub enabled: bool,

    /// Inline (IPS) mode: the opposing-stream drain uses the inline
    /// reassembly entry point and drives it in the data direction
    pub inline_mode: bool,
}

impl Default for AppLayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inline_mode: false,
        }
    }
}
