// SPDX-License-Identifier: GPL-3.0-only

//! Configuration loading: `config.ron` from the XDG config directory,
//! with environment overrides for the control flags.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::utils::env::{bool_var, usize_var};
use dpu_comp_config::DpuCompConfig;

const XDG_PREFIX: &str = "dpu-comp";

pub fn load_config() -> DpuCompConfig {
    let mut config = match read_config_file() {
        Ok(Some(config)) => config,
        Ok(None) => {
            info!("no config file, using defaults");
            DpuCompConfig::default()
        }
        Err(err) => {
            warn!(?err, "failed to read config, using defaults");
            DpuCompConfig::default()
        }
    };
    apply_env_overrides(&mut config);
    config
}

fn read_config_file() -> Result<Option<DpuCompConfig>> {
    let xdg = xdg::BaseDirectories::with_prefix(XDG_PREFIX)
        .context("failed to resolve XDG directories")?;
    let Some(path) = xdg.find_config_file("config.ron") else {
        return Ok(None);
    };
    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let config = ron::de::from_reader(file)
        .with_context(|| format!("malformed config at {}", path.display()))?;
    info!("loaded config from {}", path.display());
    Ok(Some(config))
}

fn apply_env_overrides(config: &mut DpuCompConfig) {
    if let Some(value) = bool_var("DPU_COMP_SKIP_STATIC_LAYERS") {
        config.controls.skip_static_layers = value;
    }
    if let Some(value) = bool_var("DPU_COMP_SKIP_VALIDATE") {
        config.controls.skip_validate = value;
    }
    if let Some(value) = bool_var("DPU_COMP_SKIP_WINDOW_CONFIG") {
        config.controls.skip_window_config = value;
    }
    if let Some(value) = usize_var("DPU_COMP_PLANES") {
        config.hardware.plane_count = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_ron() {
        let config = DpuCompConfig::default();
        let text = ron::ser::to_string(&config).unwrap();
        let back: DpuCompConfig = ron::de::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn partial_ron_is_rejected_loudly() {
        assert!(ron::de::from_str::<DpuCompConfig>("(controls: ())").is_err());
    }
}
