//! Config file layout for plcprobe
//!
//! One file holds the link sections (`network`, `peer`, `recovery`,
//! `buffers`) next to an optional `logging` section. Environment variables
//! use the `PLCLINK_` prefix, e.g. `PLCLINK_PEER__IP=10.0.0.5`.

use std::path::Path;

use anyhow::{Context, Result};
use common::{config_loader, LoggingConfig};
use w5500_modbus::LinkConfig;

pub const ENV_PREFIX: &str = "PLCLINK";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub link: LinkConfig,
    pub logging: LoggingConfig,
}

pub fn load(path: Option<&Path>) -> Result<Settings> {
    let link: LinkConfig = config_loader::load_config(path, ENV_PREFIX)?;
    link.validate().context("invalid link configuration")?;

    // LinkConfig ignores the logging section; pick it out on its own
    let logging: LoggingConfig = config_loader::figment_for::<LinkConfig>(path, ENV_PREFIX)?
        .focus("logging")
        .extract()
        .context("invalid logging section")?;

    Ok(Settings { link, logging })
}
