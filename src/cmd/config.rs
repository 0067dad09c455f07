//! Configuration view and validation commands for `mender config`.

use crate::ConfigCommands;
use anyhow::Result;
use console::style;
use mender::config::{CONFIG_FILE, MenderToml};
use std::path::Path;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE);
    let config = MenderToml::load_or_default(project_dir)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found, showing defaults", CONFIG_FILE);
            }
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{} configuration is valid", style("ok:").green().bold());
            } else {
                for warning in &warnings {
                    println!("{} {}", style("warning:").yellow().bold(), warning);
                }
                anyhow::bail!("{} configuration warning(s)", warnings.len());
            }
        }
    }
    Ok(())
}
