//! Configuration view and validation commands: `paperflow config`.

use anyhow::{Context, Result};
use std::path::Path;

use paperflow::paperflow_config::{
    CONFIG_DIR, CONFIG_FILE, DEFAULT_CONFIG_TEMPLATE, PaperflowConfig, PaperflowToml,
};

use super::super::{Cli, ConfigCommands};

fn print_toml(toml: &PaperflowToml) {
    println!("[worker]");
    println!("  base_url = \"{}\"", toml.worker.base_url);
    if let Some(ws) = &toml.worker.ws_base_url {
        println!("  ws_base_url = \"{}\"", ws);
    }
    println!("  request_timeout_secs = {}", toml.worker.request_timeout_secs);
    println!("  connect_timeout_secs = {}", toml.worker.connect_timeout_secs);
    println!();
    println!("[pipeline]");
    println!("  settle_delay_ms = {}", toml.pipeline.settle_delay_ms);
    println!("  log_capacity = {}", toml.pipeline.log_capacity);
    println!("  progress_capacity = {}", toml.pipeline.progress_capacity);
    println!();
    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = \"{}\"", toml.logging.format);
    if let Some(dir) = &toml.logging.dir {
        println!("  dir = \"{}\"", dir.display());
    }
    println!();
}

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => project_dir.join(CONFIG_DIR).join(CONFIG_FILE),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Paperflow Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No paperflow.toml found at {}", config_path.display());
                println!("Using default configuration:");
            }
            println!();

            let config = PaperflowConfig::with_cli_args(
                project_dir.to_path_buf(),
                cli.config.clone().filter(|p| p.exists()),
                cli.verbose,
                cli.base_url.clone(),
            )?;
            print_toml(&config.toml);

            println!("Effective values (with env/CLI overrides):");
            println!("  base_url = \"{}\"", config.base_url());
            match config.ws_base_url() {
                Ok(ws) => println!("  ws_base_url = \"{}\"", ws),
                Err(e) => println!("  ws_base_url = <invalid: {:#}>", e),
            }
            let logging = config.logging();
            println!("  log_level = \"{}\"", logging.level);
            if let Some(dir) = &logging.dir {
                println!("  log_dir = \"{}\"", dir.display());
            }
            println!();

            if !config_path.exists() {
                println!("Run 'paperflow config init' to create a paperflow.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() && cli.base_url.is_none() {
                let warnings = PaperflowToml::default().validate();
                if warnings.is_empty() {
                    println!("No paperflow.toml found. Using defaults (valid).");
                    return Ok(());
                }
            }

            let config = PaperflowConfig::with_cli_args(
                project_dir.to_path_buf(),
                cli.config.clone().filter(|p| p.exists()),
                cli.verbose,
                cli.base_url.clone(),
            )?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("paperflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
            std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE).with_context(|| {
                format!("Failed to write config file: {}", config_path.display())
            })?;

            println!("Created paperflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [worker] base_url, ws_base_url, timeouts");
            println!("  - [pipeline] settle_delay_ms, history capacities");
            println!("  - [logging] level, format, dir");
            println!();
        }
    }

    Ok(())
}
