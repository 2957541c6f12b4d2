//! Config command handlers

use std::path::PathBuf;

use anyhow::Result;

use synctable_core::Config;

use crate::output::{Output, OutputFormat};

/// Show the effective configuration
pub fn show(config: &Config, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.url);
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  url:                  {}", config.url);
            println!("  bind:                 {}", config.bind);
            println!("  flush_interval_ms:    {}", config.flush_interval_ms);
            println!("  save_timeout_ms:      {}", config.save_timeout_ms);
            println!("  reconnect_initial_ms: {}", config.reconnect_initial_ms);
            println!("  reconnect_max_ms:     {}", config.reconnect_max_ms);
            println!("  write_buffer:         {}", config.write_buffer);
            println!("  log_level:            {}", config.log_level);
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

    Ok(())
}

/// Print the config file path
pub fn path(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let path = effective_path(config_path);
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "path": path,
                    "exists": path.exists()
                })
            );
        }
        _ => println!("{}", path.display()),
    }
    Ok(())
}

fn effective_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path)
}
