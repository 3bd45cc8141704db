use crate::config::generate::generate_starter_config;
use crate::config::{system_config_path, user_config_path};
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Prefer ~/.config/twitter-to-kafka/config.yml, fall back to /etc
    let config_path = match user_config_path() {
        Some(user_config) => match user_config.parent().map(fs::create_dir_all) {
            Some(Err(_)) | None => {
                let fallback = system_config_path();
                eprintln!("Warning: Could not create directory for {}", user_config.display());
                eprintln!("Falling back to {}", fallback.display());
                fallback
            }
            Some(Ok(())) => user_config,
        },
        None => system_config_path(),
    };

    write_config(&config_content, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// Write a config file, refusing to overwrite an existing one
pub fn write_config(
    config_content: &str,
    path: &Path,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            path.display()
        )
        .into());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)?;
    Ok(path.to_path_buf())
}
