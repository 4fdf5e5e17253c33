//! Config command handlers.

use anyhow::{Context, Result};
use schoolhub_core::config;

pub fn path() {
    println!("{}", config::paths::config_path().display());
}

pub fn init() -> Result<()> {
    let config_path = config::paths::config_path();
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}

pub fn set_project(project_id: &str, api_key: Option<&str>) -> Result<()> {
    let config_path = config::paths::config_path();
    config::Config::save_project_to(&config_path, project_id, api_key)
        .with_context(|| format!("update config at {}", config_path.display()))?;
    println!("Using project {project_id} ({})", config_path.display());
    Ok(())
}
