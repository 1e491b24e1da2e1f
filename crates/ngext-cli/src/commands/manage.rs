use anyhow::{Context, Result};
use ngext_config::GlobalConfig;

/// Show or edit the global configuration
pub async fn config(edit: bool) -> Result<()> {
    let config_path = GlobalConfig::config_path()?;

    if edit {
        let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

        if !config_path.exists() {
            GlobalConfig::default().save()?;
            println!("Created default config at {:?}", config_path);
        }

        std::process::Command::new(&editor)
            .arg(&config_path)
            .status()
            .context(format!("Failed to open editor: {}", editor))?;

        GlobalConfig::load_from(&config_path)?;
    } else {
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            println!("# Config file: {:?}\n", config_path);
            println!("{}", content);
        } else {
            println!("# Config file: {:?} (not created yet)\n", config_path);
            println!("# Default configuration:");
            let content = toml::to_string_pretty(&GlobalConfig::default())?;
            println!("{}", content);
            println!("\n# Run 'ngext config --edit' to create and edit the config file.");
        }
        println!("# Data directory: {:?}", GlobalConfig::data_dir()?);
    }

    Ok(())
}
