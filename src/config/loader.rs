use super::schema::APP_DIR;
use super::Config;
use anyhow::{Context, Result};
use directories::UserDirs;
use std::fs;
use std::path::Path;

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let mut config = Self::load_or_init_in(&home.join(APP_DIR))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads `<app_dir>/config.toml`, writing defaults on first use.
    pub fn load_or_init_in(app_dir: &Path) -> Result<Self> {
        let config_path = app_dir.join("config.toml");
        let workspace_dir = app_dir.join("workspace");

        if !app_dir.exists() {
            fs::create_dir_all(app_dir)
                .with_context(|| format!("Failed to create {}", app_dir.display()))?;
        }
        fs::create_dir_all(&workspace_dir).context("Failed to create workspace directory")?;

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path.clone_from(&config_path);
            config.workspace_dir = workspace_dir;

            let secrets_need_persist = config.open_password_in_place()?;
            if secrets_need_persist {
                config.save()?;
            }
            Ok(config)
        } else {
            let config = Self {
                config_path,
                workspace_dir,
                ..Self::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let persisted = self.config_for_persistence()?;
        let toml_str = toml::to_string_pretty(&persisted).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}
