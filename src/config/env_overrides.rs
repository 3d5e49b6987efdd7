use super::Config;
use std::path::PathBuf;

impl Config {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(login) = std::env::var("BYTEL_LOGIN")
            && !login.is_empty()
        {
            self.portal.login = Some(login);
        }

        if let Ok(password) = std::env::var("BYTEL_PASSWORD")
            && !password.is_empty()
        {
            self.portal.password = Some(password);
        }

        if let Ok(workspace) = std::env::var("BYTEL_WORKSPACE")
            && !workspace.is_empty()
        {
            self.workspace_dir = PathBuf::from(shellexpand::tilde(&workspace).into_owned());
        }

        if let Ok(level) = std::env::var("BYTEL_LOG_LEVEL")
            && !level.is_empty()
        {
            self.observability.log_level = level;
        }

        if let Ok(flag) = std::env::var("BYTEL_FORCE_FULL")
            && let Ok(force) = flag.trim().parse::<bool>()
        {
            self.sync.force_full = force;
        }
    }
}
