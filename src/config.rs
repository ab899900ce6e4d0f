use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::BudgetAllocation;
use crate::orchestration::ProcessConfig;
use crate::workflow::{Repeat, RepeatConfig};
use crate::{mlog_debug, Error, Result};

/// Settings loaded from `~/.maestro/maestro.toml`.
///
/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub process: ProcessConfig,
    pub budget: BudgetAllocation,
    pub repeat: RepeatConfig,
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        mlog_debug!(
            "Config loaded: mode={}, strategy={}, model_limit={}",
            config.process.mode,
            config.process.strategy,
            config.budget.model_limit
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                mlog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Loop preset from the `[repeat]` section, without a stop condition.
    pub fn repeat_loop(&self) -> Repeat {
        Repeat::from_config(&self.repeat)
    }

    /// Check the process, budget and repeat settings together.
    ///
    /// # Errors
    ///
    /// Returns `BudgetConfiguration` or `Validation` as the process would at
    /// construction, or `Validation` for a zero iteration limit.
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        self.process.validate()?;
        if self.repeat.max_iterations == 0 {
            return Err(Error::Validation(
                "repeat.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
