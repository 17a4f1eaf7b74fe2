use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;

use bucketfs_daemon::{ConfigError, DaemonConfig};

use crate::cli::op::{Op, OpContext};

/// Print the effective configuration.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Print only where the config file is looked up
    #[arg(long)]
    pub path: bool,
}

#[derive(Debug)]
pub enum ConfigOutput {
    Path(Option<PathBuf>),
    Effective(String),
}

impl fmt::Display for ConfigOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOutput::Path(Some(path)) => write!(f, "{}", path.display()),
            ConfigOutput::Path(None) => write!(f, "{}", "no config directory on this platform".yellow()),
            ConfigOutput::Effective(toml) => write!(f, "{}", toml.trim_end()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigOpError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

#[async_trait::async_trait]
impl Op for Config {
    type Error = ConfigOpError;
    type Output = ConfigOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        if self.path {
            let path = ctx.config_path.clone().or_else(DaemonConfig::default_path);
            return Ok(ConfigOutput::Path(path));
        }
        let config = ctx.load_config()?;
        Ok(ConfigOutput::Effective(config.to_toml()?))
    }
}
