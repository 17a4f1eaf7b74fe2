use std::path::PathBuf;

use bucketfs_daemon::{ConfigError, DaemonConfig};

/// State shared by every command.
#[derive(Debug, Clone)]
pub struct OpContext {
    /// Explicit `--config` path, if one was given.
    pub config_path: Option<PathBuf>,
}

impl OpContext {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }

    pub fn load_config(&self) -> Result<DaemonConfig, ConfigError> {
        DaemonConfig::load(self.config_path.as_deref())
    }
}

/// A CLI command. Output is printed with `Display`.
#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Output: std::fmt::Display;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

/// Build a clap `Command` enum from `(Variant, Type)` pairs, plus matching
/// `OpError`/`OpOutput` enums and an `Op` impl that dispatches to each
/// variant. Attributes before a pair (e.g. `#[cfg(...)]`) apply to all of
/// its generated items.
#[macro_export]
macro_rules! command_enum {
    ($($(#[$meta:meta])* ($variant:ident, $ty:ty)),* $(,)?) => {
        #[derive(clap::Subcommand, Debug, Clone)]
        pub enum Command {
            $($(#[$meta])* $variant($ty),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                $(#[$meta])*
                #[error(transparent)]
                $variant(<$ty as $crate::cli::op::Op>::Error),
            )*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($(#[$meta])* $variant(<$ty as $crate::cli::op::Op>::Output),)*
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($(#[$meta])* OpOutput::$variant(output) => write!(f, "{output}"),)*
                }
            }
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Error = OpError;
            type Output = OpOutput;

            async fn execute(
                &self,
                ctx: &$crate::cli::op::OpContext,
            ) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        $(#[$meta])*
                        Command::$variant(op) => op
                            .execute(ctx)
                            .await
                            .map(OpOutput::$variant)
                            .map_err(OpError::$variant),
                    )*
                }
            }
        }
    };
}
