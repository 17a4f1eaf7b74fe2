use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use owo_colors::OwoColorize;

use bucketfs_daemon::{logging, DaemonConfig};

mod cli;

use cli::op::{Op, OpContext};
use cli::ops;

crate::command_enum! {
    /// Mount a bucket and serve it until interrupted or unmounted
    #[cfg(feature = "fuse")]
    (Mount, ops::Mount),
    /// List remote objects without mounting
    (Ls, ops::Ls),
    /// Show the effective configuration
    (Config, ops::Config),
}

#[derive(Parser, Debug)]
#[command(name = "bucketfs", version, about = "Mount an object storage bucket as a local filesystem")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, short, global = true, env = "BUCKETFS_CONFIG")]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config file; a broken file is reported
    // by the command itself.
    let log = DaemonConfig::load(cli.config.as_deref())
        .map(|config| config.log)
        .unwrap_or_default();
    let level = logging::level_for_verbosity(&log.level, cli.verbose);
    let _guard = logging::init(&level, log.dir.as_deref());

    let ctx = OpContext::new(cli.config);
    match cli.command.execute(&ctx).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}
