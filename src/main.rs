use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use questsync::app::App;
use questsync::commands::Command;
use questsync::config::Config;
use questsync::logging;

#[derive(Parser, Debug)]
#[command(name = "questsync")]
#[command(about = "Download, offload and repair cached quest content")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/questsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Profile whose downloads are managed
  #[arg(short, long)]
  profile: Option<String>,

  /// Never contact the remote store
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override profile if specified on command line
  let config = if let Some(profile) = args.profile {
    Config {
      profile_id: Some(profile),
      ..config
    }
  } else {
    config
  };

  let _log_guard = logging::init(&config.data_dir()?.join("logs"), config.log_filter.as_deref())?;

  let app = App::new(&config, args.offline)?;
  let output = app.execute(&args.command).await?;
  print!("{}", output);

  Ok(())
}
