use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "matrix-bridge-viber",
    about = "A bridge between Matrix and Viber",
    version
)]
pub struct Cli {
    #[arg(
        short,
        long,
        env = "CONFIG_PATH",
        default_value = "config.yaml",
        help = "Path to the YAML configuration file. A missing file falls back to defaults plus environment overrides."
    )]
    pub config: PathBuf,

    #[arg(
        long,
        help = "Start without calling Viber set_webhook, for local runs against an already registered URL."
    )]
    pub skip_webhook_registration: bool,
}
