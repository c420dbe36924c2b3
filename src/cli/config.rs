use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use pdfpipe::AppConfig;
use tokio::fs;

use super::context::CliContext;
use super::output::{print_json, OutputFormat};

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration (file, defaults and environment overrides)
    Show,

    /// Print the configuration file path in use
    Path,

    /// Parse the configuration file without applying it
    Validate,
}

pub async fn cmd_config(args: ConfigArgs, ctx: &CliContext) -> Result<()> {
    let path = ctx.config_path();
    match args.action {
        ConfigAction::Show => match ctx.format() {
            OutputFormat::Json => print_json(ctx.config())?,
            OutputFormat::Human => {
                println!("# {}", path.display());
                print!("{}", ctx.config().to_yaml()?);
            }
        },
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Validate => {
            if fs::try_exists(path).await? {
                let raw = fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                AppConfig::from_yaml(&raw).with_context(|| format!("parsing {}", path.display()))?;
                println!("Configuration file {} is valid", path.display());
            } else {
                println!(
                    "No configuration file at {}; defaults are valid",
                    path.display()
                );
            }
        }
    }

    Ok(())
}
