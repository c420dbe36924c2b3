use anyhow::Result;

use super::commands::Commands;
use super::config::cmd_config;
use super::context::CliContext;
use super::env::CliArgs;
use super::info::cmd_info;
use super::render::cmd_render;
use super::sign::cmd_sign;

pub async fn dispatch(cli: &CliArgs, ctx: &CliContext) -> Result<()> {
    match cli.command.clone() {
        Commands::Render(args) => cmd_render(args, ctx).await,
        Commands::Sign(args) => cmd_sign(args, ctx).await,
        Commands::Info(args) => cmd_info(args, ctx).await,
        Commands::Config(args) => cmd_config(args, ctx).await,
    }
}
